#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use libschedgen::{Orchestrator, SessionSettings, WorkerCommand};
use schedgen_crypto::{SharedSecret, derive_key, encrypt};
use schedgen_protocol::MAX_REQUEST_BODY_BYTES;
use schedgen_server::{AppState, build_cors, router};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

fn app(script: &Path, dump_dir: Option<PathBuf>) -> axum::Router {
    let settings = SessionSettings::new(WorkerCommand::new("sh").arg(script))
        .with_input_delay(Duration::ZERO)
        .with_debug_dump_dir(dump_dir);
    let orchestrator = Orchestrator::new(settings, SharedSecret::new(SECRET));
    router(Arc::new(AppState::new(orchestrator, CancellationToken::new())))
}

fn post(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/generate-schedule")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_reports_running() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&write_script(dir.path(), "exit 0"), None);

    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Schedule Generator API is running\n");
}

#[tokio::test]
async fn invalid_json_is_reported_in_band() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&write_script(dir.path(), "exit 0"), None);

    let response = app.oneshot(post("{not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let text = body_text(response).await;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1, "{text}");
    let doc: Value = serde_json::from_str(lines[0]).unwrap();
    assert!(doc["error"].as_str().unwrap().starts_with("Invalid JSON: "));
}

#[tokio::test]
async fn empty_body_is_reported_in_band() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&write_script(dir.path(), "exit 0"), None);

    let response = app.oneshot(post(Body::empty())).await.unwrap();

    assert_eq!(
        body_text(response).await,
        "{\"error\":\"No JSON data received.\"}\n"
    );
}

#[tokio::test]
async fn oversized_body_is_reported_in_band_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let script = write_script(dir.path(), &format!("touch '{}'", marker.display()));

    let response = app(&script, None)
        .oneshot(post(vec![b' '; MAX_REQUEST_BODY_BYTES + 1]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        format!("{{\"error\":\"Request body exceeds the {MAX_REQUEST_BODY_BYTES} byte limit\"}}\n")
    );
    assert!(!marker.exists());
}

#[tokio::test]
async fn body_at_the_limit_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&write_script(dir.path(), "exit 0"), None);

    let response = app
        .oneshot(post(vec![b' '; MAX_REQUEST_BODY_BYTES]))
        .await
        .unwrap();

    // Read in full, then rejected as blank by the session.
    assert_eq!(
        body_text(response).await,
        "{\"error\":\"No JSON data received.\"}\n"
    );
}

#[tokio::test]
async fn worker_round_trip_streams_progress_then_result() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        r#"read -r secret
read -r payload
[ "$secret" = "integration-secret" ] || exit 3
echo "Starting genetic algorithm"
echo "Generation 12 Best fitness: 0.97"
echo "warning: slow constraint" >&2
printf '%s\n' "$payload" | fold -w 32
echo "Finalizing schedule""#,
    );
    let request = json!({"school": "South", "rooms": ["A1", "B2"], "periods": [1, 2, 3, 4]});

    let response = app(&script, None)
        .oneshot(post(request.to_string()))
        .await
        .unwrap();
    let text = body_text(response).await;
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 5, "{text}");
    // stderr interleaves with stdout at an arbitrary point
    let (stderr_lines, progress): (Vec<&str>, Vec<&str>) =
        lines[..4].iter().copied().partition(|l| l.starts_with("[ERROR]"));
    assert_eq!(stderr_lines, vec!["[ERROR] warning: slow constraint"]);
    assert_eq!(
        progress,
        vec![
            "[PROGRESS] Starting genetic algorithm",
            "[PROGRESS] Generation 12 Best fitness: 0.97",
            "[PROGRESS] Finalizing schedule",
        ]
    );
    let result: Value = serde_json::from_str(lines[4]).unwrap();
    assert_eq!(result, request);
}

#[tokio::test]
async fn undecryptable_output_returns_raw_preview() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "cat >/dev/null\necho 'definitely not base64!'");

    let response = app(&script, None).oneshot(post("{}")).await.unwrap();
    let text = body_text(response).await;
    let doc: Value = serde_json::from_str(text.trim_end()).unwrap();

    assert_eq!(doc["error"], "Decryption or parsing failed");
    assert_eq!(doc["raw"], "definitely not base64!...");
    assert!(doc["details"].as_str().is_some());
}

#[tokio::test]
async fn worker_result_is_decrypted_with_shared_secret() {
    let dir = tempfile::tempdir().unwrap();
    let key = derive_key(&SharedSecret::new(SECRET));
    let envelope = encrypt(br#"{"timetable":{"mon":["math"]},"all_schedule":[1]}"#, &key);
    let script = write_script(dir.path(), &format!("cat >/dev/null\necho '{envelope}'"));

    let response = app(&script, None).oneshot(post("{}")).await.unwrap();

    assert_eq!(
        body_text(response).await,
        "{\"timetable\":{\"mon\":[\"math\"]}}\n"
    );
}

#[tokio::test]
async fn first_line_arrives_before_worker_finishes_and_disconnect_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let dumps = dir.path().join("dumps");
    let script = write_script(
        dir.path(),
        "cat >/dev/null\necho 'Starting genetic algorithm'\nexec sleep 30",
    );

    let response = app(&script, Some(dumps.clone()))
        .oneshot(post(r#"{"school":"East"}"#))
        .await
        .unwrap();
    let mut body = response.into_body();

    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("first line should stream before the worker exits")
        .unwrap()
        .unwrap();
    assert_eq!(
        frame.into_data().unwrap(),
        "[PROGRESS] Starting genetic algorithm\n"
    );
    assert_eq!(std::fs::read_dir(&dumps).unwrap().count(), 1);

    drop(body);

    tokio::time::timeout(Duration::from_secs(5), async {
        while std::fs::read_dir(&dumps).unwrap().count() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("debug dump should be removed after disconnect");
}

#[tokio::test]
async fn permissive_cors_answers_preflight() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&write_script(dir.path(), "exit 0"), None).layer(build_cors(&[]).unwrap());

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/generate-schedule")
                .header(header::ORIGIN, "http://frontend.example")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

#[tokio::test]
async fn restricted_cors_only_echoes_listed_origin() {
    let dir = tempfile::tempdir().unwrap();
    let origins = vec!["http://school.example".to_string()];
    let app = app(&write_script(dir.path(), "exit 0"), None).layer(build_cors(&origins).unwrap());

    let preflight = |origin: &'static str| {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/generate-schedule")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap()
    };

    let allowed = app
        .clone()
        .oneshot(preflight("http://school.example"))
        .await
        .unwrap();
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://school.example"
    );

    let denied = app.oneshot(preflight("http://other.example")).await.unwrap();
    assert!(
        denied
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}
