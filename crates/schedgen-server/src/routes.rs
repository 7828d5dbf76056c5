use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use libschedgen::Orchestrator;
use schedgen_protocol::{
    HEALTH_MESSAGE, HEALTH_ROUTE, MAX_REQUEST_BODY_BYTES, SCHEDULE_ROUTE, StreamLine,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Lines buffered between the session task and the response body.
const LINE_BUFFER: usize = 64;

pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Parent of every session's cancel token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(SCHEDULE_ROUTE, post(generate_schedule))
        .route(HEALTH_ROUTE, get(health))
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let headers = origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("invalid allow-origin value: {origin}"))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(headers)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

async fn health() -> &'static str {
    HEALTH_MESSAGE
}

/// Buffer the request body, turning an oversized or broken upload into the
/// failure line the caller will receive.
async fn read_body(body: Body) -> Result<Bytes, StreamLine> {
    match Limited::new(body, MAX_REQUEST_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            tracing::warn!(limit = MAX_REQUEST_BODY_BYTES, "request body too large");
            Err(StreamLine::failure(format!(
                "Request body exceeds the {MAX_REQUEST_BODY_BYTES} byte limit"
            )))
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to read request body");
            Err(StreamLine::failure(format!("Failed to read request body: {err}")))
        }
    }
}

/// POST /generate-schedule - stream one session's lines back as they happen.
///
/// Every outcome is a 200 with the verdict in the last line, including a
/// body that is too large to accept. Dropping the response drops the
/// receiver, which the session treats as a disconnect and kills its worker.
async fn generate_schedule(State(state): State<Arc<AppState>>, body: Body) -> Response {
    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);

    match read_body(body).await {
        Ok(body) => {
            let orchestrator = state.orchestrator.clone();
            let cancel = state.shutdown.child_token();
            tokio::spawn(async move {
                let report = orchestrator.run(&body, line_tx, cancel).await;
                tracing::info!(
                    session_id = %report.session_id,
                    state = ?report.state,
                    lines = report.lines_sent,
                    fragments = report.fragments,
                    "session finished"
                );
            });
        }
        Err(line) => {
            let _ = line_tx.try_send(line);
        }
    }

    let stream = ReceiverStream::new(line_rx)
        .map(|line| Ok::<_, Infallible>(Bytes::from(line.render())));

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
