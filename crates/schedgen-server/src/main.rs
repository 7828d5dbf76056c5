use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libschedgen::{Orchestrator, resolve_python};
use schedgen_protocol::{HEALTH_ROUTE, SCHEDULE_ROUTE};
use schedgen_server::{AppState, Cli, ServerConfig, build_cors, router};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schedgen_server=info,libschedgen=info".into()),
        )
        .init();

    let config = ServerConfig::load(Cli::parse())?;

    let interpreter = resolve_python(config.python.as_deref()).await?;
    tracing::info!(
        interpreter = %interpreter.program.display(),
        version = %interpreter.version,
        script = %config.script.display(),
        "worker command ready"
    );

    let settings = config.session_settings(interpreter.program);
    let orchestrator = Orchestrator::new(settings, config.shared_secret.clone());
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(orchestrator, shutdown.clone()));

    let app = router(state).layer(build_cors(&config.allow_origins)?);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    tracing::info!("schedgen-server listening on http://{}", config.listen);
    tracing::info!("POST {SCHEDULE_ROUTE} to generate a schedule, GET {HEALTH_ROUTE} for health");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down, cancelling running sessions");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
