//! Web server mode: an axum gateway in front of the build cache.

mod state;
mod stream;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{Router, extract::State, http::StatusCode, routing::post};
use tokio::sync::oneshot;

use crate::RunOptions;
use crate::engine::BuildEngine;
use state::AppState;

#[tokio::main]
pub async fn run_web(options: RunOptions, engine: Arc<dyn BuildEngine>) -> Result<()> {
    let port = options
        .port
        .unwrap_or_else(|| options.settings.web_default_port());
    let launch_browser = options.settings.web_launch_browser();

    let (app, shutdown_rx) = create_app(&options, engine);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}");
    log::info!("Listening on {url}");

    if launch_browser {
        tokio::task::spawn_blocking(move || {
            let _ = webbrowser::open(&url); // best-effort
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            log::info!("Shutdown complete.");
        })
        .await?;

    Ok(())
}

pub fn create_app(
    options: &RunOptions,
    engine: Arc<dyn BuildEngine>,
) -> (Router, oneshot::Receiver<()>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let state = AppState::new(engine, &options.settings, shutdown_tx);

    let app = Router::new()
        .nest("/api", stream::router())
        // tab-liveness triggers
        .route("/api/trigger/heartbeat", post(heartbeat))
        .route("/api/trigger/begin_shutdown", post(begin_shutdown))
        .route("/api/trigger/end_shutdown", post(end_shutdown))
        .with_state(state.clone());

    // shut down once no tab has pinged for the client timeout
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if state.is_dead() {
                break;
            }
        }
    });

    (app, shutdown_rx)
}

async fn heartbeat(State(state): State<AppState>) -> StatusCode {
    state.keep_alive();
    StatusCode::OK
}

/// The last tab is going away: stop the in-flight build and schedule
/// shutdown after a grace period that lets a reload call `end_shutdown`.
async fn begin_shutdown(State(state): State<AppState>) -> StatusCode {
    state.cache.cancel_current();
    state.cancel_shutdown();
    state.request_shutdown();
    StatusCode::OK
}

async fn end_shutdown(State(state): State<AppState>) -> StatusCode {
    state.cancel_shutdown();
    state.keep_alive();
    StatusCode::OK
}
