//! Health, liveness, and readiness endpoints.
//!
//! The detailed endpoint serves the broker's status tree so operators can see
//! traffic and backlog per service and process.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::messaging::MessagingStatus;

/// Shared state passed to the handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Root of the broker's status tree.
    pub status: Arc<MessagingStatus>,
    /// Process start time, used for uptime.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(status: Arc<MessagingStatus>) -> Self {
        Self {
            status,
            start_time: Instant::now(),
        }
    }
}

/// Returns the status tree as JSON.
///
/// Always returns 200; `active` in the body tells whether the broker is
/// running.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "active": state.status.is_active(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "status": state.status.snapshot(),
    }))
}

/// Liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe -- 200 while every node in the tree is active, 503
/// before start and after close.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.status.is_active() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Routes:
/// - `GET /health` -- status tree JSON
/// - `GET /health/live` -- liveness probe
/// - `GET /health/ready` -- readiness probe
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

/// Serves the health router until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the server hits a fatal I/O error.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "serving health endpoints");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
