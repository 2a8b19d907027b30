//! Health check endpoints.

use axum::extract::State;
use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

use super::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.manager.snapshot().await;

    Json(json!({
        "status": "ok",
        "version": snapshot.current_version,
        "update_state": snapshot.update_state,
        "pending_verification": snapshot.pending_verification,
        "uptime_secs": uptime_secs(),
    }))
}

/// GET /version - Agent and application versions
pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "agent_version": env!("CARGO_PKG_VERSION"),
        "app_version": state.manager.snapshot().await.current_version,
        "platform": crate::host::platform(),
    }))
}
