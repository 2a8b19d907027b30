//! HTTP API for the update agent.

pub mod error;
pub mod health;
pub mod update;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::manager::UpdateManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<UpdateManager>,
}

/// Create the API router with all endpoints
pub fn create_router(manager: Arc<UpdateManager>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Update endpoints
        .route("/api/update/status", get(update::status))
        .route("/api/update/check", post(update::check))
        .route("/api/update/download", post(update::download))
        .route("/api/update/apply", post(update::apply))
        .route("/api/update/rollback", post(update::rollback))
        .route("/api/update/confirm", post(update::confirm))
        .route("/api/update/enable", post(update::enable))
        .route("/api/restart", post(update::restart))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}
