//! Update control endpoints under `/api/update`.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::error::ApiError;
use super::AppState;
use crate::manager::UpdateStatus;

type ApiResult = Result<Json<Value>, ApiError>;

/// `{"success": true, "message": ..}` merged with the fields of `payload`
fn success(message: String, payload: impl Serialize) -> ApiResult {
    let mut body = match serde_json::to_value(payload).map_err(|e| ApiError(e.into()))? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.insert("success".to_string(), Value::Bool(true));
    body.insert("message".to_string(), Value::String(message));
    Ok(Json(Value::Object(body)))
}

/// GET /api/update/status
pub async fn status(State(state): State<AppState>) -> Json<UpdateStatus> {
    Json(state.manager.status().await)
}

/// POST /api/update/check
pub async fn check(State(state): State<AppState>) -> ApiResult {
    let outcome = state.manager.check_for_updates().await?;
    let message = if outcome.update_available {
        format!("Update available: {}", outcome.available_version)
    } else {
        format!("Up to date ({})", outcome.current_version)
    };
    success(message, outcome)
}

/// POST /api/update/download
pub async fn download(State(state): State<AppState>) -> ApiResult {
    let outcome = state.manager.download_update().await?;
    success(
        format!("Downloaded {} ({} files), ready to apply", outcome.version, outcome.files),
        outcome,
    )
}

/// POST /api/update/apply
pub async fn apply(State(state): State<AppState>) -> ApiResult {
    let outcome = state.manager.apply_update().await?;
    success(
        format!("Updated to {}, restarting", outcome.version),
        outcome,
    )
}

/// POST /api/update/rollback
pub async fn rollback(State(state): State<AppState>) -> ApiResult {
    let outcome = state.manager.rollback().await?;
    let message = if outcome.updates_disabled {
        format!(
            "Rolled back to {}. Updates disabled after {} failed attempts",
            outcome.restored_version, outcome.consecutive_failures
        )
    } else {
        format!("Rolled back to {}, restarting", outcome.restored_version)
    };
    success(message, outcome)
}

/// POST /api/update/confirm
pub async fn confirm(State(state): State<AppState>) -> ApiResult {
    let version = state.manager.confirm_update().await?;
    success(format!("Version {} confirmed", version), json!({ "version": version }))
}

/// POST /api/update/enable
pub async fn enable(State(state): State<AppState>) -> ApiResult {
    state.manager.enable_updates().await;
    success("Updates enabled".to_string(), json!({}))
}

/// POST /api/restart
pub async fn restart(State(state): State<AppState>) -> ApiResult {
    state.manager.restart_service().await?;
    success("Restarting".to_string(), json!({}))
}
