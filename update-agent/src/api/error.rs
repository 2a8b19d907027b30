//! Mapping from [`UpdateError`] to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::utils::UpdateError;

/// Handler error; renders as `{"success": false, "error": ...}`
#[derive(Debug)]
pub struct ApiError(pub UpdateError);

impl From<UpdateError> for ApiError {
    fn from(err: UpdateError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            UpdateError::Precondition(_) | UpdateError::Busy => StatusCode::CONFLICT,
            UpdateError::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            UpdateError::Network(_) | UpdateError::Http { .. } => StatusCode::BAD_GATEWAY,
            UpdateError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            UpdateError::Config(_) => StatusCode::BAD_REQUEST,
            UpdateError::Archive(_) | UpdateError::Io(_) | UpdateError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Update operation failed: {}", self.0);
        }
        (status, Json(json!({ "success": false, "error": self.0.to_string() }))).into_response()
    }
}
