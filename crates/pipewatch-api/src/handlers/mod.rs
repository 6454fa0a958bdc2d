pub mod health;
pub mod jobs;

use axum::{Json, http::StatusCode, response::IntoResponse};
use pipewatch_common::error::PipewatchError;
use tracing::error;

pub struct ApiError(pub PipewatchError);

impl From<PipewatchError> for ApiError {
    fn from(value: PipewatchError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            PipewatchError::JobNotFound(_) => StatusCode::NOT_FOUND,
            PipewatchError::InvalidArgument(_) | PipewatchError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        (
            status,
            Json(serde_json::json!({
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
