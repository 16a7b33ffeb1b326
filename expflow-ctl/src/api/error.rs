//! Error types for the operator API

use crate::error::FlowError;
use crate::runner::RunnerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Controller refused the operation
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Runner refused a trial operation (409)
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Runner(_) => (StatusCode::CONFLICT, "RUNNER_CONFLICT"),
            ApiError::Flow(err) => match err {
                FlowError::ConsistencyViolation(_) => {
                    (StatusCode::CONFLICT, "CONSISTENCY_VIOLATION")
                }
                FlowError::SessionAlreadyStarted => {
                    (StatusCode::CONFLICT, "SESSION_ALREADY_STARTED")
                }
                FlowError::ControllerStopped => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CONTROLLER_STOPPED")
                }
                FlowError::EmptyBlock(_) | FlowError::Configure(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "BLOCK_REJECTED")
                }
                FlowError::Runner(_) => (StatusCode::CONFLICT, "RUNNER_CONFLICT"),
                FlowError::InvalidState(_) => (StatusCode::BAD_REQUEST, "INVALID_STATE"),
                FlowError::Source(_) => (StatusCode::BAD_GATEWAY, "SOURCE_ERROR"),
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_violation_is_conflict() {
        let response =
            ApiError::from(FlowError::ConsistencyViolation("mismatch".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_stopped_controller_is_unavailable() {
        let response = ApiError::from(FlowError::ControllerStopped).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
