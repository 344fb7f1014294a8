//! API Error Types
//!
//! Defines error types for the admin API and implements conversion
//! to HTTP responses with appropriate status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OrchestratorError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error from the queue, cache or scheduler
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::InvalidRequest(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
                }
                OrchestratorError::Driver { .. } => (StatusCode::BAD_GATEWAY, "DRIVER_ERROR"),
                OrchestratorError::Stalled { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "QUERY_STALLED")
                }
                OrchestratorError::Cancelled { .. } => (StatusCode::CONFLICT, "QUERY_CANCELLED"),
                OrchestratorError::ContinueWait => (StatusCode::ACCEPTED, "CONTINUE_WAIT"),
                OrchestratorError::RollupJoinMismatch(_) => {
                    (StatusCode::CONFLICT, "ROLLUP_JOIN_MISMATCH")
                }
                OrchestratorError::BuildRange(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "BUILD_RANGE_ERROR")
                }
                OrchestratorError::ExecutionTimeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "EXECUTION_TIMEOUT")
                }
                OrchestratorError::PartitionNotBuilt(_) => {
                    (StatusCode::CONFLICT, "PARTITION_NOT_BUILT")
                }
                OrchestratorError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            },
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_error_status() {
        let cases = [
            (OrchestratorError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::driver("boom"), StatusCode::BAD_GATEWAY),
            (OrchestratorError::PartitionNotBuilt("t".into()), StatusCode::CONFLICT),
            (OrchestratorError::ExecutionTimeout { timeout_ms: 5 }, StatusCode::GATEWAY_TIMEOUT),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }
}
