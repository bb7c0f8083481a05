//! API error types and conversions

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::alerts::AlertError;
use crate::operations::OperationError;
use crate::ratelimit::{OperationClass, RateLimit};

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Rejected by the operation registry
    Operation(OperationError),

    /// Rejected threshold update
    Alert(AlertError),

    /// Request-level rate limit
    RateLimited { class: OperationClass, limit: RateLimit },

    /// Invalid request parameters
    InvalidRequest(String),

    /// Resource not found
    NotFound(String),

    /// Internal server error
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Value) {
        match self {
            ApiError::Operation(err) => {
                let status = match err {
                    OperationError::UnknownOperationType(_)
                    | OperationError::ValidationFailed(_)
                    | OperationError::OperationNotCancellable { .. } => StatusCode::BAD_REQUEST,
                    OperationError::OperationNotFound(_) => StatusCode::NOT_FOUND,
                    OperationError::OperationConflict { .. } => StatusCode::CONFLICT,
                    OperationError::RateLimitExceeded { .. }
                    | OperationError::MaxOperationsReached { .. } => StatusCode::TOO_MANY_REQUESTS,
                    OperationError::OperationTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                    OperationError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.kind(), err.details())
            }
            ApiError::Alert(AlertError::InvalidThresholds { class, reason }) => (
                StatusCode::BAD_REQUEST,
                "InvalidThresholds",
                json!({ "class": class, "reason": reason }),
            ),
            ApiError::Alert(AlertError::InvalidPattern { class, source }) => (
                StatusCode::BAD_REQUEST,
                "InvalidPattern",
                json!({ "class": class, "reason": source.to_string() }),
            ),
            ApiError::RateLimited { class, limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                json!({
                    "class": class,
                    "requests": limit.requests,
                    "window_secs": limit.window_secs,
                }),
            ),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest", json!({})),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", json!({})),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal", json!({})),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Operation(err) => err.to_string(),
            ApiError::Alert(err) => err.to_string(),
            ApiError::RateLimited { class, limit } => {
                format!("rate limit exceeded for {class}: {limit}")
            }
            ApiError::InvalidRequest(msg) | ApiError::NotFound(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, details) = self.parts();

        let body = Json(json!({
            "error": self.message(),
            "kind": kind,
            "details": details,
        }));

        (status, body).into_response()
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        ApiError::Operation(err)
    }
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        ApiError::Alert(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
