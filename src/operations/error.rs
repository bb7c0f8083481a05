//! Error types for the operation registry

use serde_json::{Value, json};
use thiserror::Error;

use crate::ratelimit::{OperationClass, RateLimit};

use super::types::{OperationStatus, OperationType};

pub type OperationResult<T> = Result<T, OperationError>;

/// Admission and lifecycle errors returned synchronously to callers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OperationError {
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("conflicts with {conflicting_type} operation {conflicting_id}")]
    OperationConflict {
        conflicting_id: String,
        conflicting_type: OperationType,
    },

    #[error("operation {id} cannot be cancelled ({reason})")]
    OperationNotCancellable { id: String, reason: String },

    #[error("operation {id} exceeded its time limit of {timeout_secs}s")]
    OperationTimeout { id: String, timeout_secs: u64 },

    #[error("maximum of {limit} concurrent operations reached")]
    MaxOperationsReached { limit: usize },

    #[error("operation manager is shutting down")]
    ShuttingDown,

    #[error("rate limit exceeded for {class}: {limit}")]
    RateLimitExceeded {
        class: OperationClass,
        limit: RateLimit,
    },
}

impl OperationError {
    /// Stable identifier used in REST error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            OperationError::UnknownOperationType(_) => "UnknownOperationType",
            OperationError::ValidationFailed(_) => "ValidationFailed",
            OperationError::OperationNotFound(_) => "OperationNotFound",
            OperationError::OperationConflict { .. } => "OperationConflict",
            OperationError::OperationNotCancellable { .. } => "OperationNotCancellable",
            OperationError::OperationTimeout { .. } => "OperationTimeout",
            OperationError::MaxOperationsReached { .. } => "MaxOperationsReached",
            OperationError::RateLimitExceeded { .. } => "RateLimitExceeded",
            OperationError::ShuttingDown => "ShuttingDown",
        }
    }

    /// Structured details for REST error bodies
    pub fn details(&self) -> Value {
        match self {
            OperationError::UnknownOperationType(op_type) => json!({ "type": op_type }),
            OperationError::ValidationFailed(reason) => json!({ "reason": reason }),
            OperationError::OperationNotFound(id) => json!({ "id": id }),
            OperationError::OperationConflict {
                conflicting_id,
                conflicting_type,
            } => json!({
                "conflicting_operation_id": conflicting_id,
                "conflicting_operation_type": conflicting_type,
            }),
            OperationError::OperationNotCancellable { id, reason } => {
                json!({ "id": id, "reason": reason })
            }
            OperationError::OperationTimeout { id, timeout_secs } => {
                json!({ "id": id, "timeout_secs": timeout_secs })
            }
            OperationError::MaxOperationsReached { limit } => json!({ "limit": limit }),
            OperationError::RateLimitExceeded { class, limit } => json!({
                "class": class,
                "requests": limit.requests,
                "window_secs": limit.window_secs,
            }),
            OperationError::ShuttingDown => json!({}),
        }
    }

    pub(crate) fn not_cancellable(id: &str, status: OperationStatus, cancellable: bool) -> Self {
        let reason = if !cancellable {
            "operation type is not cancellable".to_string()
        } else {
            format!("operation already {status}")
        };

        OperationError::OperationNotCancellable {
            id: id.to_string(),
            reason,
        }
    }
}

/// Outcome of an executor run that did not produce a result
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The executor observed the cancellation signal and stopped
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
