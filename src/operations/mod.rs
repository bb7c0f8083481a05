//! Registry of long-running administrative operations
//!
//! Submissions are validated, checked for resource conflicts and rate limited
//! before anything is stored. Admitted operations run on their own task via an
//! [`Executor`] and can be queried, listed and cancelled by id.

pub mod error;
pub mod executor;
pub mod manager;
pub mod types;

pub use error::{ExecutionError, OperationError, OperationResult};
pub use executor::{
    ExecutionContext, Executor, ExecutorRegistry, ProgressReporter, ProgressUpdate,
};
pub use manager::{OperationManager, OperationManagerConfig, OperationStats};
pub use types::{
    Operation, OperationFailure, OperationFilter, OperationList, OperationRequest,
    OperationStatus, OperationType, Parameters, ResourceScope,
};
