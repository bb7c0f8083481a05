//! Pluggable executors, one per operation type

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::ExecutionError;
use super::types::{OperationType, Parameters};

/// Performs the real work behind one operation type
///
/// `validate` runs synchronously on submission, before anything is stored.
/// `execute` runs on its own task and must check `ctx.cancel` at safe points.
#[async_trait]
pub trait Executor: Send + Sync {
    fn validate(&self, parameters: &Parameters) -> Result<(), String>;

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<u8>,
    pub message: Option<String>,
}

pub(crate) type ProgressSink = Arc<dyn Fn(&str, ProgressUpdate) + Send + Sync>;

/// Reports executor progress back into the operation table
#[derive(Clone)]
pub struct ProgressReporter {
    operation_id: String,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub(crate) fn new(operation_id: impl Into<String>, sink: ProgressSink) -> Self {
        Self {
            operation_id: operation_id.into(),
            sink: Some(sink),
        }
    }

    /// Reporter that discards everything
    pub fn noop(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            sink: None,
        }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        self.send(ProgressUpdate {
            percent: Some(percent.min(100)),
            message: Some(message.into()),
        });
    }

    pub fn message(&self, message: impl Into<String>) {
        self.send(ProgressUpdate {
            percent: None,
            message: Some(message.into()),
        });
    }

    fn send(&self, update: ProgressUpdate) {
        if let Some(sink) = &self.sink {
            sink(&self.operation_id, update);
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

/// Everything an executor gets for one run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation_id: String,
    pub parameters: Parameters,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl ExecutionContext {
    pub fn new(
        operation_id: impl Into<String>,
        parameters: Parameters,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            parameters,
            cancel,
            progress,
        }
    }

    /// Bail out with [`ExecutionError::Cancelled`] if cancellation was requested
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Type → executor table, populated once at startup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<OperationType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op_type: OperationType, executor: impl Executor + 'static) {
        self.executors.insert(op_type, Arc::new(executor));
    }

    pub fn with(mut self, op_type: OperationType, executor: impl Executor + 'static) -> Self {
        self.register(op_type, executor);
        self
    }

    pub fn get(&self, op_type: OperationType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&op_type).cloned()
    }

    pub fn types(&self) -> Vec<OperationType> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
