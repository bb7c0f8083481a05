//! Operation model and lifecycle state machine
//!
//! ```text
//! Pending ──start──▶ Running ──success──▶ Completed
//!    │                  ├──executor error / timeout──▶ Failed
//!    └──cancel──────────┴──cancel (cancellable only)──▶ Cancelled
//! ```
//!
//! Terminal states accept no further transition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ratelimit::OperationClass;

/// Opaque, type-specific operation parameters
pub type Parameters = Map<String, Value>;

/// Kinds of background work the agent can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    ParityCheck,
    ArrayStart,
    ArrayStop,
    DiskScan,
    BulkContainer,
    BulkVm,
    SystemReboot,
    SystemShutdown,
}

/// Resources that admit at most one non-terminal operation at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScope {
    Array,
    System,
}

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        OperationType::ParityCheck,
        OperationType::ArrayStart,
        OperationType::ArrayStop,
        OperationType::DiskScan,
        OperationType::BulkContainer,
        OperationType::BulkVm,
        OperationType::SystemReboot,
        OperationType::SystemShutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ParityCheck => "parity-check",
            OperationType::ArrayStart => "array-start",
            OperationType::ArrayStop => "array-stop",
            OperationType::DiskScan => "disk-scan",
            OperationType::BulkContainer => "bulk-container",
            OperationType::BulkVm => "bulk-vm",
            OperationType::SystemReboot => "system-reboot",
            OperationType::SystemShutdown => "system-shutdown",
        }
    }

    /// Exclusive resource this type occupies while non-terminal
    pub fn resource_scope(&self) -> Option<ResourceScope> {
        match self {
            OperationType::ParityCheck | OperationType::ArrayStart | OperationType::ArrayStop => {
                Some(ResourceScope::Array)
            }
            OperationType::SystemReboot | OperationType::SystemShutdown => {
                Some(ResourceScope::System)
            }
            OperationType::DiskScan | OperationType::BulkContainer | OperationType::BulkVm => None,
        }
    }

    /// Rate limit class consulted on admission
    pub fn rate_class(&self) -> OperationClass {
        match self {
            OperationType::ParityCheck => OperationClass::ParityCheck,
            OperationType::ArrayStart | OperationType::ArrayStop => OperationClass::ArrayControl,
            OperationType::DiskScan => OperationClass::DiskScan,
            OperationType::BulkContainer => OperationClass::BulkContainer,
            OperationType::BulkVm => OperationClass::BulkVm,
            OperationType::SystemReboot | OperationType::SystemShutdown => {
                OperationClass::SystemPower
            }
        }
    }

    pub fn is_cancellable(&self) -> bool {
        !matches!(self, OperationType::ArrayStart | OperationType::ArrayStop)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Structured failure recorded on a terminal operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: String,
    pub message: String,
}

impl OperationFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Snapshot of a unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub parameters: Parameters,
    pub description: String,
    pub created_by: String,
    pub cancellable: bool,
    pub cancel_requested: bool,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<OperationFailure>,
}

impl Operation {
    pub fn new(
        op_type: OperationType,
        parameters: Parameters,
        description: String,
        created_by: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            status: OperationStatus::Pending,
            parameters,
            description,
            created_by,
            cancellable: op_type.is_cancellable(),
            cancel_requested: false,
            created: Utc::now(),
            started: None,
            completed: None,
            progress: None,
            message: None,
            result: None,
            error: None,
        }
    }

    /// Apply a status transition, refusing anything the state machine forbids
    pub fn transition(&mut self, next: OperationStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        let now = Utc::now();
        match next {
            OperationStatus::Running => self.started = Some(now),
            _ if next.is_terminal() => self.completed = Some(now),
            _ => {}
        }
        self.status = next;
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started?;
        let completed = self.completed?;
        Some((completed - started).num_milliseconds())
    }
}

/// Submission payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub description: Option<String>,
}

impl OperationRequest {
    pub fn new(op_type: OperationType, parameters: Parameters) -> Self {
        Self {
            op_type: op_type.as_str().to_string(),
            parameters,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    #[serde(rename = "type")]
    pub op_type: Option<OperationType>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl OperationFilter {
    pub fn matches(&self, operation: &Operation) -> bool {
        self.status.is_none_or(|status| operation.status == status)
            && self.op_type.is_none_or(|t| operation.op_type == t)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationList {
    pub items: Vec<Operation>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}
