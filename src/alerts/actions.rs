use serde_json::{Value, json};
use tracing::{info, warn};

use crate::operations::{OperationManager, OperationRequest, OperationType};

use super::{AlertLevel, AlertRecord};

const ALERT_CLIENT: &str = "alert-engine";

/// Automatic response to a critical or shutdown-level alert
///
/// Returns a description of what was done, stored on the alert record.
pub trait ProtectiveActions: Send + Sync {
    fn protect(&self, record: &AlertRecord) -> String;
}

/// Records the alert without touching the host
pub struct LogOnly;

impl ProtectiveActions for LogOnly {
    fn protect(&self, record: &AlertRecord) -> String {
        warn!("protective action requested for {} ({})", record.sensor, record.level);
        "logged only".to_string()
    }
}

/// Submits operations through the registry, so protective actions are tracked,
/// rate limited and deduplicated like any other request
pub struct OperationActions {
    manager: OperationManager,
    throttle_containers: Vec<String>,
}

impl OperationActions {
    pub fn new(manager: OperationManager, throttle_containers: Vec<String>) -> Self {
        Self {
            manager,
            throttle_containers,
        }
    }

    fn submit(&self, op_type: OperationType, parameters: Value, reason: &str) -> String {
        let Value::Object(parameters) = parameters else {
            return format!("{op_type} not submitted: invalid parameters");
        };

        let request = OperationRequest::new(op_type, parameters).with_description(reason);

        match self.manager.start_operation(request, ALERT_CLIENT) {
            Ok(operation) => {
                info!("submitted {op_type} operation {} ({reason})", operation.id);
                format!("submitted {op_type} operation {}", operation.id)
            }
            Err(err) => {
                warn!("protective {op_type} rejected: {err}");
                format!("{op_type} rejected: {err}")
            }
        }
    }
}

impl ProtectiveActions for OperationActions {
    fn protect(&self, record: &AlertRecord) -> String {
        let reason = format!("automatic response to {}", record.message);

        match record.level {
            AlertLevel::Shutdown => self.submit(
                OperationType::SystemShutdown,
                json!({ "delay_secs": 0 }),
                &reason,
            ),
            AlertLevel::Critical if self.throttle_containers.is_empty() => {
                warn!("critical alert for {} but no containers to throttle", record.sensor);
                "no throttle targets configured".to_string()
            }
            AlertLevel::Critical => self.submit(
                OperationType::BulkContainer,
                json!({ "action": "pause", "containers": self.throttle_containers }),
                &reason,
            ),
            AlertLevel::Warning => "none".to_string(),
        }
    }
}
