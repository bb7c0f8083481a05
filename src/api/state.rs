//! API shared state

use std::sync::Arc;
use std::time::Duration;

use crate::context::AgentContext;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<AgentContext>,
}

impl ApiState {
    pub fn new(agent: Arc<AgentContext>) -> Self {
        Self { agent }
    }

    /// Ping period for live connections
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.agent.config.monitoring.heartbeat_secs.max(1))
    }
}
