use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::adaptive::AdaptiveConfig;
use crate::alerts::AlertConfig;
use crate::executors::ExecutorConfig;
use crate::hub::HubConfig;
use crate::operations::OperationManagerConfig;
use crate::ratelimit::{OperationClass, RateLimit, default_class_limits, default_general_limit};
use crate::util::{get_addr, get_port, get_secret};

/// Agent configuration; every section is optional, so `{}` is valid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub operations: OperationManagerConfig,
    pub rate_limits: RateLimitConfig,
    pub monitoring: MonitoringConfig,
    pub alerts: AlertConfig,
    pub executors: ExecutorConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind_addr: SocketAddr,

    /// Optional bearer token
    pub auth_token: Option<String>,

    /// Enable CORS for dashboards
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token: None,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Applied to every REST request, keyed by client address
    pub general: RateLimit,
    /// Overrides for individual operation classes
    pub classes: HashMap<OperationClass, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: default_general_limit(),
            classes: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Built-in class limits with the configured overrides applied
    pub fn limits(&self) -> HashMap<OperationClass, RateLimit> {
        let mut limits = default_class_limits();
        limits.extend(self.classes.iter().map(|(class, limit)| (*class, *limit)));
        limits.insert(OperationClass::General, self.general);
        limits
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    #[serde(flatten)]
    pub adaptive: AdaptiveConfig,
    /// Frames buffered per live subscriber before it is dropped
    pub subscriber_queue: usize,
    pub heartbeat_secs: u64,
    pub inactivity_check_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            adaptive: AdaptiveConfig::default(),
            subscriber_queue: 64,
            heartbeat_secs: 30,
            inactivity_check_secs: 60,
        }
    }
}

impl MonitoringConfig {
    pub fn hub(&self) -> HubConfig {
        HubConfig {
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            inactivity_check: Duration::from_secs(self.inactivity_check_secs.max(1)),
        }
    }
}

impl Config {
    /// Apply `AGENT_ADDR`, `AGENT_PORT` and `AGENT_SECRET` from the environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(addr) = get_addr() {
            self.api.bind_addr.set_ip(addr);
        }
        if let Some(port) = get_port() {
            self.api.bind_addr.set_port(port);
        }
        if let Some(secret) = get_secret() {
            self.api.auth_token = Some(secret);
        }
        self
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {path}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
