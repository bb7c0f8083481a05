//! Threshold evaluation, deduplication and protective actions for sensor alerts

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod actions;
mod engine;
mod notifier;

pub use actions::{LogOnly, OperationActions, ProtectiveActions};
pub use engine::{AlertEngine, SensorClassifier};
pub use notifier::WebhookNotifier;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("invalid thresholds for {class}: {reason}")]
    InvalidThresholds { class: SensorClass, reason: String },

    #[error("invalid sensor pattern for {class}: {source}")]
    InvalidPattern {
        class: SensorClass,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Cpu,
    Disk,
    Gpu,
    System,
    /// Utilisation percentages rather than temperatures
    Resource,
}

impl SensorClass {
    pub const ALL: [SensorClass; 5] = [
        SensorClass::Cpu,
        SensorClass::Disk,
        SensorClass::Gpu,
        SensorClass::System,
        SensorClass::Resource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorClass::Cpu => "cpu",
            SensorClass::Disk => "disk",
            SensorClass::Gpu => "gpu",
            SensorClass::System => "system",
            SensorClass::Resource => "resource",
        }
    }
}

impl fmt::Display for SensorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown sensor class: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
    Shutdown,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub warning: f32,
    pub critical: f32,
    pub shutdown: f32,
    #[serde(default)]
    pub auto_actions: bool,
}

impl AlertThreshold {
    pub const fn new(warning: f32, critical: f32, shutdown: f32) -> Self {
        Self {
            warning,
            critical,
            shutdown,
            auto_actions: false,
        }
    }

    pub fn with_auto_actions(mut self, enabled: bool) -> Self {
        self.auto_actions = enabled;
        self
    }

    /// Enforce `warning < critical < shutdown`
    pub fn validate(&self, class: SensorClass) -> Result<(), AlertError> {
        let finite = [self.warning, self.critical, self.shutdown]
            .iter()
            .all(|v| v.is_finite());

        if !finite || !(self.warning < self.critical && self.critical < self.shutdown) {
            return Err(AlertError::InvalidThresholds {
                class,
                reason: format!(
                    "expected warning < critical < shutdown, got {} / {} / {}",
                    self.warning, self.critical, self.shutdown
                ),
            });
        }

        Ok(())
    }

    /// Highest level breached by `value`, checked from shutdown down
    pub fn level_for(&self, value: f32) -> Option<AlertLevel> {
        if value >= self.shutdown {
            Some(AlertLevel::Shutdown)
        } else if value >= self.critical {
            Some(AlertLevel::Critical)
        } else if value >= self.warning {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }

    pub fn limit_for(&self, level: AlertLevel) -> f32 {
        match level {
            AlertLevel::Warning => self.warning,
            AlertLevel::Critical => self.critical,
            AlertLevel::Shutdown => self.shutdown,
        }
    }
}

pub fn default_thresholds() -> BTreeMap<SensorClass, AlertThreshold> {
    BTreeMap::from([
        (SensorClass::Cpu, AlertThreshold::new(70.0, 80.0, 90.0)),
        (SensorClass::Disk, AlertThreshold::new(45.0, 55.0, 60.0)),
        (SensorClass::Gpu, AlertThreshold::new(75.0, 85.0, 95.0)),
        (SensorClass::System, AlertThreshold::new(60.0, 70.0, 80.0)),
        (SensorClass::Resource, AlertThreshold::new(80.0, 90.0, 98.0)),
    ])
}

/// One emitted alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub sensor: String,
    pub class: SensorClass,
    pub level: AlertLevel,
    pub value: f32,
    pub threshold: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Protective action taken, if any
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_secs: u64,
    pub history_size: usize,
    pub thresholds: BTreeMap<SensorClass, AlertThreshold>,

    /// Regex overrides for sensor name classification
    pub sensor_patterns: BTreeMap<SensorClass, String>,

    pub webhook: Option<WebhookConfig>,

    /// Containers paused on critical alerts when auto actions are enabled
    pub throttle_containers: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            history_size: 100,
            thresholds: default_thresholds(),
            sensor_patterns: BTreeMap::new(),
            webhook: None,
            throttle_containers: vec![],
        }
    }
}
