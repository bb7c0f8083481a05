//! AlertEngine - classifies readings, applies thresholds and deduplicates alerts
//!
//! ```text
//! reading ─classify─▶ class ─thresholds─▶ highest level ─cooldown(sensor, level)─▶ AlertRecord
//!                                                                          │
//!                                  auto_actions && level ≥ critical ◀──────┤
//!                                                 history ring ◀───────────┤
//!                                  broadcast subscribers + webhook ◀───────┘
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::TemperatureReading;

use super::{
    AlertConfig, AlertError, AlertLevel, AlertRecord, AlertThreshold, ProtectiveActions,
    SensorClass, WebhookNotifier, default_thresholds,
};

const EVENT_CAPACITY: usize = 128;

/// Keyword patterns, checked in this order; anything unmatched is `system`
const DEFAULT_PATTERNS: [(SensorClass, &str); 3] = [
    (SensorClass::Gpu, r"(?i)gpu|nvidia|amdgpu|radeon|nouveau|geforce"),
    (
        SensorClass::Disk,
        r"(?i)^(sd[a-z]+|hd[a-z]+|nvme\d+)|disk|drive|nvme|ssd|hdd",
    ),
    (
        SensorClass::Cpu,
        r"(?i)cpu|core|package|coretemp|k10temp|tctl|tdie",
    ),
];

/// Maps sensor names to a [`SensorClass`] by keyword matching
#[derive(Debug, Clone)]
pub struct SensorClassifier {
    rules: Vec<(SensorClass, Regex)>,
}

impl SensorClassifier {
    /// Build from the default patterns, replacing any class found in `overrides`
    pub fn new(overrides: &BTreeMap<SensorClass, String>) -> Result<Self, AlertError> {
        let rules = DEFAULT_PATTERNS
            .iter()
            .map(|(class, pattern)| {
                let pattern = overrides.get(class).map_or(*pattern, String::as_str);
                Regex::new(pattern)
                    .map(|regex| (*class, regex))
                    .map_err(|source| AlertError::InvalidPattern {
                        class: *class,
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { rules })
    }

    pub fn classify(&self, sensor: &str) -> SensorClass {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(sensor))
            .map_or(SensorClass::System, |(class, _)| *class)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct AlertEngine {
    cooldown: Duration,
    history_size: usize,
    classifier: SensorClassifier,
    thresholds: RwLock<BTreeMap<SensorClass, AlertThreshold>>,
    last_emitted: Mutex<HashMap<(String, AlertLevel), Instant>>,
    history: Mutex<VecDeque<AlertRecord>>,
    actions: Arc<dyn ProtectiveActions>,
    notifier: Option<WebhookNotifier>,
    events: broadcast::Sender<AlertRecord>,
}

impl AlertEngine {
    pub fn new(
        config: &AlertConfig,
        actions: Arc<dyn ProtectiveActions>,
    ) -> Result<Self, AlertError> {
        for (class, threshold) in &config.thresholds {
            threshold.validate(*class)?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        // classes missing from the config keep their built-in thresholds
        let mut thresholds = default_thresholds();
        thresholds.extend(config.thresholds.iter().map(|(class, t)| (*class, *t)));

        Ok(Self {
            cooldown: Duration::from_secs(config.cooldown_secs),
            history_size: config.history_size.max(1),
            classifier: SensorClassifier::new(&config.sensor_patterns)?,
            thresholds: RwLock::new(thresholds),
            last_emitted: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            actions,
            notifier: config
                .webhook
                .as_ref()
                .map(|webhook| WebhookNotifier::new(&webhook.url)),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertRecord> {
        self.events.subscribe()
    }

    pub fn classify(&self, sensor: &str) -> SensorClass {
        self.classifier.classify(sensor)
    }

    pub fn thresholds(&self) -> BTreeMap<SensorClass, AlertThreshold> {
        self.thresholds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn threshold(&self, class: SensorClass) -> Option<AlertThreshold> {
        self.thresholds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&class)
            .copied()
    }

    /// Replace a class's thresholds; rejected unless `warning < critical < shutdown`
    pub fn set_threshold(
        &self,
        class: SensorClass,
        threshold: AlertThreshold,
    ) -> Result<(), AlertError> {
        threshold.validate(class)?;

        self.thresholds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(class, threshold);

        info!(
            "updated {class} thresholds to {}/{}/{} (auto actions: {})",
            threshold.warning, threshold.critical, threshold.shutdown, threshold.auto_actions
        );
        Ok(())
    }

    /// Evaluate one temperature poll; at most one alert per sensor
    pub fn process_temperatures(&self, readings: &[TemperatureReading]) -> Vec<AlertRecord> {
        readings
            .iter()
            .filter_map(|reading| {
                let class = self.classify(&reading.sensor);
                self.evaluate(&reading.sensor, class, reading.celsius)
            })
            .collect()
    }

    /// Evaluate a utilisation percentage under the `resource` class
    pub fn process_resource(&self, name: &str, percent: f32) -> Option<AlertRecord> {
        self.evaluate(name, SensorClass::Resource, percent)
    }

    /// Compare `value` against the class thresholds and emit if not in cooldown
    pub fn evaluate(&self, sensor: &str, class: SensorClass, value: f32) -> Option<AlertRecord> {
        let threshold = self.threshold(class)?;
        let level = threshold.level_for(value)?;

        if !self.claim(sensor, level) {
            debug!("suppressing {level} alert for {sensor}: in cooldown");
            return None;
        }

        let limit = threshold.limit_for(level);
        let unit = if class == SensorClass::Resource { "%" } else { "°C" };

        let mut record = AlertRecord {
            id: uuid::Uuid::new_v4().to_string(),
            sensor: sensor.to_string(),
            class,
            level,
            value,
            threshold: limit,
            message: format!("{sensor} at {value:.1}{unit} reached {level} level ({limit:.1}{unit})"),
            timestamp: Utc::now(),
            action: None,
        };

        if threshold.auto_actions && level >= AlertLevel::Critical {
            record.action = Some(self.actions.protect(&record));
        }

        match level {
            AlertLevel::Warning => warn!("{}", record.message),
            AlertLevel::Critical | AlertLevel::Shutdown => error!("{}", record.message),
        }

        self.record(record.clone());
        Some(record)
    }

    /// Check and stamp the cooldown for `(sensor, level)` under one lock
    fn claim(&self, sensor: &str, level: AlertLevel) -> bool {
        let now = Instant::now();
        let mut last_emitted = lock(&self.last_emitted);

        let key = (sensor.to_string(), level);
        if let Some(last) = last_emitted.get(&key)
            && now.duration_since(*last) < self.cooldown
        {
            return false;
        }

        last_emitted.retain(|_, last| now.duration_since(*last) < self.cooldown);
        last_emitted.insert(key, now);
        true
    }

    fn record(&self, record: AlertRecord) {
        {
            let mut history = lock(&self.history);
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        if let Some(notifier) = self.notifier.clone() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let record = record.clone();
                    runtime.spawn(async move {
                        notifier.send(&record).await;
                    });
                }
                Err(_) => warn!("no async runtime, webhook skipped for {}", record.sensor),
            }
        }

        // no subscribers is fine
        let _ = self.events.send(record);
    }

    /// Most recent alerts first
    pub fn history(&self, limit: Option<usize>) -> Vec<AlertRecord> {
        let history = lock(&self.history);
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
