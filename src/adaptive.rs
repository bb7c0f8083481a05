//! Adaptive polling intervals for the live monitoring channels
//!
//! Every [`MonitorChannel`] has a fixed base interval. The interval actually used
//! by the channel's poller is derived from it:
//!
//! ```text
//! current = clamp(base × load_factor × error_multiplier × idle_multiplier,
//!                 min_interval, max_interval)
//! ```
//!
//! - `load_factor` is global, recomputed by [`AdaptiveIntervalController::update_system_load`]
//! - `error_multiplier` doubles per error once a channel reaches the error threshold
//! - `idle_multiplier` grows while a channel sees no activity
//!
//! Both per-channel multipliers reset on the next recorded activity. Each channel
//! sits behind its own lock; a load update rewrites channels one at a time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Upper bound for the per-channel multipliers
const MAX_MULTIPLIER: f64 = 256.0;

/// Named live-data streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorChannel {
    SystemStats,
    DockerEvents,
    StorageStatus,
    VmEvents,
    Infrastructure,
    ResourceAlerts,
    Temperature,
}

impl MonitorChannel {
    pub const ALL: [MonitorChannel; 7] = [
        MonitorChannel::SystemStats,
        MonitorChannel::DockerEvents,
        MonitorChannel::StorageStatus,
        MonitorChannel::VmEvents,
        MonitorChannel::Infrastructure,
        MonitorChannel::ResourceAlerts,
        MonitorChannel::Temperature,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MonitorChannel::SystemStats => "system_stats",
            MonitorChannel::DockerEvents => "docker_events",
            MonitorChannel::StorageStatus => "storage_status",
            MonitorChannel::VmEvents => "vm_events",
            MonitorChannel::Infrastructure => "infrastructure",
            MonitorChannel::ResourceAlerts => "resource_alerts",
            MonitorChannel::Temperature => "temperature",
        }
    }

    /// Live endpoint the channel's frames are published on
    pub fn endpoint(&self) -> &'static str {
        match self {
            MonitorChannel::SystemStats => "system/stats",
            MonitorChannel::DockerEvents => "docker/events",
            MonitorChannel::StorageStatus => "storage/status",
            MonitorChannel::VmEvents => "vm/events",
            MonitorChannel::Infrastructure => "infrastructure",
            MonitorChannel::ResourceAlerts => "alerts/resources",
            MonitorChannel::Temperature => "temperature",
        }
    }

    pub fn from_endpoint(endpoint: &str) -> Option<MonitorChannel> {
        MonitorChannel::ALL
            .into_iter()
            .find(|channel| channel.endpoint() == endpoint)
    }

    pub fn default_base_interval(&self) -> Duration {
        let secs = match self {
            MonitorChannel::SystemStats => 5,
            MonitorChannel::DockerEvents => 10,
            MonitorChannel::StorageStatus => 30,
            MonitorChannel::VmEvents => 15,
            MonitorChannel::Infrastructure => 30,
            MonitorChannel::ResourceAlerts => 10,
            MonitorChannel::Temperature => 10,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for MonitorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Load marks; the load average is per core
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadThresholds {
    pub load_average: f64,
    pub memory_percent: f32,
    pub disk_io_percent: f32,
}

impl LoadThresholds {
    fn any_reached(&self, load: f64, memory: f32, disk_io: f32) -> bool {
        load >= self.load_average || memory >= self.memory_percent || disk_io >= self.disk_io_percent
    }

    fn all_below(&self, load: f64, memory: f32, disk_io: f32) -> bool {
        load < self.load_average && memory < self.memory_percent && disk_io < self.disk_io_percent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub low: LoadThresholds,
    pub high: LoadThresholds,
    pub critical: LoadThresholds,
    pub slow_factor: f64,
    pub fast_factor: f64,
    pub critical_factor: f64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub error_threshold: u32,
    pub inactivity_timeout_secs: u64,
    pub inactivity_factor: f64,
    /// Per-channel base interval overrides in seconds
    pub base_intervals: HashMap<MonitorChannel, u64>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            low: LoadThresholds {
                load_average: 0.5,
                memory_percent: 50.0,
                disk_io_percent: 30.0,
            },
            high: LoadThresholds {
                load_average: 2.0,
                memory_percent: 80.0,
                disk_io_percent: 70.0,
            },
            critical: LoadThresholds {
                load_average: 4.0,
                memory_percent: 95.0,
                disk_io_percent: 90.0,
            },
            slow_factor: 1.5,
            fast_factor: 0.7,
            critical_factor: 0.5,
            min_interval_secs: 1,
            max_interval_secs: 120,
            error_threshold: 3,
            inactivity_timeout_secs: 300,
            inactivity_factor: 1.2,
            base_intervals: HashMap::new(),
        }
    }
}

impl AdaptiveConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs).max(self.min_interval())
    }

    pub fn base_interval(&self, channel: MonitorChannel) -> Duration {
        self.base_intervals
            .get(&channel)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| channel.default_base_interval())
    }

    /// Factor applied to every channel for the given load sample
    pub fn load_factor(&self, load: f64, memory: f32, disk_io: f32) -> f64 {
        if self.critical.any_reached(load, memory, disk_io) {
            self.critical_factor
        } else if self.high.any_reached(load, memory, disk_io) {
            self.fast_factor
        } else if self.low.all_below(load, memory, disk_io) {
            self.slow_factor
        } else {
            1.0
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    base: Duration,
    current: Duration,
    last_activity: Instant,
    errors: u32,
    error_multiplier: f64,
    idle_multiplier: f64,
    last_error: Option<String>,
}

impl ChannelState {
    fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            last_activity: Instant::now(),
            errors: 0,
            error_multiplier: 1.0,
            idle_multiplier: 1.0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadState {
    factor: f64,
    load_average: f64,
    memory_percent: f32,
    disk_io_percent: f32,
}

/// Snapshot of a channel's interval bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelIntervalStats {
    pub base_ms: u64,
    pub current_ms: u64,
    pub errors: u32,
    pub idle_secs: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveStats {
    pub load_factor: f64,
    pub load_average: f64,
    pub memory_percent: f32,
    pub disk_io_percent: f32,
    pub channels: BTreeMap<MonitorChannel, ChannelIntervalStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Computes the polling interval of every monitoring channel
#[derive(Debug)]
pub struct AdaptiveIntervalController {
    config: AdaptiveConfig,
    channels: HashMap<MonitorChannel, Mutex<ChannelState>>,
    load: RwLock<LoadState>,
}

impl AdaptiveIntervalController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let channels = MonitorChannel::ALL
            .into_iter()
            .map(|channel| {
                let state = ChannelState::new(config.base_interval(channel));
                (channel, Mutex::new(state))
            })
            .collect();

        let controller = Self {
            config,
            channels,
            load: RwLock::new(LoadState {
                factor: 1.0,
                load_average: 0.0,
                memory_percent: 0.0,
                disk_io_percent: 0.0,
            }),
        };

        for channel in MonitorChannel::ALL {
            controller.with_channel(channel, |state, this| this.recompute(state, 1.0));
        }

        controller
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn current_factor(&self) -> f64 {
        self.load
            .read()
            .map(|load| load.factor)
            .unwrap_or_else(|poisoned| poisoned.into_inner().factor)
    }

    fn with_channel<R>(
        &self,
        channel: MonitorChannel,
        f: impl FnOnce(&mut ChannelState, &Self) -> R,
    ) -> Option<R> {
        let slot = self.channels.get(&channel)?;
        let mut state = lock(slot);
        Some(f(&mut state, self))
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.config.min_interval(), self.config.max_interval())
    }

    fn recompute(&self, state: &mut ChannelState, factor: f64) {
        let scale = factor * state.error_multiplier * state.idle_multiplier;
        let secs = state.base.as_secs_f64() * scale;
        let scaled = if secs.is_finite() && secs >= 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            state.base
        };
        state.current = self.clamp(scaled);
    }

    /// Interval the channel's poller should sleep before its next tick
    pub fn get_interval(&self, channel: MonitorChannel) -> Duration {
        self.with_channel(channel, |state, this| this.clamp(state.current))
            .unwrap_or_else(|| self.clamp(channel.default_base_interval()))
    }

    /// Recompute the global load factor and rewrite every channel's interval
    ///
    /// `load_average` is expected per core. Returns the new factor.
    pub fn update_system_load(&self, load_average: f64, memory_percent: f32, disk_io_percent: f32) -> f64 {
        let factor = self
            .config
            .load_factor(load_average, memory_percent, disk_io_percent);

        {
            let mut load = self
                .load
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if load.factor != factor {
                debug!("load factor changed {} → {factor}", load.factor);
            }
            *load = LoadState {
                factor,
                load_average,
                memory_percent,
                disk_io_percent,
            };
        }

        for channel in MonitorChannel::ALL {
            self.with_channel(channel, |state, this| this.recompute(state, factor));
        }

        trace!(
            "system load {load_average:.2}/core, mem {memory_percent:.1}%, io {disk_io_percent:.1}% → factor {factor}"
        );

        factor
    }

    /// Successful publish on a channel; clears error and idle back-off
    pub fn record_activity(&self, channel: MonitorChannel) {
        let factor = self.current_factor();
        self.with_channel(channel, |state, this| {
            state.last_activity = Instant::now();
            state.errors = 0;
            state.error_multiplier = 1.0;
            state.idle_multiplier = 1.0;
            state.last_error = None;
            this.recompute(state, factor);
        });
    }

    /// Successful poll that delivered nothing
    ///
    /// Ends an error streak without counting as activity, so idle channels
    /// keep stretching toward the maximum interval.
    pub fn record_success(&self, channel: MonitorChannel) {
        let factor = self.current_factor();
        self.with_channel(channel, |state, this| {
            if state.errors == 0 && state.error_multiplier == 1.0 {
                return;
            }
            state.errors = 0;
            state.error_multiplier = 1.0;
            state.last_error = None;
            this.recompute(state, factor);
            debug!("{channel}: recovered, interval now {:?}", state.current);
        });
    }

    /// Failed poll on a channel
    ///
    /// Once the error count reaches the threshold each further error doubles the
    /// channel's interval (bounded by the maximum interval).
    pub fn record_error(&self, channel: MonitorChannel, error: &str) {
        let factor = self.current_factor();
        let threshold = self.config.error_threshold.max(1);

        self.with_channel(channel, |state, this| {
            state.errors = state.errors.saturating_add(1);
            state.last_error = Some(error.to_string());

            if state.errors >= threshold {
                state.error_multiplier = (state.error_multiplier * 2.0).min(MAX_MULTIPLIER);
                this.recompute(state, factor);
                warn!(
                    "{channel}: {} consecutive errors, backing off to {:?}",
                    state.errors, state.current
                );
            }
        });
    }

    /// Slow down channels without activity for the inactivity timeout
    ///
    /// Returns the channels that were slowed.
    pub fn check_inactive_monitors(&self) -> Vec<MonitorChannel> {
        let factor = self.current_factor();
        let timeout = Duration::from_secs(self.config.inactivity_timeout_secs);
        let growth = self.config.inactivity_factor.max(1.0);
        let now = Instant::now();

        MonitorChannel::ALL
            .into_iter()
            .filter(|channel| {
                self.with_channel(*channel, |state, this| {
                    if now.saturating_duration_since(state.last_activity) < timeout {
                        return false;
                    }
                    state.idle_multiplier = (state.idle_multiplier * growth).min(MAX_MULTIPLIER);
                    this.recompute(state, factor);
                    trace!("{channel}: inactive, interval now {:?}", state.current);
                    true
                })
                .unwrap_or(false)
            })
            .collect()
    }

    /// Forget load, error and idle state for every channel
    pub fn reset_to_defaults(&self) {
        {
            let mut load = self
                .load
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            load.factor = 1.0;
        }

        for channel in MonitorChannel::ALL {
            self.with_channel(channel, |state, this| {
                *state = ChannelState::new(this.config.base_interval(channel));
                this.recompute(state, 1.0);
            });
        }

        debug!("adaptive intervals reset to defaults");
    }

    pub fn stats(&self) -> AdaptiveStats {
        let load = *self
            .load
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        let channels = MonitorChannel::ALL
            .into_iter()
            .filter_map(|channel| {
                self.with_channel(channel, |state, _| {
                    (
                        channel,
                        ChannelIntervalStats {
                            base_ms: state.base.as_millis() as u64,
                            current_ms: state.current.as_millis() as u64,
                            errors: state.errors,
                            idle_secs: now.saturating_duration_since(state.last_activity).as_secs(),
                            last_error: state.last_error.clone(),
                        },
                    )
                })
            })
            .collect();

        AdaptiveStats {
            load_factor: load.factor,
            load_average: load.load_average,
            memory_percent: load.memory_percent,
            disk_io_percent: load.disk_io_percent,
            channels,
        }
    }
}

impl Default for AdaptiveIntervalController {
    fn default() -> Self {
        Self::new(AdaptiveConfig::default())
    }
}
