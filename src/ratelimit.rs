//! Sliding-window admission control
//!
//! Two scopes share one limiter: the coarse [`OperationClass::General`] class that
//! every REST request passes through, and the fine-grained classes consulted by the
//! operation manager before it admits expensive or dangerous work.
//!
//! ## Algorithm
//!
//! ```text
//! allow(client, class):
//!   bucket = buckets[(class, client)]
//!   drop admissions older than window
//!   admissions.len() < limit  → record now, admit
//!   otherwise                 → deny (never queue)
//! ```
//!
//! Inconsistent state (poisoned lock, zero-length window) denies.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Admission classes with independently configured limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    General,
    ParityCheck,
    ArrayControl,
    DiskScan,
    BulkContainer,
    BulkVm,
    SystemPower,
}

impl OperationClass {
    pub const ALL: [OperationClass; 7] = [
        OperationClass::General,
        OperationClass::ParityCheck,
        OperationClass::ArrayControl,
        OperationClass::DiskScan,
        OperationClass::BulkContainer,
        OperationClass::BulkVm,
        OperationClass::SystemPower,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::General => "general",
            OperationClass::ParityCheck => "parity_check",
            OperationClass::ArrayControl => "array_control",
            OperationClass::DiskScan => "disk_scan",
            OperationClass::BulkContainer => "bulk_container",
            OperationClass::BulkVm => "bulk_vm",
            OperationClass::SystemPower => "system_power",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `requests` admissions per `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requests per {}s", self.requests, self.window_secs)
    }
}

pub fn default_general_limit() -> RateLimit {
    RateLimit::new(120, 60)
}

/// Built-in limits for the operation classes
pub fn default_class_limits() -> HashMap<OperationClass, RateLimit> {
    HashMap::from([
        (OperationClass::ParityCheck, RateLimit::new(5, 3600)),
        (OperationClass::ArrayControl, RateLimit::new(10, 300)),
        (OperationClass::DiskScan, RateLimit::new(10, 300)),
        (OperationClass::BulkContainer, RateLimit::new(20, 60)),
        (OperationClass::BulkVm, RateLimit::new(20, 60)),
        (OperationClass::SystemPower, RateLimit::new(3, 3600)),
    ])
}

#[derive(Debug, Default)]
struct RateLimitBucket {
    admissions: VecDeque<Instant>,
    last_seen: Option<Instant>,
}

impl RateLimitBucket {
    fn try_admit(&mut self, limit: RateLimit, now: Instant) -> bool {
        let window = limit.window();

        while let Some(&oldest) = self.admissions.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }

        self.last_seen = Some(now);

        if self.admissions.len() < limit.requests as usize {
            self.admissions.push_back(now);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    allowed: u64,
    denied: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    buckets: HashMap<(OperationClass, String), RateLimitBucket>,
    counters: HashMap<OperationClass, Counters>,
}

/// Per-class statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassStats {
    pub limit: Option<RateLimit>,
    pub allowed: u64,
    pub denied: u64,
    pub tracked_clients: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub classes: BTreeMap<OperationClass, ClassStats>,
}

/// Sliding-window rate limiter keyed by `(class, client)`
#[derive(Debug)]
pub struct RateLimiter {
    limits: HashMap<OperationClass, RateLimit>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter from per-class limits
    ///
    /// Classes without an entry are admitted under the general limit.
    pub fn new(mut limits: HashMap<OperationClass, RateLimit>) -> Self {
        limits
            .entry(OperationClass::General)
            .or_insert_with(default_general_limit);

        Self {
            limits,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_class_limits())
    }

    /// Configured limit for a class (falls back to the general limit)
    pub fn get_limit(&self, class: OperationClass) -> RateLimit {
        self.limits
            .get(&class)
            .or_else(|| self.limits.get(&OperationClass::General))
            .copied()
            .unwrap_or_else(default_general_limit)
    }

    /// All explicitly configured limits
    pub fn limits(&self) -> BTreeMap<OperationClass, RateLimit> {
        self.limits.iter().map(|(c, l)| (*c, *l)).collect()
    }

    /// Check and record one admission
    ///
    /// Returns immediately; a denial never blocks the caller.
    pub fn allow(&self, client: &str, class: OperationClass) -> bool {
        let limit = self.get_limit(class);

        if limit.window_secs == 0 {
            warn!("rate limit for {class} has an empty window, denying");
            return false;
        }

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!("rate limiter state poisoned, denying {class} for {client}");
                return false;
            }
        };

        let now = Instant::now();
        let admitted = state
            .buckets
            .entry((class, client.to_string()))
            .or_default()
            .try_admit(limit, now);

        let counters = state.counters.entry(class).or_default();
        if admitted {
            counters.allowed += 1;
        } else {
            counters.denied += 1;
        }

        trace!("rate limit {class} for {client}: admitted={admitted} ({limit})");

        admitted
    }

    /// Drop buckets that have not been touched for `max_idle`
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };

        let now = Instant::now();
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| {
            bucket
                .last_seen
                .is_some_and(|seen| now.saturating_duration_since(seen) < max_idle)
        });

        before - state.buckets.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut classes: BTreeMap<OperationClass, ClassStats> = OperationClass::ALL
            .iter()
            .map(|class| {
                (
                    *class,
                    ClassStats {
                        limit: self.limits.get(class).copied(),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let Ok(state) = self.state.lock() else {
            return RateLimiterStats { classes };
        };

        for (class, counters) in &state.counters {
            let entry = classes.entry(*class).or_default();
            entry.allowed = counters.allowed;
            entry.denied = counters.denied;
        }

        for (class, _) in state.buckets.keys() {
            classes.entry(*class).or_default().tracked_clients += 1;
        }

        RateLimiterStats { classes }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(HashMap::from([(
            OperationClass::ParityCheck,
            RateLimit::new(requests, window_secs),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_plus_one_is_denied() {
        let limiter = limiter(3, 60);

        for _ in 0..3 {
            assert!(limiter.allow("client", OperationClass::ParityCheck));
        }
        assert!(!limiter.allow("client", OperationClass::ParityCheck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(2, 10);

        assert!(limiter.allow("client", OperationClass::ParityCheck));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.allow("client", OperationClass::ParityCheck));
        assert!(!limiter.allow("client", OperationClass::ParityCheck));

        // first admission leaves the window, second is still inside
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.allow("client", OperationClass::ParityCheck));
        assert!(!limiter.allow("client", OperationClass::ParityCheck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_isolated() {
        let limiter = limiter(1, 60);

        assert!(limiter.allow("a", OperationClass::ParityCheck));
        assert!(!limiter.allow("a", OperationClass::ParityCheck));
        assert!(limiter.allow("b", OperationClass::ParityCheck));
    }

    #[test]
    fn test_unconfigured_class_uses_general_limit() {
        let limiter = RateLimiter::new(HashMap::from([(
            OperationClass::General,
            RateLimit::new(1, 60),
        )]));

        assert_eq!(
            limiter.get_limit(OperationClass::BulkVm),
            RateLimit::new(1, 60)
        );
        assert!(limiter.allow("c", OperationClass::BulkVm));
        assert!(!limiter.allow("c", OperationClass::BulkVm));
    }

    #[test]
    fn test_zero_window_fails_closed() {
        let limiter = limiter(100, 0);
        assert!(!limiter.allow("client", OperationClass::ParityCheck));
    }

    #[test]
    fn test_zero_requests_denies_everything() {
        let limiter = limiter(0, 60);
        assert!(!limiter.allow("client", OperationClass::ParityCheck));
    }

    #[test]
    fn test_poisoned_state_fails_closed() {
        let limiter = std::sync::Arc::new(limiter(100, 60));
        let clone = limiter.clone();

        let _ = std::thread::spawn(move || {
            let _guard = clone.state.lock().unwrap();
            panic!("poison the limiter");
        })
        .join();

        assert!(!limiter.allow("client", OperationClass::ParityCheck));
    }

    #[test]
    fn test_stats_count_allowed_and_denied() {
        let limiter = limiter(1, 60);
        limiter.allow("a", OperationClass::ParityCheck);
        limiter.allow("a", OperationClass::ParityCheck);
        limiter.allow("b", OperationClass::ParityCheck);

        let stats = limiter.stats();
        let parity = &stats.classes[&OperationClass::ParityCheck];
        assert_eq!(parity.allowed, 2);
        assert_eq!(parity.denied, 1);
        assert_eq!(parity.tracked_clients, 2);
        assert_eq!(parity.limit, Some(RateLimit::new(1, 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_idle_buckets() {
        let limiter = limiter(5, 60);
        limiter.allow("a", OperationClass::ParityCheck);
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter.allow("b", OperationClass::ParityCheck);

        assert_eq!(limiter.cleanup(Duration::from_secs(60)), 1);
        assert_eq!(
            limiter.stats().classes[&OperationClass::ParityCheck].tracked_clients,
            1
        );
    }
}
