//! OperationManager - owns the lifecycle of background operations
//!
//! ## Admission
//!
//! ```text
//! start_operation(request)
//!   → resolve executor        (UnknownOperationType)
//!   → executor.validate       (ValidationFailed)
//!   → manager still open      (ShuttingDown)
//!   → active < max_concurrent (MaxOperationsReached)
//!   → no active peer in scope (OperationConflict)
//!   → rate limiter            (RateLimitExceeded)
//!   → insert Pending → Running, spawn supervisor, return snapshot
//! ```
//!
//! Rejected submissions never reach the table.
//!
//! ## Execution
//!
//! Every admitted operation gets a supervisor task. The supervisor spawns the
//! executor on a separate task (so a panic is contained), waits for it with the
//! optional per-type timeout and records exactly one terminal transition. The
//! table lock is never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::ratelimit::RateLimiter;

use super::error::{ExecutionError, OperationError, OperationResult};
use super::executor::{
    ExecutionContext, Executor, ExecutorRegistry, ProgressReporter, ProgressSink, ProgressUpdate,
};
use super::types::{
    Operation, OperationFailure, OperationFilter, OperationList, OperationRequest,
    OperationStatus, OperationType,
};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationManagerConfig {
    /// Maximum number of non-terminal operations
    pub max_concurrent: usize,

    /// Maximum number of operations kept in the table (terminal ones are evicted first)
    pub max_history: usize,

    /// How long terminal operations stay queryable
    pub retention_secs: u64,

    /// How long shutdown waits for running operations to acknowledge cancellation
    pub shutdown_grace_secs: u64,

    /// Supervisory time limit per operation type, in seconds
    pub timeouts: HashMap<OperationType, u64>,
}

impl Default for OperationManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_history: 100,
            retention_secs: 3600,
            shutdown_grace_secs: 10,
            timeouts: HashMap::from([
                (OperationType::DiskScan, 3600),
                (OperationType::BulkContainer, 600),
                (OperationType::BulkVm, 900),
                (OperationType::ArrayStart, 300),
                (OperationType::ArrayStop, 300),
            ]),
        }
    }
}

/// Aggregate registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStats {
    pub total: usize,
    pub active: usize,
    pub by_status: BTreeMap<OperationStatus, usize>,
    pub by_type: BTreeMap<OperationType, usize>,
    pub started_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
    pub timed_out_total: u64,
    pub average_duration_ms: Option<f64>,
    pub throughput_per_minute: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    duration_ms_total: i64,
    durations: u64,
}

#[derive(Debug)]
struct OperationEntry {
    operation: Operation,
    cancel: CancellationToken,
}

enum Outcome {
    Finished(Result<Value, ExecutionError>),
    Crashed(JoinError),
    TimedOut(Duration),
    Abandoned,
}

struct Shared {
    config: OperationManagerConfig,
    executors: ExecutorRegistry,
    limiter: Arc<RateLimiter>,
    table: Mutex<HashMap<String, OperationEntry>>,
    counters: Mutex<Counters>,
    events: broadcast::Sender<Operation>,
    tracker: TaskTracker,
    started_at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<String, OperationEntry>> {
        lock(&self.table)
    }

    fn publish(&self, operation: Operation) {
        // no subscribers is fine
        let _ = self.events.send(operation);
    }

    fn check_admission(
        &self,
        table: &HashMap<String, OperationEntry>,
        op_type: OperationType,
    ) -> OperationResult<()> {
        let active = table
            .values()
            .filter(|entry| !entry.operation.status.is_terminal())
            .count();

        if active >= self.config.max_concurrent {
            return Err(OperationError::MaxOperationsReached {
                limit: self.config.max_concurrent,
            });
        }

        let Some(scope) = op_type.resource_scope() else {
            return Ok(());
        };

        let conflict = table.values().find(|entry| {
            !entry.operation.status.is_terminal()
                && entry.operation.op_type.resource_scope() == Some(scope)
        });

        match conflict {
            Some(entry) => Err(OperationError::OperationConflict {
                conflicting_id: entry.operation.id.clone(),
                conflicting_type: entry.operation.op_type,
            }),
            None => Ok(()),
        }
    }

    fn evict(&self, table: &mut HashMap<String, OperationEntry>) -> usize {
        let before = table.len();
        let retention = chrono::Duration::seconds(self.config.retention_secs as i64);
        let cutoff = Utc::now() - retention;

        table.retain(|_, entry| {
            let op = &entry.operation;
            !(op.status.is_terminal() && op.completed.is_some_and(|done| done <= cutoff))
        });

        if table.len() > self.config.max_history {
            let mut terminal: Vec<_> = table
                .values()
                .filter(|entry| entry.operation.status.is_terminal())
                .map(|entry| (entry.operation.completed, entry.operation.id.clone()))
                .collect();
            terminal.sort();

            let excess = table.len() - self.config.max_history;
            for (_, id) in terminal.into_iter().take(excess) {
                table.remove(&id);
            }
        }

        before - table.len()
    }

    fn apply_progress(&self, id: &str, update: ProgressUpdate) {
        let snapshot = {
            let mut table = self.table();
            let Some(entry) = table.get_mut(id) else {
                return;
            };
            let op = &mut entry.operation;
            if op.status.is_terminal() {
                trace!("ignoring progress for terminal operation {id}");
                return;
            }
            if let Some(percent) = update.percent {
                op.progress = Some(percent);
            }
            if let Some(message) = update.message {
                op.message = Some(message);
            }
            op.clone()
        };

        self.publish(snapshot);
    }

    fn finish(&self, id: &str, outcome: Outcome) {
        let mut timed_out = false;

        let (status, result, error) = match outcome {
            Outcome::Finished(Ok(value)) => (OperationStatus::Completed, Some(value), None),
            Outcome::Finished(Err(ExecutionError::Cancelled)) => {
                (OperationStatus::Cancelled, None, None)
            }
            Outcome::Finished(Err(ExecutionError::Failed(err))) => (
                OperationStatus::Failed,
                None,
                Some(OperationFailure::new("ExecutorFailed", format!("{err:#}"))),
            ),
            Outcome::Crashed(err) => {
                let kind = if err.is_panic() {
                    "ExecutorPanicked"
                } else {
                    "ExecutorAborted"
                };
                (
                    OperationStatus::Failed,
                    None,
                    Some(OperationFailure::new(kind, err.to_string())),
                )
            }
            Outcome::TimedOut(limit) => {
                timed_out = true;
                let err = OperationError::OperationTimeout {
                    id: id.to_string(),
                    timeout_secs: limit.as_secs(),
                };
                (
                    OperationStatus::Failed,
                    None,
                    Some(OperationFailure::new(err.kind(), err.to_string())),
                )
            }
            Outcome::Abandoned => (
                OperationStatus::Failed,
                None,
                Some(OperationFailure::new(
                    "ShutdownTimeout",
                    "agent shut down before the operation acknowledged cancellation",
                )),
            ),
        };

        let snapshot = {
            let mut table = self.table();
            let Some(entry) = table.get_mut(id) else {
                debug!("operation {id} finished after eviction");
                return;
            };

            let op = &mut entry.operation;
            if !op.transition(status) {
                trace!("operation {id} already {}, ignoring {status}", op.status);
                return;
            }
            if status == OperationStatus::Completed {
                op.progress = Some(100);
            }
            op.result = result;
            op.error = error;
            op.clone()
        };

        {
            let mut counters = lock(&self.counters);
            match status {
                OperationStatus::Completed => counters.completed += 1,
                OperationStatus::Failed => counters.failed += 1,
                OperationStatus::Cancelled => counters.cancelled += 1,
                _ => {}
            }
            if timed_out {
                counters.timed_out += 1;
            }
            if let Some(ms) = snapshot.duration_ms() {
                counters.duration_ms_total += ms;
                counters.durations += 1;
            }
        }

        match &snapshot.error {
            Some(failure) => warn!(
                "{} operation {id} {status}: {} ({})",
                snapshot.op_type, failure.message, failure.kind
            ),
            None => info!("{} operation {id} {status}", snapshot.op_type),
        }

        self.publish(snapshot);
    }
}

/// Registry of background operations
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct OperationManager {
    shared: Arc<Shared>,
}

impl OperationManager {
    pub fn new(
        config: OperationManagerConfig,
        executors: ExecutorRegistry,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config,
                executors,
                limiter,
                table: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                events,
                tracker: TaskTracker::new(),
                started_at: Instant::now(),
            }),
        }
    }

    /// Receive every operation snapshot after each state or progress change
    pub fn subscribe(&self) -> broadcast::Receiver<Operation> {
        self.shared.events.subscribe()
    }

    pub fn executor_types(&self) -> Vec<OperationType> {
        self.shared.executors.types()
    }

    /// Admit and launch an operation
    ///
    /// Returns as soon as the operation is `Running`; the executor continues on
    /// its own task.
    pub fn start_operation(
        &self,
        request: OperationRequest,
        created_by: &str,
    ) -> OperationResult<Operation> {
        let op_type: OperationType = request
            .op_type
            .parse()
            .map_err(OperationError::UnknownOperationType)?;

        let executor = self
            .shared
            .executors
            .get(op_type)
            .ok_or_else(|| OperationError::UnknownOperationType(request.op_type.clone()))?;

        executor
            .validate(&request.parameters)
            .map_err(OperationError::ValidationFailed)?;

        let description = request
            .description
            .filter(|description| !description.trim().is_empty())
            .unwrap_or_else(|| format!("{op_type} requested by {created_by}"));

        let operation = Operation::new(
            op_type,
            request.parameters,
            description,
            created_by.to_string(),
        );
        let id = operation.id.clone();
        let cancel = CancellationToken::new();

        let snapshot = {
            let mut table = self.shared.table();
            // shutdown closes the tracker under this lock
            if self.shared.tracker.is_closed() {
                debug!("rejecting {op_type} from {created_by}: shutting down");
                return Err(OperationError::ShuttingDown);
            }

            self.shared.evict(&mut table);
            self.shared.check_admission(&table, op_type)?;

            // only admissions that pass every other check consume a slot
            let class = op_type.rate_class();
            if !self.shared.limiter.allow(created_by, class) {
                let limit = self.shared.limiter.get_limit(class);
                debug!("rejecting {op_type} from {created_by}: rate limit {limit}");
                return Err(OperationError::RateLimitExceeded { class, limit });
            }

            let entry = table.entry(id.clone()).or_insert(OperationEntry {
                operation,
                cancel: cancel.clone(),
            });
            entry.operation.transition(OperationStatus::Running);
            entry.operation.clone()
        };

        lock(&self.shared.counters).started += 1;
        info!("started {op_type} operation {id} for {created_by}");
        self.shared.publish(snapshot.clone());

        let ctx = ExecutionContext::new(
            id.clone(),
            snapshot.parameters.clone(),
            cancel,
            self.progress_reporter(&id),
        );
        let timeout = self
            .shared
            .config
            .timeouts
            .get(&op_type)
            .map(|secs| Duration::from_secs(*secs));

        let span = info_span!("operation", id = %id, op_type = %op_type);
        self.shared.tracker.spawn(
            supervise(self.shared.clone(), id, executor, ctx, timeout).instrument(span),
        );

        Ok(snapshot)
    }

    fn progress_reporter(&self, id: &str) -> ProgressReporter {
        let weak = Arc::downgrade(&self.shared);
        let sink: ProgressSink = Arc::new(move |id, update| {
            if let Some(shared) = weak.upgrade() {
                shared.apply_progress(id, update);
            }
        });
        ProgressReporter::new(id, sink)
    }

    pub fn get_operation(&self, id: &str) -> OperationResult<Operation> {
        self.shared
            .table()
            .get(id)
            .map(|entry| entry.operation.clone())
            .ok_or_else(|| OperationError::OperationNotFound(id.to_string()))
    }

    /// List operations, newest first
    pub fn list_operations(&self, filter: &OperationFilter) -> OperationList {
        let mut items: Vec<Operation> = self
            .shared
            .table()
            .values()
            .filter(|entry| filter.matches(&entry.operation))
            .map(|entry| entry.operation.clone())
            .collect();

        items.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));

        let total = items.len();
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let items = items.into_iter().skip(offset).take(limit).collect();

        OperationList {
            items,
            total,
            offset,
            limit,
        }
    }

    /// Request cooperative cancellation
    ///
    /// The operation becomes `Cancelled` once its executor acknowledges the
    /// signal; if the executor finishes first, its own outcome is recorded.
    pub fn cancel_operation(&self, id: &str) -> OperationResult<Operation> {
        let snapshot = {
            let mut table = self.shared.table();
            let entry = table
                .get_mut(id)
                .ok_or_else(|| OperationError::OperationNotFound(id.to_string()))?;

            let op = &mut entry.operation;
            if !op.cancellable || op.status.is_terminal() {
                return Err(OperationError::not_cancellable(id, op.status, op.cancellable));
            }

            op.cancel_requested = true;
            entry.cancel.cancel();

            if op.status == OperationStatus::Pending {
                op.transition(OperationStatus::Cancelled);
            }
            op.clone()
        };

        info!("cancellation requested for {} operation {id}", snapshot.op_type);
        self.shared.publish(snapshot.clone());

        Ok(snapshot)
    }

    pub fn get_stats(&self) -> OperationStats {
        let mut by_status: BTreeMap<OperationStatus, usize> =
            OperationStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut by_type: BTreeMap<OperationType, usize> = BTreeMap::new();

        let total = {
            let table = self.shared.table();
            for entry in table.values() {
                *by_status.entry(entry.operation.status).or_default() += 1;
                *by_type.entry(entry.operation.op_type).or_default() += 1;
            }
            table.len()
        };

        let active = by_status
            .iter()
            .filter(|(status, _)| !status.is_terminal())
            .map(|(_, count)| count)
            .sum();

        let uptime = self.shared.started_at.elapsed();
        let counters = lock(&self.shared.counters);
        let finished = counters.completed + counters.failed + counters.cancelled;
        let minutes = uptime.as_secs_f64() / 60.0;

        OperationStats {
            total,
            active,
            by_status,
            by_type,
            started_total: counters.started,
            completed_total: counters.completed,
            failed_total: counters.failed,
            cancelled_total: counters.cancelled,
            timed_out_total: counters.timed_out,
            average_duration_ms: (counters.durations > 0)
                .then(|| counters.duration_ms_total as f64 / counters.durations as f64),
            throughput_per_minute: if minutes > 0.0 {
                finished as f64 / minutes
            } else {
                0.0
            },
            uptime_secs: uptime.as_secs(),
        }
    }

    /// Evict expired terminal operations; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let mut table = self.shared.table();
        let evicted = self.shared.evict(&mut table);
        if evicted > 0 {
            debug!("evicted {evicted} terminal operations");
        }
        evicted
    }

    /// Periodically evict expired operations until `shutdown` fires
    pub async fn run_maintenance(&self, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup();
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Cancel every non-terminal operation and wait (bounded) for acknowledgement
    ///
    /// Operations that do not acknowledge within the grace period are recorded
    /// as failed.
    pub async fn shutdown(&self) {
        let pending: Vec<(String, CancellationToken)> = {
            let table = self.shared.table();
            self.shared.tracker.close();
            table
                .values()
                .filter(|entry| !entry.operation.status.is_terminal())
                .map(|entry| (entry.operation.id.clone(), entry.cancel.clone()))
                .collect()
        };

        info!("shutting down operation manager, cancelling {} operations", pending.len());

        for (_, token) in &pending {
            token.cancel();
        }

        let grace = Duration::from_secs(self.shared.config.shutdown_grace_secs);

        if tokio::time::timeout(grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!("operations did not stop within {grace:?}, abandoning them");
            for (id, _) in pending {
                self.shared.finish(&id, Outcome::Abandoned);
            }
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    id: String,
    executor: Arc<dyn Executor>,
    ctx: ExecutionContext,
    timeout: Option<Duration>,
) {
    let cancel = ctx.cancel.clone();
    let mut execution = tokio::spawn(async move { executor.execute(ctx).await });

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
            Ok(joined) => joined.map_or_else(Outcome::Crashed, Outcome::Finished),
            Err(_) => {
                // stop waiting; the executor may keep running until it sees the signal
                cancel.cancel();
                Outcome::TimedOut(limit)
            }
        },
        None => execution
            .await
            .map_or_else(Outcome::Crashed, Outcome::Finished),
    };

    shared.finish(&id, outcome);
}
