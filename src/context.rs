//! Wiring of the agent's long-lived components
//!
//! ```text
//!                 ┌──────────────┐
//!   REST ────────▶│ RateLimiter  │◀──────── OperationManager ──▶ Executors
//!                 └──────────────┘                 │ events
//!   Collectors ──▶ ChannelPollers ──▶ ConnectionRegistry ◀──┤
//!        │              ▲                                   │
//!        └─▶ AlertEngine ┼──────────────────────────────────┘
//!                        └── AdaptiveIntervalController
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::adaptive::AdaptiveIntervalController;
use crate::alerts::{AlertEngine, OperationActions};
use crate::collectors::Collectors;
use crate::config::Config;
use crate::hub::{BroadcastHub, ConnectionRegistry, PollerContext};
use crate::operations::{ExecutorRegistry, OperationManager};
use crate::ratelimit::RateLimiter;

/// How often expired operations and idle rate-limit buckets are dropped
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

/// The running agent; must be started inside a tokio runtime
pub struct AgentContext {
    pub config: Config,
    pub limiter: Arc<RateLimiter>,
    pub controller: Arc<AdaptiveIntervalController>,
    pub operations: OperationManager,
    pub alerts: Arc<AlertEngine>,
    pub hub: BroadcastHub,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AgentContext {
    /// Build every component and spawn the pollers and maintenance tasks
    pub fn start(
        config: Config,
        collectors: Collectors,
        executors: ExecutorRegistry,
    ) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.limits()));
        let controller = Arc::new(AdaptiveIntervalController::new(
            config.monitoring.adaptive.clone(),
        ));
        let operations =
            OperationManager::new(config.operations.clone(), executors, limiter.clone());

        let actions = OperationActions::new(
            operations.clone(),
            config.alerts.throttle_containers.clone(),
        );
        let alerts = Arc::new(AlertEngine::new(&config.alerts, Arc::new(actions))?);

        let registry = Arc::new(ConnectionRegistry::new(config.monitoring.subscriber_queue));
        let hub = BroadcastHub::start(
            PollerContext {
                collectors,
                controller: controller.clone(),
                registry,
                alerts: alerts.clone(),
            },
            &operations,
            config.monitoring.hub(),
        );

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn({
            let operations = operations.clone();
            let token = shutdown.child_token();
            async move { operations.run_maintenance(MAINTENANCE_PERIOD, token).await }
        });

        tasks.spawn(prune_rate_limits(limiter.clone(), shutdown.child_token()));

        info!("agent started");

        Ok(Self {
            config,
            limiter,
            controller,
            operations,
            alerts,
            hub,
            shutdown,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.hub.registry()
    }

    /// Stop polling, then cancel running operations and wait for them
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.operations.shutdown_grace_secs);

        self.shutdown.cancel();
        self.tasks.close();
        self.hub.shutdown(grace).await;
        self.operations.shutdown().await;
        self.tasks.wait().await;

        info!("agent stopped");
    }
}

/// Forget clients that have been quiet for longer than the widest window
async fn prune_rate_limits(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    let max_idle = limiter
        .limits()
        .values()
        .map(|limit| limit.window())
        .max()
        .unwrap_or(MAINTENANCE_PERIOD);

    let mut ticker = tokio::time::interval(MAINTENANCE_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pruned = limiter.cleanup(max_idle);
                if pruned > 0 {
                    debug!("pruned {pruned} idle rate-limit buckets");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
