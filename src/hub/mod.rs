//! Broadcast hub
//!
//! Owns one [`ChannelPoller`] per [`MonitorChannel`] plus the background tasks
//! that forward operation and alert events, back off idle channels and reap
//! dead subscribers. All frames go through the shared [`ConnectionRegistry`].

mod connections;
mod diff;
mod poller;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::adaptive::MonitorChannel;
use crate::operations::OperationManager;

pub use self::connections::{
    ConnectionRegistry, ConnectionStats, EndpointStats, SubscriberId, Subscription,
};
pub use self::diff::{Change, ChangeKind, SnapshotDiff};
pub use self::poller::{
    ChannelPoller, InfrastructureSummary, PollerCommand, PollerContext, PollerHandle, StateCounts,
};

/// Endpoint carrying operation state changes
pub const OPERATIONS_ENDPOINT: &str = "operations";

/// Every endpoint a subscriber may attach to
pub fn endpoints() -> Vec<&'static str> {
    let mut endpoints: Vec<_> = MonitorChannel::ALL.iter().map(|c| c.endpoint()).collect();
    endpoints.push(OPERATIONS_ENDPOINT);
    endpoints
}

pub fn is_known_endpoint(endpoint: &str) -> bool {
    endpoint == OPERATIONS_ENDPOINT || MonitorChannel::from_endpoint(endpoint).is_some()
}

/// One message pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Frame {
    pub fn new(frame_type: &str, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data)
            .unwrap_or_else(|e| json!({ "error": format!("failed to serialize frame: {e}") }));

        Self {
            frame_type: frame_type.to_string(),
            data,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Subscribers silent for twice this long are reaped
    pub heartbeat: Duration,
    /// How often idle channels are checked for back-off
    pub inactivity_check: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            inactivity_check: Duration::from_secs(60),
        }
    }
}

pub struct BroadcastHub {
    registry: Arc<ConnectionRegistry>,
    pollers: BTreeMap<MonitorChannel, PollerHandle>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BroadcastHub {
    /// Spawn all pollers and background tasks
    pub fn start(ctx: PollerContext, operations: &OperationManager, config: HubConfig) -> Self {
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut pollers = BTreeMap::new();

        for channel in MonitorChannel::ALL {
            let (tx, rx) = mpsc::channel(16);
            let poller = ChannelPoller::new(channel, ctx.clone(), rx, shutdown.child_token());
            tasks.spawn(poller.run());
            pollers.insert(channel, PollerHandle::new(channel, tx));
        }

        tasks.spawn(forward(
            operations.subscribe(),
            ctx.registry.clone(),
            OPERATIONS_ENDPOINT,
            "operation_update",
            shutdown.child_token(),
        ));

        tasks.spawn(forward(
            ctx.alerts.subscribe(),
            ctx.registry.clone(),
            MonitorChannel::ResourceAlerts.endpoint(),
            "alert",
            shutdown.child_token(),
        ));

        tasks.spawn(housekeeping(ctx.clone(), config, shutdown.child_token()));

        info!("broadcast hub started with {} pollers", pollers.len());

        Self {
            registry: ctx.registry,
            pollers,
            shutdown,
            tasks,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn poller(&self, channel: MonitorChannel) -> Option<&PollerHandle> {
        self.pollers.get(&channel)
    }

    /// Stop every task, waiting at most `grace`, then disconnect all subscribers
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down broadcast hub");
        self.shutdown.cancel();
        self.tasks.close();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("hub tasks did not stop within {grace:?}");
        }

        self.registry.close_all();
    }
}

/// Republish events from a broadcast channel onto an endpoint
#[instrument(skip(rx, registry, shutdown))]
async fn forward<T: Clone + Serialize>(
    mut rx: broadcast::Receiver<T>,
    registry: Arc<ConnectionRegistry>,
    endpoint: &'static str,
    frame_type: &'static str,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    registry.broadcast(endpoint, frame_type, &event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("forwarder lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    debug!("forwarder stopped");
}

/// Periodic heartbeat reaping and idle-channel back-off
async fn housekeeping(ctx: PollerContext, config: HubConfig, shutdown: CancellationToken) {
    let mut heartbeat = tokio::time::interval(config.heartbeat);
    let mut inactivity = tokio::time::interval(config.inactivity_check);
    heartbeat.tick().await;
    inactivity.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let reaped = ctx.registry.reap_stale(config.heartbeat * 2);
                if reaped > 0 {
                    info!("reaped {reaped} unresponsive subscribers");
                }
            }
            _ = inactivity.tick() => {
                let idle = ctx.controller.check_inactive_monitors();
                if !idle.is_empty() {
                    debug!("backed off idle channels: {idle:?}");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
