//! ChannelPoller - one polling loop per monitoring channel
//!
//! ## Message Flow
//!
//! ```text
//! sleep(adaptive interval) → query collectors → frame(s) → ConnectionRegistry
//!     ↑                            │ error
//!     │                            └─▶ record_error + "error" frame
//!     └─── Commands (PollNow, Shutdown)
//! ```
//!
//! The sleep length is re-read from the [`AdaptiveIntervalController`] before
//! every tick, so load and error back-off apply from the next cycle on.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::adaptive::{AdaptiveIntervalController, MonitorChannel};
use crate::alerts::AlertEngine;
use crate::collectors::Collectors;
use crate::{ContainerInfo, DiskInfo, LoadAverage, VmInfo};

use super::connections::ConnectionRegistry;
use super::diff::SnapshotDiff;
use super::Frame;

/// Everything a poller reads from or writes to
#[derive(Clone)]
pub struct PollerContext {
    pub collectors: Collectors,
    pub controller: Arc<AdaptiveIntervalController>,
    pub registry: Arc<ConnectionRegistry>,
    pub alerts: Arc<AlertEngine>,
}

#[derive(Debug)]
pub enum PollerCommand {
    /// Poll immediately, replying with the number of frames delivered
    PollNow {
        respond_to: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateCounts {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
}

impl StateCounts {
    fn count<'a>(states: impl Iterator<Item = &'a str>) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.total += 1;
            *counts.by_state.entry(state.to_string()).or_default() += 1;
        }
        counts
    }
}

/// Combined host overview published on the infrastructure channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureSummary {
    pub host_name: Option<String>,
    pub uptime_secs: u64,
    pub load: LoadAverage,
    pub cpu_usage_percent: f32,
    pub memory_used_percent: f32,
    pub containers: StateCounts,
    pub vms: StateCounts,
    pub disks: usize,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
}

pub struct ChannelPoller {
    channel: MonitorChannel,
    ctx: PollerContext,
    command_rx: mpsc::Receiver<PollerCommand>,
    shutdown: CancellationToken,
    containers: SnapshotDiff<ContainerInfo>,
    vms: SnapshotDiff<VmInfo>,
    disks: SnapshotDiff<DiskInfo>,
}

impl ChannelPoller {
    pub fn new(
        channel: MonitorChannel,
        ctx: PollerContext,
        command_rx: mpsc::Receiver<PollerCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channel,
            ctx,
            command_rx,
            shutdown,
            containers: SnapshotDiff::new(),
            vms: SnapshotDiff::new(),
            disks: SnapshotDiff::new(),
        }
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn run(mut self) {
        debug!("starting poller");

        let mut next = Instant::now();

        loop {
            tokio::select! {
                _ = sleep_until(next) => {
                    // errors are already logged and published by tick()
                    let _ = self.tick().await;
                    next = Instant::now() + self.ctx.controller.get_interval(self.channel);
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PollerCommand::PollNow { respond_to } => {
                            trace!("received PollNow command");
                            let result = self.tick().await;
                            let _ = respond_to.send(result);
                        }
                        PollerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                _ = self.shutdown.cancelled() => break,
            }
        }

        debug!("poller stopped");
    }

    /// One poll; collector failures degrade into an error frame
    async fn tick(&mut self) -> Result<usize> {
        let endpoint = self.channel.endpoint();

        match self.poll().await {
            Ok(delivered) => {
                if delivered > 0 {
                    self.ctx.controller.record_activity(self.channel);
                } else {
                    self.ctx.controller.record_success(self.channel);
                }
                trace!("delivered {delivered} frames");
                Ok(delivered)
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!("poll failed: {message}");
                self.ctx.controller.record_error(self.channel, &message);
                self.ctx.registry.broadcast(
                    endpoint,
                    "error",
                    json!({ "channel": self.channel.name(), "error": message }),
                );
                Err(err)
            }
        }
    }

    async fn poll(&mut self) -> Result<usize> {
        let endpoint = self.channel.endpoint();
        let collectors = &self.ctx.collectors;
        let registry = &self.ctx.registry;

        match self.channel {
            MonitorChannel::SystemStats => {
                let stats = collectors
                    .system
                    .system_stats()
                    .await
                    .context("failed to collect system stats")?;

                let cores = stats.cpu.cores.max(1) as f64;
                self.ctx.controller.update_system_load(
                    stats.load.one / cores,
                    stats.memory.used_percent(),
                    stats.disk_io_percent.unwrap_or(0.0),
                );

                Ok(registry.broadcast_snapshot(endpoint, "system_stats", &stats))
            }

            MonitorChannel::Temperature => {
                let readings = collectors
                    .system
                    .temperatures()
                    .await
                    .context("failed to read temperatures")?;
                let alerts = self.ctx.alerts.process_temperatures(&readings);

                Ok(registry.broadcast_snapshot(
                    endpoint,
                    "temperature",
                    json!({ "readings": readings, "alerts": alerts }),
                ))
            }

            MonitorChannel::ResourceAlerts => {
                let (stats, disks) =
                    tokio::try_join!(collectors.system.system_stats(), collectors.system.disks())
                        .context("failed to collect resource usage")?;

                let mut usage = BTreeMap::from([
                    ("cpu".to_string(), stats.cpu.usage_percent),
                    ("memory".to_string(), stats.memory.used_percent()),
                ]);
                for disk in &disks {
                    usage.insert(format!("disk:{}", disk.mount_point), disk.used_percent());
                }

                let alerts: Vec<_> = usage
                    .iter()
                    .filter_map(|(name, percent)| self.ctx.alerts.process_resource(name, *percent))
                    .collect();

                Ok(registry.broadcast_snapshot(
                    endpoint,
                    "resource_usage",
                    json!({ "usage": usage, "alerts": alerts }),
                ))
            }

            MonitorChannel::DockerEvents => {
                let containers = collectors
                    .containers
                    .containers()
                    .await
                    .context("failed to list containers")?;

                Ok(publish_changes(
                    registry,
                    endpoint,
                    &mut self.containers,
                    &containers,
                    ("containers", "container_event"),
                    |container| container.id.clone(),
                    |before, after| before == after,
                ))
            }

            MonitorChannel::VmEvents => {
                let vms = collectors.vms.vms().await.context("failed to list VMs")?;

                Ok(publish_changes(
                    registry,
                    endpoint,
                    &mut self.vms,
                    &vms,
                    ("vms", "vm_event"),
                    |vm| vm.name.clone(),
                    |before, after| before == after,
                ))
            }

            MonitorChannel::StorageStatus => {
                let disks = collectors
                    .system
                    .disks()
                    .await
                    .context("failed to list disks")?;

                Ok(publish_changes(
                    registry,
                    endpoint,
                    &mut self.disks,
                    &disks,
                    ("disks", "disk_event"),
                    |disk| disk.mount_point.clone(),
                    // free space moves on every poll; it is carried by the snapshot
                    |before, after| {
                        before.device == after.device
                            && before.file_system == after.file_system
                            && before.total_bytes == after.total_bytes
                    },
                ))
            }

            MonitorChannel::Infrastructure => {
                let (stats, containers, vms, disks) = tokio::try_join!(
                    collectors.system.system_stats(),
                    collectors.containers.containers(),
                    collectors.vms.vms(),
                    collectors.system.disks(),
                )
                .context("failed to collect infrastructure summary")?;

                let summary = InfrastructureSummary {
                    host_name: stats.host_name.clone(),
                    uptime_secs: stats.uptime_secs,
                    load: stats.load,
                    cpu_usage_percent: stats.cpu.usage_percent,
                    memory_used_percent: stats.memory.used_percent(),
                    containers: StateCounts::count(containers.iter().map(|c| c.state.as_str())),
                    vms: StateCounts::count(vms.iter().map(|vm| vm.state.as_str())),
                    disks: disks.len(),
                    disk_total_bytes: disks.iter().map(|d| d.total_bytes).sum(),
                    disk_available_bytes: disks.iter().map(|d| d.available_bytes).sum(),
                };

                Ok(registry.broadcast_snapshot(endpoint, "infrastructure", &summary))
            }
        }
    }
}

/// Publish a full snapshot on the first poll, then one event per changed entity
///
/// The cached snapshot is refreshed on every poll so late subscribers start
/// from the current state.
fn publish_changes<T: Clone + PartialEq + Serialize>(
    registry: &ConnectionRegistry,
    endpoint: &str,
    diff: &mut SnapshotDiff<T>,
    items: &[T],
    (snapshot_type, event_type): (&str, &str),
    key: impl Fn(&T) -> String,
    same: impl Fn(&T, &T) -> bool,
) -> usize {
    let first = diff.is_empty();
    let changes = diff.update_by(items, key, same);

    if first {
        return registry.broadcast_snapshot(endpoint, snapshot_type, items);
    }

    registry.set_latest(endpoint, Frame::new(snapshot_type, items));

    changes
        .iter()
        .map(|change| registry.broadcast(endpoint, event_type, change))
        .sum()
}

/// Handle for controlling a [`ChannelPoller`]
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
    pub channel: MonitorChannel,
}

impl PollerHandle {
    pub fn new(channel: MonitorChannel, sender: mpsc::Sender<PollerCommand>) -> Self {
        Self { sender, channel }
    }

    /// Poll immediately, bypassing the interval
    pub async fn poll_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive poll result")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PollerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
