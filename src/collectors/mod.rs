//! Narrow query interfaces to the host data sources
//!
//! The broadcast hub only ever talks to these traits; the default
//! implementations read from `sysinfo` and shell out to `docker`/`virsh`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::executors::ExecutorConfig;
use crate::{ContainerInfo, DiskInfo, SystemStats, TemperatureReading, VmInfo};

mod command;
mod sysinfo;

pub use self::command::{DockerCollector, VirshCollector, parse_docker_ps, parse_virsh_list};
pub use self::sysinfo::SysinfoCollector;

#[async_trait]
pub trait SystemCollector: Send + Sync {
    async fn system_stats(&self) -> anyhow::Result<SystemStats>;

    async fn temperatures(&self) -> anyhow::Result<Vec<TemperatureReading>>;

    async fn disks(&self) -> anyhow::Result<Vec<DiskInfo>>;
}

#[async_trait]
pub trait ContainerCollector: Send + Sync {
    async fn containers(&self) -> anyhow::Result<Vec<ContainerInfo>>;
}

#[async_trait]
pub trait VmCollector: Send + Sync {
    async fn vms(&self) -> anyhow::Result<Vec<VmInfo>>;
}

/// The set of collectors the pollers read from
#[derive(Clone)]
pub struct Collectors {
    pub system: Arc<dyn SystemCollector>,
    pub containers: Arc<dyn ContainerCollector>,
    pub vms: Arc<dyn VmCollector>,
}

impl Collectors {
    pub fn new(
        system: impl SystemCollector + 'static,
        containers: impl ContainerCollector + 'static,
        vms: impl VmCollector + 'static,
    ) -> Self {
        Self {
            system: Arc::new(system),
            containers: Arc::new(containers),
            vms: Arc::new(vms),
        }
    }

    /// Collectors backed by the local host
    pub fn host(config: &ExecutorConfig) -> Self {
        Self::new(
            SysinfoCollector::new(),
            DockerCollector::new(&config.docker),
            VirshCollector::new(&config.virsh),
        )
    }
}
