use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use ::sysinfo::{Components, Disks, System};

use crate::{CpuStats, DiskInfo, LoadAverage, MemoryStats, SystemStats, TemperatureReading};

use super::SystemCollector;

/// Host metrics from `sysinfo`
///
/// Keeps the `System` between polls so CPU usage is measured against the
/// previous refresh.
#[derive(Clone)]
pub struct SysinfoCollector {
    system: Arc<Mutex<System>>,
}

impl SysinfoCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemCollector for SysinfoCollector {
    async fn system_stats(&self) -> anyhow::Result<SystemStats> {
        let system = self.system.clone();

        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let load = System::load_average();

            SystemStats {
                host_name: System::host_name(),
                uptime_secs: System::uptime(),
                cpu: CpuStats {
                    cores: sys.cpus().len(),
                    arch: System::cpu_arch(),
                    usage_percent: sys.global_cpu_usage(),
                },
                memory: MemoryStats {
                    total: sys.total_memory(),
                    used: sys.used_memory(),
                    total_swap: sys.total_swap(),
                    used_swap: sys.used_swap(),
                },
                load: LoadAverage {
                    one: load.one,
                    five: load.five,
                    fifteen: load.fifteen,
                },
                disk_io_percent: None,
            }
        })
        .await
        .context("system stats collection panicked")
    }

    async fn temperatures(&self) -> anyhow::Result<Vec<TemperatureReading>> {
        tokio::task::spawn_blocking(|| {
            Components::new_with_refreshed_list()
                .iter()
                .filter_map(|component| {
                    Some(TemperatureReading {
                        sensor: component.label().to_string(),
                        celsius: component.temperature()?,
                        critical: component.critical(),
                    })
                })
                .collect()
        })
        .await
        .context("temperature collection panicked")
    }

    async fn disks(&self) -> anyhow::Result<Vec<DiskInfo>> {
        tokio::task::spawn_blocking(|| {
            Disks::new_with_refreshed_list()
                .iter()
                .map(|disk| DiskInfo {
                    device: disk.name().to_string_lossy().into_owned(),
                    mount_point: disk.mount_point().to_string_lossy().into_owned(),
                    file_system: disk.file_system().to_string_lossy().into_owned(),
                    total_bytes: disk.total_space(),
                    available_bytes: disk.available_space(),
                })
                .collect()
        })
        .await
        .context("disk collection panicked")
    }
}
