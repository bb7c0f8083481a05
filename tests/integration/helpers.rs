//! Helper collectors, executors and agent setup for integration tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use host_agent::{
    ContainerInfo, CpuStats, DiskInfo, LoadAverage, MemoryStats, SystemStats, TemperatureReading,
    VmInfo,
    collectors::{ContainerCollector, Collectors, SystemCollector, VmCollector},
    config::Config,
    context::AgentContext,
    operations::{
        ExecutionContext, ExecutionError, Executor, ExecutorRegistry, Operation, OperationManager,
        OperationType, Parameters,
    },
};
use serde_json::{Value, json};

/// In-memory host whose readings tests can change between polls
pub struct FakeHost {
    pub stats: Mutex<SystemStats>,
    pub temperatures: Mutex<Vec<TemperatureReading>>,
    pub containers: Mutex<Vec<ContainerInfo>>,
    pub fail_system: AtomicBool,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            stats: Mutex::new(SystemStats {
                host_name: Some("test-host".to_string()),
                uptime_secs: 3600,
                cpu: CpuStats {
                    cores: 4,
                    arch: "x86_64".to_string(),
                    usage_percent: 20.0,
                },
                memory: MemoryStats {
                    total: 16_000,
                    used: 4_000,
                    ..Default::default()
                },
                load: LoadAverage {
                    one: 1.0,
                    five: 1.0,
                    fifteen: 1.0,
                },
                disk_io_percent: None,
            }),
            temperatures: Mutex::new(vec![]),
            containers: Mutex::new(vec![container("c1", "plex", "running")]),
            fail_system: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SystemCollector for FakeHost {
    async fn system_stats(&self) -> anyhow::Result<SystemStats> {
        if self.fail_system.load(Ordering::SeqCst) {
            anyhow::bail!("collector offline");
        }
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn temperatures(&self) -> anyhow::Result<Vec<TemperatureReading>> {
        Ok(self.temperatures.lock().unwrap().clone())
    }

    async fn disks(&self) -> anyhow::Result<Vec<DiskInfo>> {
        Ok(vec![DiskInfo {
            device: "/dev/sda1".to_string(),
            mount_point: "/mnt/disk1".to_string(),
            file_system: "xfs".to_string(),
            total_bytes: 1000,
            available_bytes: 600,
        }])
    }
}

#[async_trait]
impl ContainerCollector for FakeHost {
    async fn containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().unwrap().clone())
    }
}

#[async_trait]
impl VmCollector for FakeHost {
    async fn vms(&self) -> anyhow::Result<Vec<VmInfo>> {
        Ok(vec![VmInfo {
            name: "win11".to_string(),
            id: Some(1),
            state: "running".to_string(),
        }])
    }
}

pub fn container(id: &str, name: &str, state: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        image: "test/image".to_string(),
        state: state.to_string(),
        status: String::new(),
    }
}

pub fn collectors(host: &Arc<FakeHost>) -> Collectors {
    Collectors {
        system: host.clone(),
        containers: host.clone(),
        vms: host.clone(),
    }
}

/// Runs until cancelled, reporting progress once
pub struct HoldExecutor;

#[async_trait]
impl Executor for HoldExecutor {
    fn validate(&self, _: &Parameters) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        ctx.progress.report(10, "started");
        ctx.cancel.cancelled().await;
        Err(ExecutionError::Cancelled)
    }
}

/// Finishes after a short delay, echoing its parameters
pub struct QuickExecutor {
    pub required: Option<&'static str>,
}

#[async_trait]
impl Executor for QuickExecutor {
    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        match self.required {
            Some(key) if !parameters.contains_key(key) => Err(format!("missing parameter: {key}")),
            _ => Ok(()),
        }
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.checkpoint()?;
        ctx.progress.report(100, "done");
        Ok(json!({ "echo": ctx.parameters }))
    }
}

pub fn test_executors() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(OperationType::ParityCheck, HoldExecutor)
        .with(OperationType::ArrayStart, QuickExecutor { required: None })
        .with(OperationType::ArrayStop, QuickExecutor { required: None })
        .with(OperationType::DiskScan, HoldExecutor)
        .with(
            OperationType::BulkContainer,
            QuickExecutor {
                required: Some("action"),
            },
        )
        .with(OperationType::BulkVm, QuickExecutor { required: None })
        .with(OperationType::SystemReboot, HoldExecutor)
        .with(OperationType::SystemShutdown, HoldExecutor)
}

/// Defaults with fast intervals and a short shutdown grace period
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.operations.shutdown_grace_secs = 2;
    config.alerts.cooldown_secs = 0;
    config.monitoring.heartbeat_secs = 1;
    config
}

pub fn start_agent(config: Config, host: &Arc<FakeHost>) -> Arc<AgentContext> {
    Arc::new(AgentContext::start(config, collectors(host), test_executors()).unwrap())
}

/// Poll until the operation reaches a terminal state
pub async fn wait_terminal(manager: &OperationManager, id: &str) -> Operation {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let operation = manager.get_operation(id).unwrap();
            if operation.status.is_terminal() {
                return operation;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation did not finish in time")
}
