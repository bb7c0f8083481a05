//! Command-backed executors for every operation type
//!
//! Each executor shells out to the host tool that owns the resource (`mdcmd`,
//! `smartctl`, `docker`, `virsh`, `shutdown`). Child processes are spawned with
//! `kill_on_drop`, so cancelling or abandoning an execution also kills the
//! command it is waiting on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operations::{
    ExecutionContext, ExecutionError, Executor, ExecutorRegistry, OperationType, Parameters,
};

/// Container, VM and block device names passed to host tools
///
/// Must not start with `-` so a name can never be read as a flag.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mdcmd: PathBuf,
    pub docker: PathBuf,
    pub virsh: PathBuf,
    pub smartctl: PathBuf,
    pub shutdown: PathBuf,

    /// Array status file polled for parity progress
    pub mdstat: PathBuf,

    pub progress_poll_ms: u64,

    /// Grace period before a reboot or shutdown is issued; cancellable
    pub power_delay_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mdcmd: PathBuf::from("/usr/local/sbin/mdcmd"),
            docker: PathBuf::from("docker"),
            virsh: PathBuf::from("virsh"),
            smartctl: PathBuf::from("smartctl"),
            shutdown: PathBuf::from("shutdown"),
            mdstat: PathBuf::from("/proc/mdstat"),
            progress_poll_ms: 5000,
            power_delay_secs: 30,
        }
    }
}

/// Registry with a command-backed executor for every operation type
pub fn default_executors(config: &ExecutorConfig) -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(OperationType::ParityCheck, ParityCheckExecutor::new(config))
        .with(
            OperationType::ArrayStart,
            ArrayExecutor::new(&config.mdcmd, ArrayAction::Start),
        )
        .with(
            OperationType::ArrayStop,
            ArrayExecutor::new(&config.mdcmd, ArrayAction::Stop),
        )
        .with(OperationType::DiskScan, DiskScanExecutor::new(&config.smartctl))
        .with(
            OperationType::BulkContainer,
            BulkExecutor::containers(&config.docker),
        )
        .with(OperationType::BulkVm, BulkExecutor::vms(&config.virsh))
        .with(
            OperationType::SystemReboot,
            PowerExecutor::new(config, PowerAction::Reboot),
        )
        .with(
            OperationType::SystemShutdown,
            PowerExecutor::new(config, PowerAction::Shutdown),
        )
}

/// Run a command to completion, or kill it when `cancel` fires
async fn run_command(
    program: &Path,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<String, ExecutionError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running {} {}", program.display(), args.join(" "));

    let output = tokio::select! {
        output = command.output() => {
            output.with_context(|| format!("failed to run {}", program.display()))?
        }
        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{} {} exited with {}: {}",
            program.display(),
            args.join(" "),
            output.status,
            stderr.trim()
        )
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn optional_str<'a>(parameters: &'a Parameters, key: &str) -> Result<Option<&'a str>, String> {
    match parameters.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(format!("'{key}' must be a string")),
    }
}

fn name_list(parameters: &Parameters, key: &str) -> Result<Vec<String>, String> {
    let values = parameters
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("'{key}' must be a non-empty list of names"))?;

    if values.is_empty() {
        return Err(format!("'{key}' must be a non-empty list of names"));
    }

    values
        .iter()
        .map(|value| match value.as_str() {
            Some(name) if is_valid_name(name) => Ok(name.to_string()),
            Some(name) => Err(format!("invalid name in '{key}': {name:?}")),
            None => Err(format!("'{key}' must only contain strings")),
        })
        .collect()
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

/// Resync state read from the array status file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncStatus {
    pub position: u64,
    pub size: u64,
}

impl ResyncStatus {
    pub fn is_running(&self) -> bool {
        self.position > 0
    }

    pub fn percent(&self) -> u8 {
        if self.size == 0 {
            return 0;
        }
        ((self.position.saturating_mul(100)) / self.size).min(100) as u8
    }
}

/// Extract `mdResyncPos`/`mdResyncSize` from an mdstat dump
pub fn parse_mdstat(content: &str) -> Option<ResyncStatus> {
    let mut position = None;
    let mut size = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "mdResyncPos" => position = value.trim().parse().ok(),
            "mdResyncSize" => size = value.trim().parse().ok(),
            _ => {}
        }
    }

    Some(ResyncStatus {
        position: position?,
        size: size.unwrap_or(0),
    })
}

pub struct ParityCheckExecutor {
    mdcmd: PathBuf,
    mdstat: PathBuf,
    poll: Duration,
}

impl ParityCheckExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            mdcmd: config.mdcmd.clone(),
            mdstat: config.mdstat.clone(),
            poll: Duration::from_millis(config.progress_poll_ms),
        }
    }

    async fn abort_check(&self) {
        // the operation is already cancelled, so this must not observe the same token
        if let Err(err) = run_command(&self.mdcmd, &["nocheck"], &CancellationToken::new()).await {
            warn!("failed to stop parity check: {err}");
        }
    }
}

#[async_trait]
impl Executor for ParityCheckExecutor {
    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        match optional_str(parameters, "type")? {
            None | Some("check") | Some("correct") => Ok(()),
            Some(other) => Err(format!(
                "invalid parity check type {other:?}, expected \"check\" or \"correct\""
            )),
        }
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let correct = optional_str(&ctx.parameters, "type")
            .map_err(|err| anyhow!(err))?
            .is_some_and(|mode| mode == "correct");
        let mode = if correct { "CORRECT" } else { "NOCORRECT" };

        match run_command(&self.mdcmd, &["check", mode], &ctx.cancel).await {
            Ok(_) => {}
            Err(ExecutionError::Cancelled) => {
                // the check may already be running on the array
                self.abort_check().await;
                return Err(ExecutionError::Cancelled);
            }
            Err(err) => return Err(err),
        }
        ctx.progress.report(0, format!("parity check started ({mode})"));
        info!("parity check started ({mode})");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = ctx.cancel.cancelled() => {
                    self.abort_check().await;
                    return Err(ExecutionError::Cancelled);
                }
            }

            let content = tokio::fs::read_to_string(&self.mdstat)
                .await
                .with_context(|| format!("failed to read {}", self.mdstat.display()))?;

            let status = parse_mdstat(&content)
                .ok_or_else(|| anyhow!("no resync position in {}", self.mdstat.display()))?;

            if !status.is_running() {
                return Ok(json!({ "mode": mode.to_lowercase(), "finished": true }));
            }

            ctx.progress
                .report(status.percent(), format!("checked {} of {}", status.position, status.size));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ArrayAction {
    Start,
    Stop,
}

impl ArrayAction {
    fn as_str(&self) -> &'static str {
        match self {
            ArrayAction::Start => "start",
            ArrayAction::Stop => "stop",
        }
    }
}

pub struct ArrayExecutor {
    mdcmd: PathBuf,
    action: ArrayAction,
}

impl ArrayExecutor {
    pub fn new(mdcmd: &Path, action: ArrayAction) -> Self {
        Self {
            mdcmd: mdcmd.to_path_buf(),
            action,
        }
    }
}

#[async_trait]
impl Executor for ArrayExecutor {
    fn validate(&self, _: &Parameters) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let action = self.action.as_str();
        ctx.progress.message(format!("array {action} requested"));
        let output = run_command(&self.mdcmd, &[action], &ctx.cancel).await?;

        Ok(json!({ "action": action, "output": output.trim() }))
    }
}

pub struct DiskScanExecutor {
    smartctl: PathBuf,
}

impl DiskScanExecutor {
    pub fn new(smartctl: &Path) -> Self {
        Self {
            smartctl: smartctl.to_path_buf(),
        }
    }
}

fn device_path(device: &str) -> String {
    if device.starts_with("/dev/") {
        device.to_string()
    } else {
        format!("/dev/{device}")
    }
}

#[async_trait]
impl Executor for DiskScanExecutor {
    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        let devices = parameters
            .get("devices")
            .and_then(Value::as_array)
            .filter(|devices| !devices.is_empty())
            .ok_or("'devices' must be a non-empty list of device names")?;

        for device in devices {
            let name = device
                .as_str()
                .map(|d| d.strip_prefix("/dev/").unwrap_or(d))
                .ok_or("'devices' must only contain strings")?;
            if !is_valid_name(name) {
                return Err(format!("invalid device name {name:?}"));
            }
        }

        Ok(())
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let devices: Vec<String> = ctx
            .parameters
            .get("devices")
            .and_then(Value::as_array)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(Value::as_str)
                    .map(device_path)
                    .collect()
            })
            .unwrap_or_default();

        let mut results = Vec::with_capacity(devices.len());
        let mut failures = 0;

        for (index, device) in devices.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress
                .report(percent(index, devices.len()), format!("scanning {device}"));

            match run_command(&self.smartctl, &["-H", device], &ctx.cancel).await {
                Ok(output) => {
                    let healthy = output.contains("PASSED") || output.contains(": OK");
                    results.push(json!({ "device": device, "healthy": healthy }));
                }
                Err(ExecutionError::Cancelled) => return Err(ExecutionError::Cancelled),
                Err(err) => {
                    warn!("SMART scan of {device} failed: {err}");
                    failures += 1;
                    results.push(json!({ "device": device, "error": err.to_string() }));
                }
            }
        }

        if failures == devices.len() {
            return Err(anyhow!("SMART scan failed for every device").into());
        }

        Ok(json!({ "devices": results }))
    }
}

/// Applies one action to many named resources, one command per resource
pub struct BulkExecutor {
    program: PathBuf,
    list_key: &'static str,
    actions: &'static [(&'static str, &'static str)],
}

const CONTAINER_ACTIONS: &[(&str, &str)] = &[
    ("start", "start"),
    ("stop", "stop"),
    ("restart", "restart"),
    ("pause", "pause"),
    ("unpause", "unpause"),
];

const VM_ACTIONS: &[(&str, &str)] = &[
    ("start", "start"),
    ("stop", "shutdown"),
    ("force-stop", "destroy"),
    ("restart", "reboot"),
    ("pause", "suspend"),
    ("resume", "resume"),
];

impl BulkExecutor {
    pub fn containers(docker: &Path) -> Self {
        Self {
            program: docker.to_path_buf(),
            list_key: "containers",
            actions: CONTAINER_ACTIONS,
        }
    }

    pub fn vms(virsh: &Path) -> Self {
        Self {
            program: virsh.to_path_buf(),
            list_key: "vms",
            actions: VM_ACTIONS,
        }
    }

    fn command_for(&self, action: &str) -> Option<&'static str> {
        self.actions
            .iter()
            .find(|(name, _)| *name == action)
            .map(|(_, command)| *command)
    }
}

#[async_trait]
impl Executor for BulkExecutor {
    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        let action = optional_str(parameters, "action")?.ok_or("'action' is required")?;
        if self.command_for(action).is_none() {
            let known: Vec<_> = self.actions.iter().map(|(name, _)| *name).collect();
            return Err(format!(
                "unsupported action {action:?}, expected one of {}",
                known.join(", ")
            ));
        }
        name_list(parameters, self.list_key).map(|_| ())
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let action = optional_str(&ctx.parameters, "action")
            .map_err(|err| anyhow!(err))?
            .unwrap_or_default()
            .to_string();
        let command = self
            .command_for(&action)
            .ok_or_else(|| anyhow!("unsupported action {action:?}"))?;
        let names = name_list(&ctx.parameters, self.list_key).map_err(|err| anyhow!(err))?;

        let mut results = Vec::with_capacity(names.len());
        let mut succeeded = 0;

        for (index, name) in names.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress
                .report(percent(index, names.len()), format!("{action} {name}"));

            match run_command(&self.program, &[command, name], &ctx.cancel).await {
                Ok(_) => {
                    succeeded += 1;
                    results.push(json!({ "name": name, "success": true }));
                }
                Err(ExecutionError::Cancelled) => return Err(ExecutionError::Cancelled),
                Err(err) => {
                    warn!("{action} {name} failed: {err}");
                    results.push(json!({ "name": name, "success": false, "error": err.to_string() }));
                }
            }
        }

        if succeeded == 0 {
            return Err(anyhow!("{action} failed for all {} targets", names.len()).into());
        }

        Ok(json!({
            "action": action,
            "succeeded": succeeded,
            "failed": names.len() - succeeded,
            "results": results,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PowerAction {
    Reboot,
    Shutdown,
}

pub struct PowerExecutor {
    shutdown: PathBuf,
    delay: Duration,
    action: PowerAction,
}

impl PowerExecutor {
    pub fn new(config: &ExecutorConfig, action: PowerAction) -> Self {
        Self {
            shutdown: config.shutdown.clone(),
            delay: Duration::from_secs(config.power_delay_secs),
            action,
        }
    }
}

#[async_trait]
impl Executor for PowerExecutor {
    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        match parameters.get("delay_secs") {
            None | Some(Value::Null) => Ok(()),
            Some(value) if value.is_u64() => Ok(()),
            Some(_) => Err("'delay_secs' must be a non-negative integer".to_string()),
        }
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        let delay = ctx
            .parameters
            .get("delay_secs")
            .and_then(Value::as_u64)
            .map_or(self.delay, Duration::from_secs);

        let (flag, verb) = match self.action {
            PowerAction::Reboot => ("-r", "reboot"),
            PowerAction::Shutdown => ("-h", "shutdown"),
        };

        ctx.progress
            .message(format!("{verb} in {}s", delay.as_secs()));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
        }

        warn!("issuing system {verb}");
        let output = run_command(&self.shutdown, &[flag, "now"], &ctx.cancel).await?;

        Ok(json!({ "action": verb, "output": output.trim() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::ProgressReporter;
    use assert_matches::assert_matches;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("parameters must be an object"),
        }
    }

    fn context(parameters: Parameters) -> ExecutionContext {
        ExecutionContext::new(
            "test",
            parameters,
            CancellationToken::new(),
            ProgressReporter::noop("test"),
        )
    }

    #[test]
    fn test_parse_mdstat() {
        let content = "sbName=/boot/config/super.dat\nmdResyncPos=250\nmdResyncSize=1000\n";
        let status = parse_mdstat(content).unwrap();
        assert!(status.is_running());
        assert_eq!(status.percent(), 25);

        let idle = parse_mdstat("mdResyncPos=0\nmdResyncSize=1000").unwrap();
        assert!(!idle.is_running());

        assert_eq!(parse_mdstat("mdState=STARTED"), None);
    }

    #[test]
    fn test_parity_validation() {
        let executor = ParityCheckExecutor::new(&ExecutorConfig::default());
        assert!(executor.validate(&params(json!({"type": "check"}))).is_ok());
        assert!(executor.validate(&params(json!({"type": "correct"}))).is_ok());
        assert!(executor.validate(&Parameters::new()).is_ok());
        assert!(executor.validate(&params(json!({"type": "repair"}))).is_err());
        assert!(executor.validate(&params(json!({"type": 1}))).is_err());
    }

    #[test]
    fn test_bulk_validation() {
        let docker = BulkExecutor::containers(Path::new("docker"));
        assert!(docker
            .validate(&params(json!({"action": "pause", "containers": ["plex", "db_1"]})))
            .is_ok());
        assert!(docker
            .validate(&params(json!({"action": "explode", "containers": ["plex"]})))
            .is_err());
        assert!(docker
            .validate(&params(json!({"action": "stop", "containers": []})))
            .is_err());
        assert!(docker
            .validate(&params(json!({"action": "stop", "containers": ["--rm"]})))
            .is_err());

        let virsh = BulkExecutor::vms(Path::new("virsh"));
        assert!(virsh
            .validate(&params(json!({"action": "force-stop", "vms": ["win10"]})))
            .is_ok());
        assert!(virsh
            .validate(&params(json!({"action": "force-stop", "containers": ["win10"]})))
            .is_err());
    }

    #[test]
    fn test_disk_scan_validation() {
        let executor = DiskScanExecutor::new(Path::new("smartctl"));
        assert!(executor
            .validate(&params(json!({"devices": ["sda", "/dev/nvme0n1"]})))
            .is_ok());
        assert!(executor.validate(&params(json!({"devices": []}))).is_err());
        assert!(executor
            .validate(&params(json!({"devices": ["sda; rm -rf /"]})))
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bulk_runs_command_per_target() {
        let executor = BulkExecutor::containers(Path::new("echo"));
        let result = executor
            .execute(context(params(
                json!({"action": "pause", "containers": ["plex", "sonarr"]}),
            )))
            .await
            .unwrap();

        assert_eq!(result["succeeded"], 2);
        assert_eq!(result["failed"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bulk_fails_when_every_target_fails() {
        let executor = BulkExecutor::vms(Path::new("false"));
        let result = executor
            .execute(context(params(json!({"action": "start", "vms": ["win10"]}))))
            .await;

        assert_matches!(result, Err(ExecutionError::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { run_command(Path::new("sleep"), &["30"], &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(result, Err(ExecutionError::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_power_delay_is_cancellable() {
        let config = ExecutorConfig {
            shutdown: PathBuf::from("echo"),
            power_delay_secs: 3600,
            ..Default::default()
        };
        let executor = PowerExecutor::new(&config, PowerAction::Reboot);
        let ctx = context(Parameters::new());
        ctx.cancel.cancel();

        assert_matches!(executor.execute(ctx).await, Err(ExecutionError::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_power_issues_command_after_delay() {
        let config = ExecutorConfig {
            shutdown: PathBuf::from("echo"),
            power_delay_secs: 0,
            ..Default::default()
        };
        let executor = PowerExecutor::new(&config, PowerAction::Shutdown);

        let result = executor.execute(context(Parameters::new())).await.unwrap();
        assert_eq!(result["output"], "-h now");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parity_check_finishes_when_resync_idle() {
        let mdstat = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(mdstat.path(), "mdResyncPos=0\nmdResyncSize=1000\n").unwrap();

        let config = ExecutorConfig {
            mdcmd: PathBuf::from("true"),
            mdstat: mdstat.path().to_path_buf(),
            progress_poll_ms: 10,
            ..Default::default()
        };
        let executor = ParityCheckExecutor::new(&config);

        let result = executor
            .execute(context(params(json!({"type": "correct"}))))
            .await
            .unwrap();
        assert_eq!(result["mode"], "correct");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parity_cancel_during_start_stops_check() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mdcmd = dir.path().join("mdcmd");
        std::fs::write(
            &mdcmd,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\n[ \"$1\" = check ] && sleep 30\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&mdcmd, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = ExecutorConfig {
            mdcmd,
            progress_poll_ms: 10,
            ..Default::default()
        };
        let executor = ParityCheckExecutor::new(&config);
        let ctx = context(Parameters::new());
        let cancel = ctx.cancel.clone();

        let handle = tokio::spawn(async move { executor.execute(ctx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(result, Err(ExecutionError::Cancelled));

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.lines().any(|line| line == "nocheck"), "calls: {calls}");
    }
}
