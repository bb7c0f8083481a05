use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

use crate::{ContainerInfo, VmInfo};

use super::{ContainerCollector, VmCollector};

async fn query(program: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {}", program.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} exited with {}: {}",
            program.display(),
            args.join(" "),
            output.status,
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerPsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    state: String,
    status: String,
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line
pub fn parse_docker_ps(output: &str) -> anyhow::Result<Vec<ContainerInfo>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line: DockerPsLine =
                serde_json::from_str(line).with_context(|| format!("bad docker ps line: {line}"))?;
            Ok(ContainerInfo {
                id: line.id,
                name: line.names,
                image: line.image,
                state: line.state,
                status: line.status,
            })
        })
        .collect()
}

/// Parse the table printed by `virsh list --all`
pub fn parse_virsh_list(output: &str) -> Vec<VmInfo> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let id = columns.next()?;
            let name = columns.next()?;
            let state = columns.collect::<Vec<_>>().join(" ");

            Some(VmInfo {
                name: name.to_string(),
                id: id.parse().ok(),
                state,
            })
        })
        .collect()
}

pub struct DockerCollector {
    docker: PathBuf,
}

impl DockerCollector {
    pub fn new(docker: &Path) -> Self {
        Self {
            docker: docker.to_path_buf(),
        }
    }
}

#[async_trait]
impl ContainerCollector for DockerCollector {
    async fn containers(&self) -> anyhow::Result<Vec<ContainerInfo>> {
        let output = query(&self.docker, &["ps", "-a", "--format", "{{json .}}"]).await?;
        let containers = parse_docker_ps(&output)?;
        trace!("docker reported {} containers", containers.len());
        Ok(containers)
    }
}

pub struct VirshCollector {
    virsh: PathBuf,
}

impl VirshCollector {
    pub fn new(virsh: &Path) -> Self {
        Self {
            virsh: virsh.to_path_buf(),
        }
    }
}

#[async_trait]
impl VmCollector for VirshCollector {
    async fn vms(&self) -> anyhow::Result<Vec<VmInfo>> {
        let output = query(&self.virsh, &["list", "--all"]).await?;
        Ok(parse_virsh_list(&output))
    }
}
