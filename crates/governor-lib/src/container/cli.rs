//! Runtime gateway backed by the `docker` or `podman` CLI

use super::parse::{parse_inspect, parse_ps, parse_stats};
use super::{ContainerRuntimeGateway, RuntimeKind};
use crate::error::GovernorError;
use crate::models::{ContainerInfo, ContainerStats};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Detection order when no runtime is pinned
const CANDIDATES: [RuntimeKind; 2] = [RuntimeKind::Docker, RuntimeKind::Podman];

/// Gateway that shells out to the installed container engine
#[derive(Debug, Default)]
pub struct CliRuntimeGateway {
    pinned: Option<RuntimeKind>,
    detected: OnceCell<Option<RuntimeKind>>,
}

impl CliRuntimeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only ever use the given runtime
    pub fn with_runtime(runtime: RuntimeKind) -> Self {
        Self {
            pinned: Some(runtime),
            detected: OnceCell::new(),
        }
    }

    async fn probe(runtime: RuntimeKind) -> bool {
        let template = match runtime {
            RuntimeKind::Docker => "{{.Server.Version}}",
            RuntimeKind::Podman => "{{.Client.Version}}",
        };
        match Command::new(runtime.binary())
            .args(["version", "--format", template])
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!(runtime = %runtime, version = %version.trim(), "Detected container runtime");
                true
            }
            Ok(output) => {
                debug!(
                    runtime = %runtime,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Container runtime not usable"
                );
                false
            }
            Err(e) => {
                debug!(runtime = %runtime, error = %e, "Container runtime not installed");
                false
            }
        }
    }

    async fn runtime(&self) -> Result<RuntimeKind> {
        self.detect_runtime()
            .await
            .ok_or_else(|| GovernorError::RuntimeUnavailable.into())
    }

    async fn run(&self, runtime: RuntimeKind, args: &[&str]) -> Result<Output> {
        Command::new(runtime.binary())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", runtime, args.join(" ")))
    }
}

fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

fn command_failed(runtime: RuntimeKind, args: &[&str], output: &Output) -> anyhow::Error {
    GovernorError::CommandFailed {
        command: format!("{} {}", runtime, args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
    .into()
}

#[async_trait]
impl ContainerRuntimeGateway for CliRuntimeGateway {
    async fn detect_runtime(&self) -> Option<RuntimeKind> {
        let pinned = self.pinned;
        *self
            .detected
            .get_or_init(|| async move {
                let candidates: Vec<RuntimeKind> = match pinned {
                    Some(runtime) => vec![runtime],
                    None => CANDIDATES.to_vec(),
                };
                for runtime in candidates {
                    if Self::probe(runtime).await {
                        return Some(runtime);
                    }
                }
                warn!("No container runtime available");
                None
            })
            .await
    }

    async fn get_container_info(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let runtime = self.runtime().await?;
        let args = [
            "inspect",
            "--type",
            "container",
            "--format",
            "{{json .}}",
            container_id,
        ];
        let output = self.run(runtime, &args).await?;

        if !output.status.success() {
            if is_missing(&output) {
                return Ok(None);
            }
            return Err(command_failed(runtime, &args, &output));
        }

        Ok(parse_inspect(&String::from_utf8_lossy(&output.stdout))?)
    }

    async fn list_containers(&self, name_prefix: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let runtime = self.runtime().await?;
        let args = ["ps", "-a", "--no-trunc", "--format", "{{json .}}"];
        let output = self.run(runtime, &args).await?;

        if !output.status.success() {
            return Err(command_failed(runtime, &args, &output));
        }

        let containers = parse_ps(&String::from_utf8_lossy(&output.stdout))?;
        Ok(match name_prefix {
            Some(prefix) => containers
                .into_iter()
                .filter(|c| c.name.starts_with(prefix))
                .collect(),
            None => containers,
        })
    }

    async fn get_stats(
        &self,
        container_id: &str,
        runtime: RuntimeKind,
    ) -> Result<Option<ContainerStats>> {
        let format = match runtime {
            RuntimeKind::Docker => "{{json .}}",
            RuntimeKind::Podman => "json",
        };
        let args = [
            "stats",
            "--no-stream",
            "--no-trunc",
            "--format",
            format,
            container_id,
        ];
        let output = self.run(runtime, &args).await?;

        if !output.status.success() {
            if is_missing(&output) {
                return Ok(None);
            }
            return Err(command_failed(runtime, &args, &output));
        }

        Ok(parse_stats(&String::from_utf8_lossy(&output.stdout))?)
    }
}
