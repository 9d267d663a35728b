//! Container health monitoring
//!
//! This module provides the [`ContainerRuntimeGateway`] abstraction over the
//! installed container engine, a CLI-backed implementation for Docker and
//! Podman, and the polling [`ContainerHealthMonitor`].

mod cli;
mod evaluation;
mod monitor;
mod parse;


pub use cli::CliRuntimeGateway;
pub use evaluation::{
    evaluate_stats, lifecycle_outcome, next_record, CheckOutcome, MAX_MEMORY_PERCENT, MAX_PIDS,
};
pub use monitor::{ContainerHealthMonitor, HealthMonitorOptions, HealthMonitorOptionsUpdate};
pub use parse::{parse_inspect, parse_percent, parse_ps, parse_size, parse_size_pair, parse_stats};

use crate::models::{ContainerInfo, ContainerStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Container engines the gateway can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// CLI executable name
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// Access to container metadata and live statistics
#[async_trait]
pub trait ContainerRuntimeGateway: Send + Sync {
    /// Best available runtime, or `None` when no engine is usable
    async fn detect_runtime(&self) -> Option<RuntimeKind>;

    /// Metadata for one container; `Ok(None)` when it does not exist
    async fn get_container_info(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    /// All containers, or only those whose name starts with `name_prefix`
    async fn list_containers(&self, name_prefix: Option<&str>) -> Result<Vec<ContainerInfo>>;

    /// Live statistics; `Ok(None)` when the runtime has none to report
    async fn get_stats(
        &self,
        container_id: &str,
        runtime: RuntimeKind,
    ) -> Result<Option<ContainerStats>>;
}
