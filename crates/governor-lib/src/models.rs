//! Core data models for the governance layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Point-in-time usage snapshot reported by the usage provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityUsage {
    pub current_tokens: u64,
    pub current_cost: f64,
    pub active_tasks: u32,
    pub max_tokens_per_task: u64,
    pub max_cost_per_task: f64,
    pub max_concurrent_tasks: u32,
    pub daily_budget: f64,
    pub daily_spent: f64,
}

/// Time-of-day policy regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Day,
    Night,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Day => write!(f, "day"),
            Mode::Night => write!(f, "night"),
        }
    }
}

/// Active mode and the upcoming schedule points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeInfo {
    pub mode: Mode,
    /// Hours of day during which this mode is nominally active (informational)
    pub mode_hours: BTreeSet<u32>,
    pub next_mode_switch: DateTime<Utc>,
    pub next_midnight: DateTime<Utc>,
}

/// Absolute usage levels above which the system is considered saturated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityThresholds {
    pub tokens_threshold: u64,
    pub cost_threshold: f64,
    pub budget_threshold: f64,
    pub concurrent_threshold: u32,
}

/// Why capacity was considered restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreReason {
    ModeSwitch,
    BudgetReset,
    CapacityDropped,
}

impl RestoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreReason::ModeSwitch => "mode_switch",
            RestoreReason::BudgetReset => "budget_reset",
            RestoreReason::CapacityDropped => "capacity_dropped",
        }
    }
}

impl std::fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the `capacity:restored` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRestoredEvent {
    pub reason: RestoreReason,
    pub timestamp: DateTime<Utc>,
    /// Absent only when no snapshot had been taken before the event fired
    pub previous_usage: Option<CapacityUsage>,
    pub current_usage: CapacityUsage,
    pub mode_info: Option<ModeInfo>,
}

/// Container metadata as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runtime lifecycle status (`created`, `running`, `exited`, ...)
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub exit_code: Option<i64>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    pub fn is_created(&self) -> bool {
        self.status.eq_ignore_ascii_case("created")
    }

    pub fn is_exited(&self) -> bool {
        self.status.eq_ignore_ascii_case("exited")
    }
}

/// Live resource statistics for one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Health verdict for a monitored container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Starting,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Starting => write!(f, "starting"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health record owned by the container health monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHealthStatus {
    pub container_id: String,
    pub container_name: String,
    pub task_id: Option<String>,
    pub status: HealthState,
    pub failing_streak: u32,
    pub previous_status: Option<HealthState>,
    pub error: Option<String>,
    pub last_check_exit_code: Option<i64>,
    pub last_checked_at: DateTime<Utc>,
}

/// Aggregate view over all health records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMonitorStats {
    pub is_monitoring: bool,
    pub total_containers: usize,
    pub healthy_containers: usize,
    pub unhealthy_containers: usize,
    pub starting_containers: usize,
    pub average_failing_streak: f64,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Extract the task id from a container name of the form `<prefix>-task-<id>`
pub fn parse_task_id(container_name: &str) -> Option<String> {
    let name = container_name.trim_start_matches('/');
    let (prefix, id) = name.split_once("-task-")?;
    if prefix.is_empty() || id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_id() {
        assert_eq!(
            parse_task_id("autonomous-task-42"),
            Some("42".to_string())
        );
        assert_eq!(
            parse_task_id("/autonomous-task-abc-def"),
            Some("abc-def".to_string())
        );
        assert_eq!(parse_task_id("autonomous-worker"), None);
        assert_eq!(parse_task_id("-task-1"), None);
        assert_eq!(parse_task_id("autonomous-task-"), None);
    }

    #[test]
    fn test_container_status_helpers() {
        let mut info = ContainerInfo {
            id: "abc".to_string(),
            name: "autonomous-task-1".to_string(),
            image: "worker:latest".to_string(),
            status: "Running".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            started_at: None,
            exit_code: None,
        };
        assert!(info.is_running());

        info.status = "exited".to_string();
        assert!(info.is_exited());
        assert!(!info.is_running());
    }

    #[test]
    fn test_restore_reason_serialization() {
        let json = serde_json::to_string(&RestoreReason::CapacityDropped).unwrap();
        assert_eq!(json, "\"capacity_dropped\"");
        assert_eq!(RestoreReason::ModeSwitch.to_string(), "mode_switch");
    }
}
