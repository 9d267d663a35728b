//! Health evaluation and per-container state transitions
//!
//! Pure functions: the monitor gathers inputs from the runtime gateway and
//! applies the result to its record map.

use crate::models::{
    parse_task_id, ContainerHealthStatus, ContainerInfo, ContainerStats, HealthState,
};
use chrono::{DateTime, Utc};

/// Memory usage above this percentage fails a check (the boundary itself passes)
pub const MAX_MEMORY_PERCENT: f64 = 95.0;

/// Process count at or above this fails a check
pub const MAX_PIDS: u64 = 10_000;

/// Result of a single health check before it is applied to a record
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Healthy,
    /// Counts against the failing streak
    Failed(String),
    /// Created but not started; does not count against the streak
    NotStarted,
    /// Exited; unhealthy regardless of streak
    Exited { exit_code: Option<i64> },
}

impl CheckOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CheckOutcome::Healthy)
    }

    /// Human-readable reason for a non-healthy outcome
    pub fn message(&self) -> Option<String> {
        match self {
            CheckOutcome::Healthy => None,
            CheckOutcome::Failed(reason) => Some(reason.clone()),
            CheckOutcome::NotStarted => Some("container has not started yet".to_string()),
            CheckOutcome::Exited {
                exit_code: Some(code),
            } => Some(format!("container exited with code {}", code)),
            CheckOutcome::Exited { exit_code: None } => Some("container exited".to_string()),
        }
    }
}

/// Judge live statistics of a running container
pub fn evaluate_stats(stats: &ContainerStats) -> CheckOutcome {
    if stats.memory_percent > MAX_MEMORY_PERCENT {
        return CheckOutcome::Failed(format!(
            "memory usage {:.2}% exceeds {:.0}%",
            stats.memory_percent, MAX_MEMORY_PERCENT
        ));
    }
    if stats.pids >= MAX_PIDS {
        return CheckOutcome::Failed(format!(
            "process count {} reaches limit {}",
            stats.pids, MAX_PIDS
        ));
    }
    CheckOutcome::Healthy
}

/// Outcome decided by lifecycle status alone; `None` means stats are needed
pub fn lifecycle_outcome(info: &ContainerInfo) -> Option<CheckOutcome> {
    if info.is_running() {
        None
    } else if info.is_created() {
        Some(CheckOutcome::NotStarted)
    } else if info.is_exited() {
        Some(CheckOutcome::Exited {
            exit_code: info.exit_code,
        })
    } else {
        Some(CheckOutcome::Failed(format!("container is {}", info.status)))
    }
}

/// Apply a check outcome to the previous record
pub fn next_record(
    previous: Option<&ContainerHealthStatus>,
    container_id: &str,
    container_name: &str,
    outcome: &CheckOutcome,
    max_failures: u32,
    checked_at: DateTime<Utc>,
) -> ContainerHealthStatus {
    let prior_streak = previous.map(|p| p.failing_streak).unwrap_or(0);

    let (status, failing_streak, exit_code) = match outcome {
        CheckOutcome::Healthy => (HealthState::Healthy, 0, None),
        CheckOutcome::NotStarted => (HealthState::Starting, prior_streak, None),
        CheckOutcome::Exited { exit_code } => (
            HealthState::Unhealthy,
            prior_streak.saturating_add(1),
            *exit_code,
        ),
        CheckOutcome::Failed(_) => {
            let streak = prior_streak.saturating_add(1);
            let status = if streak >= max_failures {
                HealthState::Unhealthy
            } else {
                HealthState::Starting
            };
            (status, streak, None)
        }
    };

    let container_name = container_name.trim_start_matches('/').to_string();
    ContainerHealthStatus {
        container_id: container_id.to_string(),
        task_id: parse_task_id(&container_name),
        container_name,
        status,
        failing_streak,
        previous_status: previous.map(|p| p.status),
        error: outcome.message(),
        last_check_exit_code: exit_code,
        last_checked_at: checked_at,
    }
}
