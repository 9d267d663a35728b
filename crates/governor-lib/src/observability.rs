//! Observability infrastructure for the governor
//!
//! Provides:
//! - Prometheus metrics (restoration events, health check outcomes and latency,
//!   monitored container counts, provider errors)
//! - Structured JSON logging with tracing

use crate::models::{CapacityRestoredEvent, ContainerHealthStatus, HealthState};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for health check latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<GovernorMetricsInner> = OnceLock::new();

struct GovernorMetricsInner {
    capacity_restored: IntCounterVec,
    health_checks: IntCounterVec,
    health_check_latency_seconds: Histogram,
    containers_monitored: IntGauge,
    containers_unhealthy: IntGauge,
    provider_errors: IntCounter,
}

impl GovernorMetricsInner {
    fn new() -> Self {
        Self {
            capacity_restored: register_int_counter_vec!(
                "governor_capacity_restored_total",
                "Capacity restoration events by reason",
                &["reason"]
            )
            .expect("Failed to register capacity_restored"),

            health_checks: register_int_counter_vec!(
                "governor_health_checks_total",
                "Container health checks by outcome",
                &["outcome"]
            )
            .expect("Failed to register health_checks"),

            health_check_latency_seconds: register_histogram!(
                "governor_health_check_latency_seconds",
                "Time spent checking a single container",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register health_check_latency_seconds"),

            containers_monitored: register_int_gauge!(
                "governor_containers_monitored",
                "Number of containers with a health record"
            )
            .expect("Failed to register containers_monitored"),

            containers_unhealthy: register_int_gauge!(
                "governor_containers_unhealthy",
                "Number of containers currently unhealthy"
            )
            .expect("Failed to register containers_unhealthy"),

            provider_errors: register_int_counter!(
                "governor_provider_errors_total",
                "Failures reading the usage provider"
            )
            .expect("Failed to register provider_errors"),
        }
    }
}

/// Governor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct GovernorMetrics {
    _private: (),
}

impl Default for GovernorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GovernorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GovernorMetricsInner {
        GLOBAL_METRICS.get_or_init(GovernorMetricsInner::new)
    }

    pub fn inc_capacity_restored(&self, reason: &str) {
        self.inner()
            .capacity_restored
            .with_label_values(&[reason])
            .inc();
    }

    /// Record the outcome of one container check
    pub fn observe_health_check(&self, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.inner().health_checks.with_label_values(&[outcome]).inc();
        self.inner()
            .health_check_latency_seconds
            .observe(duration_secs);
    }

    pub fn set_container_counts(&self, monitored: i64, unhealthy: i64) {
        self.inner().containers_monitored.set(monitored);
        self.inner().containers_unhealthy.set(unhealthy);
    }

    pub fn inc_provider_errors(&self) {
        self.inner().provider_errors.inc();
    }
}

/// Structured logger for governor events
///
/// Provides consistent JSON-formatted records for capacity restorations,
/// health transitions, and daemon lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a capacity restoration
    pub fn log_capacity_restored(&self, event: &CapacityRestoredEvent) {
        let usage = &event.current_usage;
        info!(
            event = "capacity_restored",
            instance = %self.instance,
            reason = %event.reason,
            mode = ?event.mode_info.as_ref().map(|m| m.mode),
            active_tasks = usage.active_tasks,
            max_concurrent_tasks = usage.max_concurrent_tasks,
            current_tokens = usage.current_tokens,
            current_cost = usage.current_cost,
            daily_spent = usage.daily_spent,
            daily_budget = usage.daily_budget,
            "Capacity restored"
        );
    }

    /// Log a container health transition
    pub fn log_health_transition(&self, record: &ContainerHealthStatus) {
        let previous = record
            .previous_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());

        match record.status {
            HealthState::Unhealthy => {
                warn!(
                    event = "container_health_changed",
                    instance = %self.instance,
                    container_id = %record.container_id,
                    container_name = %record.container_name,
                    task_id = ?record.task_id,
                    previous = %previous,
                    status = %record.status,
                    failing_streak = record.failing_streak,
                    exit_code = ?record.last_check_exit_code,
                    error = ?record.error,
                    "Container became unhealthy"
                );
            }
            _ => {
                info!(
                    event = "container_health_changed",
                    instance = %self.instance,
                    container_id = %record.container_id,
                    container_name = %record.container_name,
                    task_id = ?record.task_id,
                    previous = %previous,
                    status = %record.status,
                    failing_streak = record.failing_streak,
                    "Container health changed"
                );
            }
        }
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "daemon_started",
            instance = %self.instance,
            version = %version,
            "Task governor started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Task governor shutting down"
        );
    }
}
