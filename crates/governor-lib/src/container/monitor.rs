//! Container health monitor
//!
//! Polls the runtime gateway on a fixed interval, keeps one
//! [`ContainerHealthStatus`] per container and reports transitions and
//! per-check outcomes through an [`EventBus`].

use super::evaluation::{evaluate_stats, lifecycle_outcome, next_record, CheckOutcome};
use super::{ContainerRuntimeGateway, RuntimeKind};
use crate::error::{GovernorError, Result};
use crate::events::{EventBus, HealthEvent};
use crate::models::{ContainerHealthStatus, ContainerInfo, HealthMonitorStats, HealthState};
use crate::observability::GovernorMetrics;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest polling period accepted; smaller values are raised to this
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorOptions {
    /// Polling period (default: 30 seconds)
    pub interval: Duration,
    /// Consecutive failures before a container is unhealthy (default: 3)
    pub max_failures: u32,
    /// Per-check budget; exceeding it is logged, not enforced (default: 10 seconds)
    pub timeout: Duration,
    /// Check every container instead of only prefixed ones
    pub monitor_all: bool,
    /// Name prefix of this system's own containers
    pub container_prefix: String,
    /// Start polling as soon as the daemon starts
    pub auto_start: bool,
}

impl Default for HealthMonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_failures: 3,
            timeout: Duration::from_secs(10),
            monitor_all: false,
            container_prefix: "autonomous".to_string(),
            auto_start: true,
        }
    }
}

/// Partial options for [`ContainerHealthMonitor::update_options`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorOptionsUpdate {
    pub interval: Option<Duration>,
    pub max_failures: Option<u32>,
    pub timeout: Option<Duration>,
    pub monitor_all: Option<bool>,
    pub container_prefix: Option<String>,
    pub auto_start: Option<bool>,
}

impl HealthMonitorOptionsUpdate {
    /// Set the polling period
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the failure threshold
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn monitor_all(mut self, monitor_all: bool) -> Self {
        self.monitor_all = Some(monitor_all);
        self
    }

    pub fn container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = Some(prefix.into());
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = Some(auto_start);
        self
    }

    /// Overwrite the fields that are set
    pub fn apply_to(self, options: &mut HealthMonitorOptions) {
        if let Some(interval) = self.interval {
            options.interval = interval;
        }
        if let Some(max_failures) = self.max_failures {
            options.max_failures = max_failures;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        if let Some(monitor_all) = self.monitor_all {
            options.monitor_all = monitor_all;
        }
        if let Some(prefix) = self.container_prefix {
            options.container_prefix = prefix;
        }
        if let Some(auto_start) = self.auto_start {
            options.auto_start = auto_start;
        }
    }
}

struct Inner {
    gateway: Arc<dyn ContainerRuntimeGateway>,
    options: RwLock<HealthMonitorOptions>,
    runtime: RwLock<Option<RuntimeKind>>,
    records: DashMap<String, ContainerHealthStatus>,
    /// Added explicitly; checked every batch whatever their name
    pinned: DashSet<String>,
    /// Removed explicitly; skipped by discovery until added again or gone
    excluded: DashSet<String>,
    check_locks: DashMap<String, Arc<Mutex<()>>>,
    active: AtomicBool,
    /// Polling task; also serializes start and stop
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    last_check_time: RwLock<Option<DateTime<Utc>>>,
    events: EventBus<HealthEvent>,
    metrics: GovernorMetrics,
}

impl Inner {
    fn options(&self) -> RwLockReadGuard<'_, HealthMonitorOptions> {
        self.options.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn options_mut(&self) -> RwLockWriteGuard<'_, HealthMonitorOptions> {
        self.options.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_runtime(&self) -> Option<RuntimeKind> {
        *self.runtime.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_runtime(&self, runtime: RuntimeKind) {
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    }

    async fn resolve_runtime(&self) -> Option<RuntimeKind> {
        if let Some(runtime) = self.cached_runtime() {
            return Some(runtime);
        }
        let runtime = self.gateway.detect_runtime().await?;
        self.set_runtime(runtime);
        Some(runtime)
    }

    fn check_lock(&self, container_id: &str) -> Arc<Mutex<()>> {
        self.check_locks
            .entry(container_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the check lock of a container nobody is checking
    fn forget_lock(&self, container_id: &str) {
        self.check_locks
            .remove_if(container_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Check one container and apply the outcome to its record.
    ///
    /// Checks of the same container are serialized; different containers
    /// proceed independently. Returns `None` when the container does not exist.
    async fn check(&self, container_id: &str) -> Option<ContainerHealthStatus> {
        let lock = self.check_lock(container_id);
        let record = {
            let _guard = lock.lock().await;
            self.check_locked(container_id).await
        };
        drop(lock);

        if record.is_none() {
            self.forget_lock(container_id);
        }
        record
    }

    async fn check_locked(&self, container_id: &str) -> Option<ContainerHealthStatus> {
        let started = Instant::now();

        let (container_name, outcome) = match self.gateway.get_container_info(container_id).await
        {
            Ok(Some(info)) => {
                let outcome = self.evaluate(container_id, &info).await;
                (info.name, outcome)
            }
            Ok(None) => {
                if self.records.remove(container_id).is_some() {
                    debug!(container_id = %container_id, "Container disappeared, dropping record");
                }
                return None;
            }
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to inspect container");
                let name = self
                    .records
                    .get(container_id)
                    .map(|r| r.container_name.clone())
                    .unwrap_or_else(|| container_id.to_string());
                (name, CheckOutcome::Failed(format!("failed to inspect container: {}", e)))
            }
        };

        let (max_failures, timeout) = {
            let options = self.options();
            (options.max_failures, options.timeout)
        };
        let checked_at = Utc::now();
        let previous = self
            .records
            .get(container_id)
            .map(|r| r.value().clone());

        let record = next_record(
            previous.as_ref(),
            container_id,
            &container_name,
            &outcome,
            max_failures,
            checked_at,
        );
        self.records.insert(container_id.to_string(), record.clone());
        *self
            .last_check_time
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(checked_at);

        let elapsed = started.elapsed();
        self.metrics
            .observe_health_check(outcome.is_healthy(), elapsed.as_secs_f64());
        if elapsed > timeout {
            warn!(
                container_id = %container_id,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "Health check exceeded timeout"
            );
        }

        debug!(
            container_id = %container_id,
            status = %record.status,
            failing_streak = record.failing_streak,
            "Health check completed"
        );

        if previous.map(|p| p.status) != Some(record.status) {
            self.events
                .emit(HealthEvent::ContainerHealth(record.clone()));
        }
        match outcome.message() {
            None => self.events.emit(HealthEvent::CheckSucceeded {
                container_id: container_id.to_string(),
            }),
            Some(error) => self.events.emit(HealthEvent::CheckFailed {
                container_id: container_id.to_string(),
                error,
            }),
        };

        Some(record)
    }

    /// Verdict for an existing container; gateway errors count as failures
    async fn evaluate(&self, container_id: &str, info: &ContainerInfo) -> CheckOutcome {
        if let Some(outcome) = lifecycle_outcome(info) {
            return outcome;
        }
        let Some(runtime) = self.resolve_runtime().await else {
            return CheckOutcome::Failed(GovernorError::RuntimeUnavailable.to_string());
        };
        match self.gateway.get_stats(container_id, runtime).await {
            Ok(Some(stats)) => evaluate_stats(&stats),
            Ok(None) => CheckOutcome::Failed("container stats unavailable".to_string()),
            Err(e) => CheckOutcome::Failed(format!("failed to read stats: {}", e)),
        }
    }

    /// One polling cycle over the discovered and pinned containers
    async fn perform_health_checks(self: &Arc<Self>) {
        let (monitor_all, prefix) = {
            let options = self.options();
            (options.monitor_all, options.container_prefix.clone())
        };
        let filter = (!monitor_all).then_some(prefix.as_str());

        let listed = match self.gateway.list_containers(filter).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Failed to list containers, skipping health check cycle");
                return;
            }
        };

        let present: HashSet<String> = listed.iter().map(|c| c.id.clone()).collect();
        let mut targets: BTreeSet<String> = listed
            .into_iter()
            .filter(|c| {
                filter
                    .map(|p| c.name.trim_start_matches('/').starts_with(p))
                    .unwrap_or(true)
            })
            .map(|c| c.id)
            .filter(|id| !self.excluded.contains(id))
            .collect();
        targets.extend(self.pinned.iter().map(|id| id.key().clone()));

        debug!(containers = targets.len(), "Running health check cycle");

        let mut checks = JoinSet::new();
        for container_id in targets.iter().cloned() {
            let inner = Arc::clone(self);
            checks.spawn(async move { inner.check(&container_id).await });
        }

        while let Some(joined) = checks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Health check task aborted");
            }
        }

        self.prune(&targets, &present);
        self.update_gauges();
    }

    /// Forget containers that left the listing
    fn prune(&self, targets: &BTreeSet<String>, present: &HashSet<String>) {
        let stale: Vec<String> = self
            .records
            .iter()
            .map(|r| r.key().clone())
            .filter(|id| !targets.contains(id))
            .collect();
        for container_id in stale {
            if self.records.remove(&container_id).is_some() {
                debug!(container_id = %container_id, "Container no longer listed, dropping record");
            }
            self.forget_lock(&container_id);
        }
        self.excluded.retain(|id| present.contains(id));
    }

    fn update_gauges(&self) {
        let unhealthy = self
            .records
            .iter()
            .filter(|r| r.status == HealthState::Unhealthy)
            .count();
        self.metrics
            .set_container_counts(self.records.len() as i64, unhealthy as i64);
    }
}

/// Polling health monitor for the containers this system runs
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ContainerHealthMonitor {
    inner: Arc<Inner>,
}

impl ContainerHealthMonitor {
    pub fn new(gateway: Arc<dyn ContainerRuntimeGateway>, options: HealthMonitorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                options: RwLock::new(options),
                runtime: RwLock::new(None),
                records: DashMap::new(),
                pinned: DashSet::new(),
                excluded: DashSet::new(),
                check_locks: DashMap::new(),
                active: AtomicBool::new(false),
                lifecycle: Mutex::new(None),
                last_check_time: RwLock::new(None),
                events: EventBus::default(),
                metrics: GovernorMetrics::new(),
            }),
        }
    }

    /// Subscribe to lifecycle, transition and per-check events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<HealthEvent> {
        &self.inner.events
    }

    pub fn options(&self) -> HealthMonitorOptions {
        self.inner.options().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolve the runtime, run a first batch, then poll on the configured interval.
    ///
    /// Fails with [`GovernorError::RuntimeUnavailable`] and stays inactive when
    /// no runtime can be found. No-op when already active.
    pub async fn start_monitoring(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.is_active() {
            debug!("Health monitoring already active");
            return Ok(());
        }

        let Some(runtime) = self.inner.gateway.detect_runtime().await else {
            warn!("Cannot start health monitoring without a container runtime");
            return Err(GovernorError::RuntimeUnavailable);
        };
        self.inner.set_runtime(runtime);
        self.inner.active.store(true, Ordering::SeqCst);

        let period = self.inner.options().interval.max(MIN_INTERVAL);
        info!(
            runtime = %runtime,
            interval_secs = period.as_secs_f64(),
            "Container health monitoring started"
        );
        self.inner.events.emit(HealthEvent::MonitoringStarted);

        self.inner.perform_health_checks().await;
        *lifecycle = Some(self.spawn_poller(period));
        Ok(())
    }

    /// Start only when `auto_start` is set
    pub async fn start_if_configured(&self) -> Result<bool> {
        let auto_start = self.inner.options().auto_start;
        if !auto_start {
            debug!("Health monitoring auto start disabled");
            return Ok(false);
        }
        self.start_monitoring().await?;
        Ok(true)
    }

    fn spawn_poller(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                inner.perform_health_checks().await;
            }
        })
    }

    /// Cancel polling and forget every record. No batch starts after this
    /// returns. Idempotent.
    pub async fn stop_monitoring(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);

        if let Some(handle) = lifecycle.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.records.clear();
        self.inner
            .check_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        self.inner.update_gauges();

        if was_active {
            info!("Container health monitoring stopped");
            self.inner.events.emit(HealthEvent::MonitoringStopped);
        }
    }

    /// Check one container now, whether or not it is part of the polled set.
    ///
    /// Returns `None` when the container does not exist. Gateway errors are
    /// recorded as a failed check.
    pub async fn check_container_health(
        &self,
        container_id: &str,
    ) -> Option<ContainerHealthStatus> {
        self.inner.check(container_id).await
    }

    /// Track a container explicitly and check it immediately
    pub async fn add_container(&self, container_id: &str) -> Result<ContainerHealthStatus> {
        let exists = self
            .inner
            .gateway
            .get_container_info(container_id)
            .await
            .map_err(GovernorError::Gateway)?
            .is_some();
        if !exists {
            return Err(GovernorError::ContainerNotFound(container_id.to_string()));
        }

        self.inner.excluded.remove(container_id);
        self.inner.pinned.insert(container_id.to_string());
        info!(container_id = %container_id, "Tracking container");

        self.inner
            .check(container_id)
            .await
            .ok_or_else(|| GovernorError::ContainerNotFound(container_id.to_string()))
    }

    /// Stop tracking a container and forget its record
    pub async fn remove_container(&self, container_id: &str) {
        let lock = self.inner.check_lock(container_id);
        {
            let _guard = lock.lock().await;
            self.inner.pinned.remove(container_id);
            self.inner.excluded.insert(container_id.to_string());
            if self.inner.records.remove(container_id).is_some() {
                info!(container_id = %container_id, "Stopped tracking container");
            }
        }
        drop(lock);

        self.inner.forget_lock(container_id);
        self.inner.update_gauges();
    }

    #[cfg(test)]
    pub(super) fn check_lock_count(&self) -> usize {
        self.inner.check_locks.len()
    }

    #[cfg(test)]
    pub(super) async fn run_batch(&self) {
        self.inner.perform_health_checks().await;
    }

    #[cfg(test)]
    pub(super) fn is_excluded(&self, container_id: &str) -> bool {
        self.inner.excluded.contains(container_id)
    }

    pub fn get_container_health(&self, container_id: &str) -> Option<ContainerHealthStatus> {
        self.inner
            .records
            .get(container_id)
            .map(|r| r.value().clone())
    }

    /// All records, ordered by container id
    pub fn get_health_status(&self) -> Vec<ContainerHealthStatus> {
        let mut records: Vec<ContainerHealthStatus> = self
            .inner
            .records
            .iter()
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    /// Merge new options; restarts polling when active so they apply at once
    pub async fn update_options(&self, update: HealthMonitorOptionsUpdate) -> Result<()> {
        update.apply_to(&mut self.inner.options_mut());

        if self.is_active() {
            debug!("Restarting health monitoring with new options");
            self.stop_monitoring().await;
            self.start_monitoring().await?;
        }
        Ok(())
    }

    pub fn get_stats(&self) -> HealthMonitorStats {
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut starting = 0;
        let mut streak_sum: u64 = 0;

        for record in self.inner.records.iter() {
            match record.status {
                HealthState::Healthy => healthy += 1,
                HealthState::Unhealthy => unhealthy += 1,
                HealthState::Starting => starting += 1,
            }
            streak_sum += u64::from(record.failing_streak);
        }

        let total = healthy + unhealthy + starting;
        let average_failing_streak = if total == 0 {
            0.0
        } else {
            streak_sum as f64 / total as f64
        };

        HealthMonitorStats {
            is_monitoring: self.is_active(),
            total_containers: total,
            healthy_containers: healthy,
            unhealthy_containers: unhealthy,
            starting_containers: starting,
            average_failing_streak,
            last_check_time: *self
                .inner
                .last_check_time
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}
