//! Capacity monitor
//!
//! Owns two self-rescheduling timers (mode switch and midnight) and the most
//! recent usage/mode snapshot. Timers re-read their next target from the
//! provider on every fire instead of running at a fixed period.

use super::detection::{capacity_dropped, delay_until, limits_increased};
use super::CapacityUsageProvider;
use crate::events::{CapacityEvent, EventBus};
use crate::models::{CapacityRestoredEvent, CapacityUsage, ModeInfo, RestoreReason};
use crate::observability::GovernorMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wait before retrying when the provider could not supply a timer target
pub const PROVIDER_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ModeSwitch,
    Midnight,
}

impl TimerKind {
    fn target(&self, info: &ModeInfo) -> DateTime<Utc> {
        match self {
            TimerKind::ModeSwitch => info.next_mode_switch,
            TimerKind::Midnight => info.next_midnight,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TimerKind::ModeSwitch => "mode_switch",
            TimerKind::Midnight => "midnight",
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    running: bool,
    /// Bumped on every start so timers from an earlier run never act
    generation: u64,
    last_usage: Option<CapacityUsage>,
    last_mode_info: Option<ModeInfo>,
}

impl MonitorState {
    fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }
}

#[derive(Default)]
struct Timers {
    mode_switch: Option<JoinHandle<()>>,
    midnight: Option<JoinHandle<()>>,
}

fn is_armed(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
}

/// Snapshot returned by [`CapacityMonitor::status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityMonitorStatus {
    pub is_running: bool,
    pub has_mode_switch_timer: bool,
    pub has_midnight_timer: bool,
    pub last_usage: Option<CapacityUsage>,
    pub next_mode_switch: Option<DateTime<Utc>>,
    pub next_midnight: Option<DateTime<Utc>>,
}

struct Inner {
    provider: Arc<dyn CapacityUsageProvider>,
    state: Mutex<MonitorState>,
    timers: Mutex<Timers>,
    events: EventBus<CapacityEvent>,
    metrics: GovernorMetrics,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_usage(&self) -> Option<CapacityUsage> {
        match self.provider.get_current_usage() {
            Ok(usage) => Some(usage),
            Err(e) => {
                warn!(error = %e, "Failed to read capacity usage");
                self.metrics.inc_provider_errors();
                None
            }
        }
    }

    fn read_mode_info(&self) -> Option<ModeInfo> {
        match self.provider.get_mode_info() {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Failed to read mode info");
                self.metrics.inc_provider_errors();
                None
            }
        }
    }

    fn emit(
        &self,
        reason: RestoreReason,
        previous_usage: Option<CapacityUsage>,
        current_usage: CapacityUsage,
        mode_info: Option<ModeInfo>,
    ) {
        info!(reason = %reason, "Capacity restored");
        self.events.emit(CapacityEvent::Restored(CapacityRestoredEvent {
            reason,
            timestamp: Utc::now(),
            previous_usage,
            current_usage,
            mode_info,
        }));
    }

    /// Handle a timer that reached its target.
    ///
    /// Returns `None` once the monitor has stopped, otherwise the next target
    /// (itself `None` when the provider could not supply one).
    fn on_timer(&self, kind: TimerKind, generation: u64) -> Option<Option<DateTime<Utc>>> {
        let mut state = self.state();
        if !state.is_current(generation) {
            return None;
        }

        debug!(timer = kind.name(), "Capacity timer fired");
        let usage = self.read_usage();
        let mode_info = self.read_mode_info();
        if let Some(info) = &mode_info {
            state.last_mode_info = Some(info.clone());
        }

        if let Some(current) = usage {
            let previous = state.last_usage.replace(current.clone());
            let announce = match kind {
                TimerKind::ModeSwitch => previous
                    .as_ref()
                    .map(|p| limits_increased(p, &current))
                    .unwrap_or(false),
                // A budget reset restores capacity whether or not spend changed
                TimerKind::Midnight => true,
            };
            if announce {
                let reason = match kind {
                    TimerKind::ModeSwitch => RestoreReason::ModeSwitch,
                    TimerKind::Midnight => RestoreReason::BudgetReset,
                };
                self.emit(reason, previous, current, state.last_mode_info.clone());
            }
        }

        Some(mode_info.map(|info| kind.target(&info)))
    }

    /// Re-read the target for a timer that had none
    fn refresh_target(&self, kind: TimerKind, generation: u64) -> Option<Option<DateTime<Utc>>> {
        let mut state = self.state();
        if !state.is_current(generation) {
            return None;
        }
        let mode_info = self.read_mode_info();
        let target = mode_info.as_ref().map(|info| kind.target(info));
        if mode_info.is_some() {
            state.last_mode_info = mode_info;
        }
        Some(target)
    }
}

/// Time-of-day aware capacity restoration monitor
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct CapacityMonitor {
    inner: Arc<Inner>,
}

impl CapacityMonitor {
    pub fn new(provider: Arc<dyn CapacityUsageProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                state: Mutex::new(MonitorState::default()),
                timers: Mutex::new(Timers::default()),
                events: EventBus::default(),
                metrics: GovernorMetrics::new(),
            }),
        }
    }

    /// Subscribe to `capacity:restored` events
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<CapacityEvent> {
        &self.inner.events
    }

    /// Take an initial snapshot and arm both timers. No-op when running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        // Held until both timers are stored so a concurrent stop cannot miss them
        let mut timers = self.inner.timers();

        let (generation, mode_info) = {
            let mut state = self.inner.state();
            if state.running {
                debug!("Capacity monitor already running");
                return;
            }
            state.running = true;
            state.generation += 1;
            state.last_usage = self.inner.read_usage();
            state.last_mode_info = self.inner.read_mode_info();
            (state.generation, state.last_mode_info.clone())
        };

        let mode_switch_target = mode_info.as_ref().map(|i| i.next_mode_switch);
        let midnight_target = mode_info.as_ref().map(|i| i.next_midnight);

        timers.mode_switch = Some(self.spawn_timer(
            TimerKind::ModeSwitch,
            mode_switch_target,
            generation,
        ));
        timers.midnight = Some(self.spawn_timer(TimerKind::Midnight, midnight_target, generation));

        info!(
            next_mode_switch = ?mode_switch_target,
            next_midnight = ?midnight_target,
            "Capacity monitor started"
        );
    }

    fn spawn_timer(
        &self,
        kind: TimerKind,
        initial_target: Option<DateTime<Utc>>,
        generation: u64,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut target = initial_target;
            loop {
                let delay = match target {
                    Some(t) => delay_until(t, Utc::now()),
                    None => PROVIDER_RETRY_DELAY,
                };
                debug!(timer = kind.name(), delay_ms = delay.as_millis() as u64, "Timer armed");
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let next = if target.is_some() {
                    inner.on_timer(kind, generation)
                } else {
                    inner.refresh_target(kind, generation)
                };
                match next {
                    Some(t) => target = t,
                    None => break,
                }
            }
        })
    }

    /// Cancel both timers. No timer callback runs after this returns.
    pub async fn stop(&self) {
        // Timers before state, as in start
        let handles = {
            let mut timers = self.inner.timers();
            let mut state = self.inner.state();
            if !state.running {
                return;
            }
            state.running = false;
            [timers.mode_switch.take(), timers.midnight.take()]
        };
        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }

        info!("Capacity monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    /// Compare a fresh snapshot with the previous one and announce freed capacity
    pub fn check_capacity(&self) {
        let mut state = self.inner.state();
        if !state.running {
            return;
        }

        let Some(current) = self.inner.read_usage() else {
            return;
        };

        let Some(previous) = state.last_usage.replace(current.clone()) else {
            debug!("Stored baseline capacity snapshot");
            return;
        };

        let thresholds = match self.inner.provider.get_thresholds() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Failed to read capacity thresholds");
                self.inner.metrics.inc_provider_errors();
                return;
            }
        };

        if capacity_dropped(&previous, &current, &thresholds) {
            self.inner.emit(
                RestoreReason::CapacityDropped,
                Some(previous),
                current,
                state.last_mode_info.clone(),
            );
        }
    }

    pub fn status(&self) -> CapacityMonitorStatus {
        let (is_running, last_usage, mode_info) = {
            let state = self.inner.state();
            (
                state.running,
                state.last_usage.clone(),
                state.last_mode_info.clone(),
            )
        };
        let timers = self.inner.timers();

        CapacityMonitorStatus {
            is_running,
            has_mode_switch_timer: is_armed(&timers.mode_switch),
            has_midnight_timer: is_armed(&timers.midnight),
            last_usage,
            next_mode_switch: mode_info.as_ref().map(|i| i.next_mode_switch),
            next_midnight: mode_info.as_ref().map(|i| i.next_midnight),
        }
    }
}
