//! Scheduling and detection tests for the capacity monitor
//!
//! Timer tests run with a paused tokio clock so sleeping timers are driven by
//! virtual time.

use super::*;
use crate::events::CapacityEvent;
use crate::models::{CapacityRestoredEvent, Mode, RestoreReason};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Provider whose answers are scripted by the test
struct FakeProvider {
    usage: Mutex<CapacityUsage>,
    mode_switch_in: Mutex<chrono::Duration>,
    midnight_in: Mutex<chrono::Duration>,
    failing: AtomicBool,
    thresholds_failing: AtomicBool,
    usage_reads: AtomicUsize,
}

impl FakeProvider {
    fn new(mode_switch_in: chrono::Duration, midnight_in: chrono::Duration) -> Arc<Self> {
        Arc::new(Self {
            usage: Mutex::new(base_usage()),
            mode_switch_in: Mutex::new(mode_switch_in),
            midnight_in: Mutex::new(midnight_in),
            failing: AtomicBool::new(false),
            thresholds_failing: AtomicBool::new(false),
            usage_reads: AtomicUsize::new(0),
        })
    }

    fn far_timers() -> Arc<Self> {
        Self::new(chrono::Duration::hours(6), chrono::Duration::hours(12))
    }

    fn update(&self, f: impl FnOnce(&mut CapacityUsage)) {
        f(&mut self.usage.lock().unwrap());
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn reads(&self) -> usize {
        self.usage_reads.load(Ordering::SeqCst)
    }
}

impl CapacityUsageProvider for FakeProvider {
    fn get_current_usage(&self) -> anyhow::Result<CapacityUsage> {
        self.usage_reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage store unavailable");
        }
        Ok(self.usage.lock().unwrap().clone())
    }

    fn get_mode_info(&self) -> anyhow::Result<ModeInfo> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage store unavailable");
        }
        let now = Utc::now();
        Ok(ModeInfo {
            mode: Mode::Day,
            mode_hours: (8..20).collect(),
            next_mode_switch: now + *self.mode_switch_in.lock().unwrap(),
            next_midnight: now + *self.midnight_in.lock().unwrap(),
        })
    }

    fn get_thresholds(&self) -> anyhow::Result<CapacityThresholds> {
        if self.failing.load(Ordering::SeqCst) || self.thresholds_failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage store unavailable");
        }
        Ok(CapacityThresholds {
            tokens_threshold: 1_000,
            cost_threshold: 10.0,
            budget_threshold: 10.0,
            concurrent_threshold: 2,
        })
    }
}

fn base_usage() -> CapacityUsage {
    CapacityUsage {
        current_tokens: 500,
        current_cost: 5.0,
        active_tasks: 2,
        max_tokens_per_task: 100_000,
        max_cost_per_task: 1.0,
        max_concurrent_tasks: 2,
        daily_budget: 10.0,
        daily_spent: 4.0,
    }
}

fn restored(event: CapacityEvent) -> CapacityRestoredEvent {
    match event {
        CapacityEvent::Restored(e) => e,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<CapacityEvent>, within: Duration) -> Option<CapacityRestoredEvent> {
    timeout(within, rx.recv()).await.ok().and_then(|r| r.ok()).map(restored)
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_captures_snapshot_and_arms_timers() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());

        monitor.start();
        let status = monitor.status();

        assert!(status.is_running);
        assert!(status.has_mode_switch_timer);
        assert!(status.has_midnight_timer);
        assert_eq!(status.last_usage, Some(base_usage()));
        assert!(status.next_mode_switch.unwrap() > Utc::now());
        assert!(status.next_midnight.unwrap() > status.next_mode_switch.unwrap());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());

        monitor.start();
        let first = monitor.status();
        monitor.start();
        let second = monitor.status();

        assert_eq!(first, second);
        assert_eq!(provider.reads(), 1);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let monitor = CapacityMonitor::new(FakeProvider::far_timers());

        // Stopping a monitor that never started is a no-op
        monitor.stop().await;

        monitor.start();
        monitor.stop().await;
        monitor.stop().await;

        let status = monitor.status();
        assert!(!status.is_running);
        assert!(!status.has_mode_switch_timer);
        assert!(!status.has_midnight_timer);
    }

    #[tokio::test]
    async fn test_provider_failure_during_start_is_absorbed() {
        let provider = FakeProvider::far_timers();
        provider.set_failing(true);
        let monitor = CapacityMonitor::new(provider.clone());

        monitor.start();
        let status = monitor.status();

        assert!(status.is_running);
        assert!(status.last_usage.is_none());
        assert!(status.next_mode_switch.is_none());
        // Timers stay armed and retry the provider later
        assert!(status.has_mode_switch_timer);
        assert!(status.has_midnight_timer);

        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_and_stop_keep_timers_consistent() {
        let monitor = CapacityMonitor::new(FakeProvider::far_timers());

        for _ in 0..200 {
            monitor.start();

            let stopper = monitor.clone();
            let starter = monitor.clone();
            let stop = tokio::spawn(async move { stopper.stop().await });
            let start = tokio::spawn(async move { starter.start() });
            stop.await.unwrap();
            start.await.unwrap();

            let status = monitor.status();
            assert_eq!(status.has_mode_switch_timer, status.is_running);
            assert_eq!(status.has_midnight_timer, status.is_running);

            monitor.stop().await;
        }
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());

        monitor.start();
        monitor.stop().await;
        monitor.start();

        assert!(monitor.is_running());
        assert!(monitor.status().has_midnight_timer);
        assert_eq!(provider.reads(), 2);

        monitor.stop().await;
    }
}

mod check_capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_check_before_start_is_noop() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());

        monitor.check_capacity();

        assert_eq!(provider.reads(), 0);
        assert!(monitor.status().last_usage.is_none());
    }

    #[tokio::test]
    async fn test_small_token_drop_does_not_emit() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        // 9% of the tokens threshold
        provider.update(|u| u.current_tokens = 410);
        monitor.check_capacity();

        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.status().last_usage.unwrap().current_tokens, 410);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_significant_token_drop_emits() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        // 11% of the tokens threshold
        provider.update(|u| u.current_tokens = 390);
        monitor.check_capacity();

        let event = restored(rx.try_recv().unwrap());
        assert_eq!(event.reason, RestoreReason::CapacityDropped);
        assert_eq!(event.previous_usage.unwrap().current_tokens, 500);
        assert_eq!(event.current_usage.current_tokens, 390);
        assert!(event.mode_info.is_some());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_finished_task_emits() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.update(|u| u.active_tasks = 1);
        monitor.check_capacity();
        assert_eq!(
            restored(rx.try_recv().unwrap()).reason,
            RestoreReason::CapacityDropped
        );

        // Same snapshot again: nothing new to announce
        monitor.check_capacity();
        assert!(rx.try_recv().is_err());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_first_observation_is_baseline() {
        let provider = FakeProvider::far_timers();
        provider.set_failing(true);
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.set_failing(false);
        provider.update(|u| u.active_tasks = 1);
        monitor.check_capacity();
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.status().last_usage.unwrap().active_tasks, 1);

        provider.update(|u| u.active_tasks = 0);
        monitor.check_capacity();
        assert!(rx.try_recv().is_ok());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_previous_snapshot() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.set_failing(true);
        monitor.check_capacity();

        let status = monitor.status();
        assert!(status.is_running);
        assert!(status.has_mode_switch_timer);
        assert_eq!(status.last_usage, Some(base_usage()));
        assert!(rx.try_recv().is_err());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_threshold_failure_still_replaces_snapshot() {
        let provider = FakeProvider::far_timers();
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.update(|u| u.current_tokens = 100);
        provider.thresholds_failing.store(true, Ordering::SeqCst);
        monitor.check_capacity();

        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.status().last_usage.unwrap().current_tokens, 100);

        // Compared against the replaced snapshot, not the start baseline
        provider.thresholds_failing.store(false, Ordering::SeqCst);
        monitor.check_capacity();
        assert!(rx.try_recv().is_err());

        monitor.stop().await;
    }
}

mod timer_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_midnight_always_emits_budget_reset() {
        let provider = FakeProvider::new(chrono::Duration::hours(6), chrono::Duration::seconds(5));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        // Spend is unchanged between the two reads
        let event = next_event(&mut rx, Duration::from_secs(10)).await.unwrap();
        assert_eq!(event.reason, RestoreReason::BudgetReset);
        assert_eq!(event.previous_usage.as_ref(), Some(&event.current_usage));

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_reschedules_from_fresh_target() {
        let provider = FakeProvider::new(chrono::Duration::hours(6), chrono::Duration::seconds(5));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        assert!(next_event(&mut rx, Duration::from_secs(10)).await.is_some());
        assert!(next_event(&mut rx, Duration::from_secs(10)).await.is_some());
        assert!(monitor.status().has_midnight_timer);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_emits_when_limits_increase() {
        let provider = FakeProvider::new(chrono::Duration::seconds(5), chrono::Duration::hours(12));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.update(|u| u.max_concurrent_tasks = 4);

        let event = next_event(&mut rx, Duration::from_secs(10)).await.unwrap();
        assert_eq!(event.reason, RestoreReason::ModeSwitch);
        assert_eq!(event.previous_usage.unwrap().max_concurrent_tasks, 2);
        assert_eq!(event.current_usage.max_concurrent_tasks, 4);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_silent_when_limits_not_increased() {
        let provider = FakeProvider::new(chrono::Duration::seconds(5), chrono::Duration::hours(12));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        // Unchanged limits
        assert!(next_event(&mut rx, Duration::from_secs(12)).await.is_none());
        let reads_after_first_fires = provider.reads();
        assert!(reads_after_first_fires > 1);

        // Lower limits
        provider.update(|u| {
            u.max_concurrent_tasks = 1;
            u.max_cost_per_task = 0.5;
        });
        assert!(next_event(&mut rx, Duration::from_secs(12)).await.is_none());

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callback_after_stop() {
        let provider = FakeProvider::new(chrono::Duration::seconds(5), chrono::Duration::seconds(5));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();
        monitor.stop().await;

        let reads = provider.reads();
        assert!(next_event(&mut rx, Duration::from_secs(60)).await.is_none());
        assert_eq!(provider.reads(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_target_is_clamped() {
        let provider = FakeProvider::new(chrono::Duration::hours(6), chrono::Duration::minutes(-30));
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();

        let started = tokio::time::Instant::now();
        monitor.start();

        let event = next_event(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.reason, RestoreReason::BudgetReset);
        assert!(started.elapsed() >= MIN_TIMER_DELAY);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_retries_after_provider_failure() {
        let provider = FakeProvider::new(chrono::Duration::hours(6), chrono::Duration::seconds(5));
        provider.set_failing(true);
        let monitor = CapacityMonitor::new(provider.clone());
        let mut rx = monitor.subscribe();
        monitor.start();

        provider.set_failing(false);

        // First wake-up only fetches a target; the reset follows shortly after
        let event = next_event(&mut rx, PROVIDER_RETRY_DELAY + Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(event.reason, RestoreReason::BudgetReset);
        assert!(monitor.status().next_midnight.is_some());

        monitor.stop().await;
    }
}
