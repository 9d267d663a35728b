//! Background tasks that consume monitor events and drive periodic checks

use governor_lib::{
    capacity::CapacityMonitor,
    container::ContainerHealthMonitor,
    events::{CapacityEvent, HealthEvent},
    observability::{GovernorMetrics, StructuredLogger},
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Period of the on-demand capacity comparison
pub const CAPACITY_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Log and count every capacity restoration
pub fn spawn_capacity_pump(
    monitor: &CapacityMonitor,
    logger: StructuredLogger,
    metrics: GovernorMetrics,
) -> JoinHandle<()> {
    let mut rx = monitor.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CapacityEvent::Restored(event)) => {
                    metrics.inc_capacity_restored(event.reason.as_str());
                    logger.log_capacity_restored(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Capacity event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Log container health transitions and per-check outcomes
pub fn spawn_health_pump(monitor: &ContainerHealthMonitor, logger: StructuredLogger) -> JoinHandle<()> {
    let mut rx = monitor.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(HealthEvent::ContainerHealth(record)) => logger.log_health_transition(&record),
                Ok(HealthEvent::CheckFailed {
                    container_id,
                    error,
                }) => {
                    debug!(container_id = %container_id, error = %error, "Health check failed");
                }
                Ok(event) => debug!(topic = event.topic(), "Health event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Health event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Compare capacity snapshots on a fixed period
pub fn spawn_capacity_ticker(monitor: CapacityMonitor, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            monitor.check_capacity();
        }
    })
}
