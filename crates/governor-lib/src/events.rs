//! Push notifications emitted by the monitors
//!
//! Each monitor owns an [`EventBus`] backed by a tokio broadcast channel.
//! Subscribers receive every event published after they subscribed; a
//! subscriber that falls behind by more than the channel capacity observes a
//! lag error instead of blocking the monitor.

use crate::models::{CapacityRestoredEvent, ContainerHealthStatus};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Topic names, as seen by log consumers
pub mod topics {
    pub const CAPACITY_RESTORED: &str = "capacity:restored";
    pub const MONITORING_STARTED: &str = "monitoring:started";
    pub const MONITORING_STOPPED: &str = "monitoring:stopped";
    pub const CONTAINER_HEALTH: &str = "container:health";
    pub const CHECK_SUCCESS: &str = "health:check:success";
    pub const CHECK_FAILED: &str = "health:check:failed";
}

/// Events emitted by the container health monitor
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    MonitoringStarted,
    MonitoringStopped,
    /// Emitted only when a container's status changes, including first observation
    ContainerHealth(ContainerHealthStatus),
    CheckSucceeded { container_id: String },
    CheckFailed { container_id: String, error: String },
}

impl HealthEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            HealthEvent::MonitoringStarted => topics::MONITORING_STARTED,
            HealthEvent::MonitoringStopped => topics::MONITORING_STOPPED,
            HealthEvent::ContainerHealth(_) => topics::CONTAINER_HEALTH,
            HealthEvent::CheckSucceeded { .. } => topics::CHECK_SUCCESS,
            HealthEvent::CheckFailed { .. } => topics::CHECK_FAILED,
        }
    }
}

/// Events emitted by the capacity monitor
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityEvent {
    Restored(CapacityRestoredEvent),
}

impl CapacityEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            CapacityEvent::Restored(_) => topics::CAPACITY_RESTORED,
        }
    }
}

/// In-process publish/subscribe channel
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: E) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("Event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`
    pub fn stream(&self) -> BroadcastStream<E> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn test_emit_without_subscribers() {
        let bus: EventBus<HealthEvent> = EventBus::default();
        assert_eq!(bus.emit(HealthEvent::MonitoringStarted), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus: EventBus<HealthEvent> = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.stream();

        assert_eq!(bus.emit(HealthEvent::MonitoringStopped), 2);

        assert_eq!(first.recv().await.unwrap(), HealthEvent::MonitoringStopped);
        assert_eq!(
            second.next().await.unwrap().unwrap(),
            HealthEvent::MonitoringStopped
        );
    }

    #[test]
    fn test_topics() {
        assert_eq!(HealthEvent::MonitoringStarted.topic(), "monitoring:started");
        assert_eq!(
            HealthEvent::CheckFailed {
                container_id: "c1".to_string(),
                error: "boom".to_string(),
            }
            .topic(),
            "health:check:failed"
        );
    }
}
