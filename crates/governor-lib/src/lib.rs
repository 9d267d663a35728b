//! Governance library for autonomous task execution
//!
//! This crate provides the core functionality for:
//! - Capacity monitoring with time-of-day aware restoration events
//! - Container health monitoring over Docker or Podman
//! - Event fan-out to in-process subscribers
//! - Health checks and observability

pub mod capacity;
pub mod container;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;

pub use capacity::{CapacityMonitor, CapacityMonitorStatus, CapacityUsageProvider};
pub use container::{
    CliRuntimeGateway, ContainerHealthMonitor, ContainerRuntimeGateway, HealthMonitorOptions,
    HealthMonitorOptionsUpdate, RuntimeKind,
};
pub use error::{GovernorError, Result};
pub use events::{CapacityEvent, EventBus, HealthEvent};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GovernorMetrics, StructuredLogger};
