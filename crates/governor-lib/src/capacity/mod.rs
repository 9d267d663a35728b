//! Capacity governance
//!
//! Watches usage snapshots from a [`CapacityUsageProvider`] and announces when
//! previously constrained capacity becomes available again: after a mode
//! switch that raised limits, at the daily budget reset, or when usage drops.

mod detection;
mod monitor;
mod policy;

#[cfg(test)]
mod tests;

pub use detection::{
    capacity_dropped, delay_until, limits_increased, MIN_TIMER_DELAY, SIGNIFICANT_DROP_RATIO,
};
pub use monitor::{CapacityMonitor, CapacityMonitorStatus, PROVIDER_RETRY_DELAY};
pub use policy::{
    BaseLimits, ModeThresholds, PolicyUsageProvider, TimeBasedPolicy, TimeBasedUsageConfig,
    UsageCounters, UsageLedger,
};

use crate::models::{CapacityThresholds, CapacityUsage, ModeInfo};

/// Source of usage snapshots, mode schedule and thresholds
///
/// Queries are synchronous. Errors are absorbed by the monitor and treated as
/// "no new information" for that cycle.
pub trait CapacityUsageProvider: Send + Sync {
    fn get_current_usage(&self) -> anyhow::Result<CapacityUsage>;

    fn get_mode_info(&self) -> anyhow::Result<ModeInfo>;

    fn get_thresholds(&self) -> anyhow::Result<CapacityThresholds>;
}
