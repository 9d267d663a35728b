//! Capacity comparisons between consecutive usage snapshots

use crate::models::{CapacityThresholds, CapacityUsage};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fraction of a threshold a usage decrease must exceed to count as restored capacity
pub const SIGNIFICANT_DROP_RATIO: f64 = 0.10;

/// Floor for timer delays whose target is already due
pub const MIN_TIMER_DELAY: Duration = Duration::from_secs(1);

/// True when capacity was freed between `previous` and `current`
///
/// A finished task always counts; token and cost decreases only count when
/// larger than [`SIGNIFICANT_DROP_RATIO`] of the matching threshold.
pub fn capacity_dropped(
    previous: &CapacityUsage,
    current: &CapacityUsage,
    thresholds: &CapacityThresholds,
) -> bool {
    if current.active_tasks < previous.active_tasks {
        return true;
    }

    let tokens_freed = previous.current_tokens.saturating_sub(current.current_tokens);
    if tokens_freed > 0
        && tokens_freed as f64 > thresholds.tokens_threshold as f64 * SIGNIFICANT_DROP_RATIO
    {
        return true;
    }

    let cost_freed = previous.current_cost - current.current_cost;
    cost_freed > 0.0 && cost_freed > thresholds.cost_threshold * SIGNIFICANT_DROP_RATIO
}

/// True when any per-task or concurrency limit strictly increased
pub fn limits_increased(previous: &CapacityUsage, current: &CapacityUsage) -> bool {
    current.max_tokens_per_task > previous.max_tokens_per_task
        || current.max_cost_per_task > previous.max_cost_per_task
        || current.max_concurrent_tasks > previous.max_concurrent_tasks
}

/// Delay until `target`, never shorter than [`MIN_TIMER_DELAY`]
pub fn delay_until(target: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (target - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_TIMER_DELAY)
}
