//! Time-of-day usage policy
//!
//! Derives the active mode, its limits and thresholds from daemon
//! configuration, and combines them with caller-reported counters into a
//! ready-made [`CapacityUsageProvider`].

use super::CapacityUsageProvider;
use crate::models::{CapacityThresholds, CapacityUsage, Mode, ModeInfo};
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// How far ahead to look for the next mode flip
const MODE_SWITCH_HORIZON_HOURS: i64 = 48;

/// Per-mode overrides of the base limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    pub max_tokens_per_task: Option<u64>,
    pub max_cost_per_task: Option<f64>,
    pub max_concurrent_tasks: Option<u32>,
}

/// Time-based usage policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBasedUsageConfig {
    pub enabled: bool,
    pub day_mode_hours: Vec<u32>,
    pub night_mode_hours: Vec<u32>,
    pub day_mode_thresholds: ModeThresholds,
    pub night_mode_thresholds: ModeThresholds,
}

impl Default for TimeBasedUsageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            day_mode_hours: (6..22).collect(),
            night_mode_hours: (22..24).chain(0..6).collect(),
            day_mode_thresholds: ModeThresholds::default(),
            night_mode_thresholds: ModeThresholds::default(),
        }
    }
}

/// Limits that apply when no mode override is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseLimits {
    pub max_tokens_per_task: u64,
    pub max_cost_per_task: f64,
    pub max_concurrent_tasks: u32,
    pub daily_budget: f64,
}

impl Default for BaseLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_task: 100_000,
            max_cost_per_task: 1.0,
            max_concurrent_tasks: 2,
            daily_budget: 10.0,
        }
    }
}

/// Mode schedule and per-mode limits
#[derive(Debug, Clone, Default)]
pub struct TimeBasedPolicy {
    config: TimeBasedUsageConfig,
    limits: BaseLimits,
}

impl TimeBasedPolicy {
    pub fn new(config: TimeBasedUsageConfig, limits: BaseLimits) -> Self {
        Self { config, limits }
    }

    /// Mode active at the given local time
    pub fn mode_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Mode {
        if self.config.enabled && self.config.night_mode_hours.contains(&now.hour()) {
            Mode::Night
        } else {
            Mode::Day
        }
    }

    /// Mode plus the next mode switch and the next local midnight
    pub fn mode_info_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> ModeInfo {
        let mode = self.mode_at(now);
        let next_midnight = next_midnight(now);

        let hour_start = truncate_to_hour(now);
        let next_mode_switch = (1..=MODE_SWITCH_HORIZON_HOURS)
            .map(|h| hour_start.clone() + Duration::hours(h))
            .find(|t| self.mode_at(t) != mode)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(next_midnight);

        ModeInfo {
            mode,
            mode_hours: self.mode_hours(mode),
            next_mode_switch,
            next_midnight,
        }
    }

    fn mode_hours(&self, mode: Mode) -> BTreeSet<u32> {
        if !self.config.enabled {
            return (0..24).collect();
        }
        match mode {
            Mode::Day => self.config.day_mode_hours.iter().copied().collect(),
            Mode::Night => self.config.night_mode_hours.iter().copied().collect(),
        }
    }

    /// Base limits with the mode's overrides applied
    pub fn limits_for(&self, mode: Mode) -> BaseLimits {
        if !self.config.enabled {
            return self.limits.clone();
        }
        let overrides = match mode {
            Mode::Day => &self.config.day_mode_thresholds,
            Mode::Night => &self.config.night_mode_thresholds,
        };
        BaseLimits {
            max_tokens_per_task: overrides
                .max_tokens_per_task
                .unwrap_or(self.limits.max_tokens_per_task),
            max_cost_per_task: overrides
                .max_cost_per_task
                .unwrap_or(self.limits.max_cost_per_task),
            max_concurrent_tasks: overrides
                .max_concurrent_tasks
                .unwrap_or(self.limits.max_concurrent_tasks),
            daily_budget: self.limits.daily_budget,
        }
    }

    /// Saturation levels for the mode, sized by its concurrency
    pub fn thresholds_for(&self, mode: Mode) -> CapacityThresholds {
        let limits = self.limits_for(mode);
        CapacityThresholds {
            tokens_threshold: limits
                .max_tokens_per_task
                .saturating_mul(u64::from(limits.max_concurrent_tasks)),
            cost_threshold: limits.max_cost_per_task * f64::from(limits.max_concurrent_tasks),
            budget_threshold: limits.daily_budget,
            concurrent_threshold: limits.max_concurrent_tasks,
        }
    }
}

fn truncate_to_hour<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| now.clone())
}

fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|naive| now.timezone().from_local_datetime(&naive).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc) + Duration::hours(24))
}

/// Caller-reported usage counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub current_tokens: u64,
    pub current_cost: f64,
    pub active_tasks: u32,
    pub daily_spent: f64,
}

#[derive(Debug)]
struct LedgerState {
    counters: UsageCounters,
    day: NaiveDate,
}

impl LedgerState {
    fn roll_to(&mut self, today: NaiveDate) {
        if today != self.day {
            self.counters.daily_spent = 0.0;
            self.day = today;
        }
    }
}

/// Thread-safe usage counters updated by the surrounding daemon
///
/// `daily_spent` starts from zero whenever the local date changes.
#[derive(Debug)]
pub struct UsageLedger {
    state: Mutex<LedgerState>,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::starting_on(Local::now().date_naive())
    }

    pub fn starting_on(day: NaiveDate) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                counters: UsageCounters::default(),
                day,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn task_started(&self) {
        self.with_state(|s| s.counters.active_tasks += 1);
    }

    pub fn task_finished(&self) {
        self.with_state(|s| s.counters.active_tasks = s.counters.active_tasks.saturating_sub(1));
    }

    /// Account tokens and cost consumed by running work
    pub fn record_usage(&self, tokens: u64, cost: f64) {
        let today = Local::now().date_naive();
        self.with_state(|s| {
            s.roll_to(today);
            s.counters.current_tokens = s.counters.current_tokens.saturating_add(tokens);
            s.counters.current_cost += cost;
            s.counters.daily_spent += cost;
        });
    }

    /// Release tokens and cost held by finished work; daily spend is kept
    pub fn release_usage(&self, tokens: u64, cost: f64) {
        self.with_state(|s| {
            s.counters.current_tokens = s.counters.current_tokens.saturating_sub(tokens);
            s.counters.current_cost = (s.counters.current_cost - cost).max(0.0);
        });
    }

    /// Overwrite all counters
    pub fn set(&self, counters: UsageCounters) {
        self.with_state(|s| s.counters = counters);
    }

    pub fn snapshot(&self) -> UsageCounters {
        self.snapshot_on(Local::now().date_naive())
    }

    pub fn snapshot_on(&self, today: NaiveDate) -> UsageCounters {
        self.with_state(|s| {
            s.roll_to(today);
            s.counters.clone()
        })
    }
}

/// Usage provider backed by [`TimeBasedPolicy`] and a [`UsageLedger`]
#[derive(Debug, Clone)]
pub struct PolicyUsageProvider {
    policy: TimeBasedPolicy,
    ledger: Arc<UsageLedger>,
}

impl PolicyUsageProvider {
    pub fn new(policy: TimeBasedPolicy, ledger: Arc<UsageLedger>) -> Self {
        Self { policy, ledger }
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    fn usage_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> CapacityUsage {
        let limits = self.policy.limits_for(self.policy.mode_at(now));
        let counters = self.ledger.snapshot_on(now.date_naive());
        CapacityUsage {
            current_tokens: counters.current_tokens,
            current_cost: counters.current_cost,
            active_tasks: counters.active_tasks,
            max_tokens_per_task: limits.max_tokens_per_task,
            max_cost_per_task: limits.max_cost_per_task,
            max_concurrent_tasks: limits.max_concurrent_tasks,
            daily_budget: limits.daily_budget,
            daily_spent: counters.daily_spent,
        }
    }
}

impl CapacityUsageProvider for PolicyUsageProvider {
    fn get_current_usage(&self) -> anyhow::Result<CapacityUsage> {
        Ok(self.usage_at(&Local::now()))
    }

    fn get_mode_info(&self) -> anyhow::Result<ModeInfo> {
        Ok(self.policy.mode_info_at(&Local::now()))
    }

    fn get_thresholds(&self) -> anyhow::Result<CapacityThresholds> {
        let mode = self.policy.mode_at(&Local::now());
        Ok(self.policy.thresholds_for(mode))
    }
}
