//! Daemon configuration

use anyhow::{Context, Result};
use governor_lib::capacity::{BaseLimits, TimeBasedUsageConfig};
use governor_lib::container::HealthMonitorOptions;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "GOVERNOR_CONFIG";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "GOVERNOR";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name attached to every structured log record
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Day/night policy
    #[serde(default)]
    pub time_based_usage: TimeBasedUsageConfig,

    /// Base limits before mode overrides
    #[serde(default)]
    pub limits: BaseLimits,

    /// Container health monitoring
    #[serde(default)]
    pub health: HealthSettings,
}

/// Health monitor settings with durations in whole seconds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub max_failures: u32,
    pub timeout_secs: u64,
    pub monitor_all: bool,
    pub container_prefix: String,
    pub auto_start: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        let options = HealthMonitorOptions::default();
        Self {
            interval_secs: options.interval.as_secs(),
            max_failures: options.max_failures,
            timeout_secs: options.timeout.as_secs(),
            monitor_all: options.monitor_all,
            container_prefix: options.container_prefix,
            auto_start: options.auto_start,
        }
    }
}

impl HealthSettings {
    pub fn to_options(&self) -> HealthMonitorOptions {
        HealthMonitorOptions {
            interval: Duration::from_secs(self.interval_secs),
            max_failures: self.max_failures,
            timeout: Duration::from_secs(self.timeout_secs),
            monitor_all: self.monitor_all,
            container_prefix: self.container_prefix.clone(),
            auto_start: self.auto_start,
        }
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "governor".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl DaemonConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::from_sources(file.as_deref().map(Path::new), None)
    }

    /// Load from an optional file, with environment overrides.
    ///
    /// `env` replaces the process environment when given.
    pub fn from_sources(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("time_based_usage.day_mode_hours")
                .with_list_parse_key("time_based_usage.night_mode_hours")
                .source(env),
        );

        let config = builder.build().context("failed to read configuration")?;
        config
            .try_deserialize()
            .context("invalid governor configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = assert_ok!(DaemonConfig::from_sources(None, env(&[])));

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.limits, BaseLimits::default());
        assert!(!config.time_based_usage.enabled);

        let options = config.health.to_options();
        assert_eq!(options, HealthMonitorOptions::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = assert_ok!(DaemonConfig::from_sources(
            None,
            env(&[
                ("GOVERNOR_API_PORT", "9100"),
                ("GOVERNOR_INSTANCE_NAME", "builder-1"),
                ("GOVERNOR_HEALTH__MAX_FAILURES", "5"),
                ("GOVERNOR_HEALTH__MONITOR_ALL", "true"),
                ("GOVERNOR_LIMITS__MAX_CONCURRENT_TASKS", "4"),
            ]),
        ));

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.instance_name, "builder-1");
        assert_eq!(config.health.max_failures, 5);
        assert!(config.health.monitor_all);
        assert_eq!(config.limits.max_concurrent_tasks, 4);
        assert_eq!(config.limits.max_tokens_per_task, 100_000);
    }

    #[test]
    fn test_file_with_env_precedence() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
api_port = 7000

[time_based_usage]
enabled = true
night_mode_hours = [23, 0, 1, 2]

[time_based_usage.night_mode_thresholds]
max_concurrent_tasks = 6

[health]
interval_secs = 5
container_prefix = "worker"
"#
        )
        .unwrap();

        let config = DaemonConfig::from_sources(
            Some(file.path()),
            env(&[("GOVERNOR_API_PORT", "7001")]),
        )
        .unwrap();

        assert_eq!(config.api_port, 7001);
        assert!(config.time_based_usage.enabled);
        assert_eq!(config.time_based_usage.night_mode_hours, vec![23, 0, 1, 2]);
        assert_eq!(
            config.time_based_usage.night_mode_thresholds.max_concurrent_tasks,
            Some(6)
        );

        let options = config.health.to_options();
        assert_eq!(options.interval, Duration::from_secs(5));
        assert_eq!(options.container_prefix, "worker");
        assert_eq!(options.max_failures, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = assert_err!(DaemonConfig::from_sources(
            Some(Path::new("/nonexistent/governor.toml")),
            env(&[]),
        ));
        assert!(err.to_string().contains("failed to read configuration"));
    }
}
