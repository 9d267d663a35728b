//! Parsing of container engine CLI output
//!
//! Docker and Podman print `inspect`, `ps` and `stats` records as JSON, but
//! the stats fields are human-readable strings such as `12.5%` or
//! `1.2MiB / 2GiB` that need converting to numbers.

use crate::error::{GovernorError, Result};
use crate::models::{ContainerInfo, ContainerStats};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Placeholder both engines print for unavailable values
const UNAVAILABLE: &str = "--";

/// Timestamp engines report for containers that never started
const ZERO_TIME_PREFIX: &str = "0001-01-01";

/// Parse `"12.34%"` into `12.34`
pub fn parse_percent(value: &str) -> Result<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == UNAVAILABLE {
        return Ok(0.0);
    }
    trimmed
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .map_err(|_| GovernorError::Parse(format!("invalid percentage: {value}")))
}

/// Parse a human-readable size such as `"1.5GiB"`, `"3kB"` or `"0B"` into bytes
pub fn parse_size(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == UNAVAILABLE {
        return Ok(0);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| GovernorError::Parse(format!("invalid size: {value}")))?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(GovernorError::Parse(format!(
                "unknown size unit `{other}` in {value}"
            )))
        }
    };

    Ok((number * multiplier).round() as u64)
}

/// Parse `"used / total"` pairs as printed for memory, network and block I/O
pub fn parse_size_pair(value: &str) -> Result<(u64, u64)> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == UNAVAILABLE {
        return Ok((0, 0));
    }
    let (left, right) = trimmed
        .split_once('/')
        .ok_or_else(|| GovernorError::Parse(format!("expected `a / b`, got {value}")))?;
    Ok((parse_size(left)?, parse_size(right)?))
}

fn parse_pids(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| GovernorError::Parse(format!("invalid pid count: {n}"))),
        Value::String(s) if s.trim().is_empty() || s.trim() == UNAVAILABLE => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| GovernorError::Parse(format!("invalid pid count: {s}"))),
        Value::Null => Ok(0),
        other => Err(GovernorError::Parse(format!("invalid pid count: {other}"))),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Decode either a single JSON object or the first element of a JSON array
fn first_record<T: DeserializeOwned>(output: &str) -> Result<Option<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('[') {
        let mut records: Vec<T> = serde_json::from_str(trimmed)
            .map_err(|e| GovernorError::Parse(e.to_string()))?;
        return Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        });
    }
    let line = trimmed.lines().next().unwrap_or_default();
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| GovernorError::Parse(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Value,
    #[serde(default)]
    image_name: Option<String>,
    #[serde(default)]
    config: Option<InspectConfig>,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
}

/// Parse `inspect --format '{{json .}}'` output
pub fn parse_inspect(output: &str) -> Result<Option<ContainerInfo>> {
    let Some(record) = first_record::<InspectRecord>(output)? else {
        return Ok(None);
    };

    let image = record
        .config
        .and_then(|c| c.image)
        .or(record.image_name)
        .unwrap_or_default();
    let started_at = record
        .state
        .started_at
        .filter(|s| !s.is_empty() && !s.starts_with(ZERO_TIME_PREFIX));

    Ok(Some(ContainerInfo {
        id: record.id,
        name: record.name.trim_start_matches('/').to_string(),
        image,
        status: record.state.status.to_ascii_lowercase(),
        created_at: value_to_string(&record.created),
        started_at,
        exit_code: record.state.exit_code,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Names {
    One(String),
    Many(Vec<String>),
}

impl Names {
    fn first(&self) -> String {
        match self {
            Names::One(s) => s.split(',').next().unwrap_or_default().to_string(),
            Names::Many(v) => v.first().cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PsRecord {
    #[serde(rename = "ID", alias = "Id")]
    id: String,
    #[serde(rename = "Names")]
    names: Names,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: Value,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: Value,
}

/// Lifecycle status from `ps`; older engines only print the `Status` text
fn ps_status(state: &Value, status: &str) -> String {
    if let Value::String(s) = state {
        if !s.is_empty() {
            return s.to_ascii_lowercase();
        }
    }
    let status = status.to_ascii_lowercase();
    if status.starts_with("up") {
        "running".to_string()
    } else if status.starts_with("exited") {
        "exited".to_string()
    } else if status.starts_with("created") {
        "created".to_string()
    } else {
        status
    }
}

/// Parse `ps --format '{{json .}}'` output, one JSON object per line
pub fn parse_ps(output: &str) -> Result<Vec<ContainerInfo>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let record: PsRecord =
                serde_json::from_str(line).map_err(|e| GovernorError::Parse(e.to_string()))?;
            Ok(ContainerInfo {
                name: record.names.first().trim_start_matches('/').to_string(),
                status: ps_status(&record.state, &record.status),
                id: record.id,
                image: record.image,
                created_at: value_to_string(&record.created_at),
                started_at: None,
                exit_code: None,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct StatsRecord {
    #[serde(rename = "CPUPerc", alias = "cpu_percent", default)]
    cpu_percent: String,
    #[serde(rename = "MemUsage", alias = "mem_usage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", alias = "mem_percent", default)]
    mem_percent: String,
    #[serde(rename = "NetIO", alias = "net_io", default)]
    net_io: String,
    #[serde(rename = "BlockIO", alias = "block_io", default)]
    block_io: String,
    #[serde(rename = "PIDs", alias = "pids", default)]
    pids: Value,
}

/// Parse `stats --no-stream` JSON output
pub fn parse_stats(output: &str) -> Result<Option<ContainerStats>> {
    let Some(record) = first_record::<StatsRecord>(output)? else {
        return Ok(None);
    };

    let (memory_usage, memory_limit) = parse_size_pair(&record.mem_usage)?;
    let (network_rx_bytes, network_tx_bytes) = parse_size_pair(&record.net_io)?;
    let (block_read_bytes, block_write_bytes) = parse_size_pair(&record.block_io)?;

    Ok(Some(ContainerStats {
        cpu_percent: parse_percent(&record.cpu_percent)?,
        memory_usage,
        memory_limit,
        memory_percent: parse_percent(&record.mem_percent)?,
        network_rx_bytes,
        network_tx_bytes,
        block_read_bytes,
        block_write_bytes,
        pids: parse_pids(&record.pids)?,
    }))
}
