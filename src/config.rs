//! # Configuration
//!
//! Collector and dump settings. Every field has a production default; the
//! agent binary layers `FLOW_STATS_*` environment overrides on top.
//!
//! | Variable                              | Field                         |
//! |---------------------------------------|-------------------------------|
//! | `FLOW_STATS_AGE_TIMEOUT_SECS`         | `age_timeout`                 |
//! | `FLOW_STATS_EXPORT_INTERVAL_SECS`     | `export_interval`             |
//! | `FLOW_STATS_METRICS_INTERVAL_SECS`    | `metrics_interval`            |
//! | `FLOW_STATS_CONNTRACK_INTERVAL_SECS`  | `conntrack_interval`          |
//! | `FLOW_STATS_INITIAL_EXPORT_DELAY_SECS`| `initial_export_delay`        |
//! | `FLOW_STATS_QUEUE_CAPACITY`           | `queue_capacity`              |
//! | `FLOW_STATS_EXPORT_CAPACITY`          | `export_capacity`             |
//! | `FLOW_STATS_DUMP_PATH`                | `dump.path`                   |
//! | `FLOW_STATS_DUMP_ROTATE_BYTES`        | `dump.rotation` (0 = never)   |
//! | `FLOW_STATS_DUMP_COMPRESS`            | `dump.compress_rotated`       |
//! | `FLOW_STATS_DUMP_MAX_FILES`           | `dump.max_rotated_files`      |
//! | `FLOW_STATS_DUMP_MAX_ENTRIES`         | `dump.max_entries`            |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FlowError;

const ENV_PREFIX: &str = "FLOW_STATS_";

/// Upper bound for every duration setting (one week).
const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound for channel capacities.
const MAX_CAPACITY: usize = 1 << 20;

/// File rotation policy for the diagnostic dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Rotate when file exceeds size (bytes)
    BySize(u64),

    /// Rotate every N seconds
    ByTime(u64),

    /// No rotation
    Never,
}

/// Diagnostic dump configuration
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Dump file path; rotated files live beside it
    pub path: PathBuf,

    /// Rotation policy
    pub rotation: RotationPolicy,

    /// Enable compression for rotated dumps
    pub compress_rotated: bool,

    /// Maximum number of rotated files to keep
    pub max_rotated_files: usize,

    /// Maximum records written per dump
    pub max_entries: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            path: PathBuf::from("/var/log/flow-stats/stats.log"),
            rotation: RotationPolicy::BySize(10 * 1024 * 1024), // 10 MiB
            compress_rotated: true,
            max_rotated_files: 5,
            max_entries: 10_000,
        }
    }
}

/// Collector and adapter configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Idle time after which a flow record expires
    pub age_timeout: Duration,

    /// Period of the active-timeout export tick
    pub export_interval: Duration,

    /// Period of the deny metrics aggregation tick
    pub metrics_interval: Duration,

    /// Period of conntrack snapshot polling
    pub conntrack_interval: Duration,

    /// Records younger than this are not exported on export ticks
    pub initial_export_delay: Duration,

    /// Capacity of each adapter queue and of the collector inbox
    pub queue_capacity: usize,

    /// Capacity of the export record channel
    pub export_capacity: usize,

    pub dump: DumpConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            age_timeout: Duration::from_secs(10),
            export_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(5),
            conntrack_interval: Duration::from_secs(5),
            initial_export_delay: Duration::ZERO,
            queue_capacity: 1000,
            export_capacity: 1000,
            dump: DumpConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Defaults overridden by `FLOW_STATS_*` environment variables.
    pub fn from_env() -> Result<Self, FlowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = CollectorConfig::default();

        if let Some(v) = get("AGE_TIMEOUT_SECS") {
            config.age_timeout = secs("AGE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("EXPORT_INTERVAL_SECS") {
            config.export_interval = secs("EXPORT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("METRICS_INTERVAL_SECS") {
            config.metrics_interval = secs("METRICS_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("CONNTRACK_INTERVAL_SECS") {
            config.conntrack_interval = secs("CONNTRACK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("INITIAL_EXPORT_DELAY_SECS") {
            let secs = bounded("INITIAL_EXPORT_DELAY_SECS", parse("INITIAL_EXPORT_DELAY_SECS", &v)?, MAX_DURATION_SECS)?;
            config.initial_export_delay = Duration::from_secs(secs);
        }
        if let Some(v) = get("QUEUE_CAPACITY") {
            config.queue_capacity = bounded("QUEUE_CAPACITY", positive("QUEUE_CAPACITY", &v)?, MAX_CAPACITY)?;
        }
        if let Some(v) = get("EXPORT_CAPACITY") {
            config.export_capacity = bounded("EXPORT_CAPACITY", positive("EXPORT_CAPACITY", &v)?, MAX_CAPACITY)?;
        }
        if let Some(v) = get("DUMP_PATH") {
            config.dump.path = PathBuf::from(v);
        }
        if let Some(v) = get("DUMP_ROTATE_BYTES") {
            config.dump.rotation = match parse::<u64>("DUMP_ROTATE_BYTES", &v)? {
                0 => RotationPolicy::Never,
                bytes => RotationPolicy::BySize(bytes),
            };
        }
        if let Some(v) = get("DUMP_COMPRESS") {
            config.dump.compress_rotated = parse("DUMP_COMPRESS", &v)?;
        }
        if let Some(v) = get("DUMP_MAX_FILES") {
            config.dump.max_rotated_files = parse("DUMP_MAX_FILES", &v)?;
        }
        if let Some(v) = get("DUMP_MAX_ENTRIES") {
            config.dump.max_entries = parse("DUMP_MAX_ENTRIES", &v)?;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, FlowError> {
    value
        .trim()
        .parse()
        .map_err(|_| FlowError::Config(format!("{}{}: invalid value {:?}", ENV_PREFIX, name, value)))
}

/// Tokio intervals panic on a zero period, and deadlines overflow `Instant`
/// on huge ones.
fn secs(name: &str, value: &str) -> Result<Duration, FlowError> {
    let secs = bounded(name, positive(name, value)?, MAX_DURATION_SECS)?;
    Ok(Duration::from_secs(secs))
}

fn bounded<T: PartialOrd + fmt::Display>(name: &str, value: T, max: T) -> Result<T, FlowError> {
    if value > max {
        return Err(FlowError::Config(format!(
            "{}{}: must be at most {}",
            ENV_PREFIX, name, max
        )));
    }
    Ok(value)
}

fn positive<T: FromStr + Default + PartialEq>(name: &str, value: &str) -> Result<T, FlowError> {
    let parsed: T = parse(name, value)?;
    if parsed == T::default() {
        return Err(FlowError::Config(format!(
            "{}{}: must be greater than zero",
            ENV_PREFIX, name
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_collector_config_defaults() {
        let config = CollectorConfig::default();
        assert_eq!(config.age_timeout.as_secs(), 10);
        assert_eq!(config.export_interval.as_secs(), 10);
        assert_eq!(config.metrics_interval.as_secs(), 5);
        assert_eq!(config.conntrack_interval.as_secs(), 5);
        assert_eq!(config.initial_export_delay, Duration::ZERO);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.dump.rotation, RotationPolicy::BySize(10 * 1024 * 1024));
        assert_eq!(config.dump.max_rotated_files, 5);
        assert_eq!(config.dump.max_entries, 10_000);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CollectorConfig::from_lookup(lookup(&[
            ("FLOW_STATS_AGE_TIMEOUT_SECS", "30"),
            ("FLOW_STATS_DUMP_PATH", "/tmp/flows.log"),
            ("FLOW_STATS_DUMP_ROTATE_BYTES", "0"),
            ("FLOW_STATS_DUMP_COMPRESS", "false"),
        ]))
        .unwrap();

        assert_eq!(config.age_timeout.as_secs(), 30);
        assert_eq!(config.dump.path, PathBuf::from("/tmp/flows.log"));
        assert_eq!(config.dump.rotation, RotationPolicy::Never);
        assert!(!config.dump.compress_rotated);
        assert_eq!(config.export_interval.as_secs(), 10);
    }

    #[test]
    fn test_from_lookup_rejects_invalid() {
        let err = CollectorConfig::from_lookup(lookup(&[("FLOW_STATS_QUEUE_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));

        let err = CollectorConfig::from_lookup(lookup(&[("FLOW_STATS_EXPORT_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_from_lookup_rejects_out_of_range() {
        for (name, value) in [
            ("FLOW_STATS_AGE_TIMEOUT_SECS", "18446744073709551615"),
            ("FLOW_STATS_METRICS_INTERVAL_SECS", "604801"),
            ("FLOW_STATS_INITIAL_EXPORT_DELAY_SECS", "99999999999"),
            ("FLOW_STATS_QUEUE_CAPACITY", "18446744073709551615"),
        ] {
            let err = CollectorConfig::from_lookup(lookup(&[(name, value)])).unwrap_err();
            assert!(matches!(err, FlowError::Config(ref msg) if msg.contains("at most")), "{}: {:?}", name, err);
        }

        let config = CollectorConfig::from_lookup(lookup(&[("FLOW_STATS_AGE_TIMEOUT_SECS", "604800")])).unwrap();
        assert_eq!(config.age_timeout, Duration::from_secs(604_800));
    }
}
