//! Configuration for the batch processor.
//!
//! Values come from code (`with_*` setters), from serde, or from the
//! `OTEL_BSP_*` environment variables. Environment values that fail to parse
//! are ignored with a warning and the default is kept.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const ENV_MAX_QUEUE_SIZE: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
pub const ENV_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";
pub const ENV_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
pub const ENV_EXPORT_TIMEOUT: &str = "OTEL_BSP_EXPORT_TIMEOUT";

const DEFAULT_MAX_QUEUE_SIZE: usize = 2048;
const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Rejected configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_queue_size must be greater than zero")]
    ZeroQueueSize,
    #[error("schedule_delay must be greater than zero")]
    ZeroScheduleDelay,
    #[error("max_export_batch_size must be in 1..={max_queue_size}, got {batch_size}")]
    InvalidBatchSize {
        batch_size: usize,
        max_queue_size: usize,
    },
}

/// Batch processor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Ring capacity. Items arriving while the ring is full are dropped.
    ///
    /// Default: 2048
    pub max_queue_size: usize,

    /// Interval between two periodic exports.
    ///
    /// Default: 5s
    pub schedule_delay: Duration,

    /// Upper bound on items per periodic export. Forced flushes ignore it.
    ///
    /// Default: 512
    pub max_export_batch_size: usize,

    /// Budget for the exporter shutdown performed on drop. Exports that run
    /// longer are reported as a stalled pipeline.
    ///
    /// Default: 3s
    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            schedule_delay: DEFAULT_SCHEDULE_DELAY,
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
        }
    }
}

impl BatchConfig {
    /// Defaults overridden by the `OTEL_BSP_*` process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `OTEL_BSP_*` key.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = read(&lookup, ENV_MAX_QUEUE_SIZE, parse_count) {
            config.max_queue_size = v;
        }
        if let Some(v) = read(&lookup, ENV_SCHEDULE_DELAY, parse_positive_duration) {
            config.schedule_delay = v;
        }
        if let Some(v) = read(&lookup, ENV_MAX_EXPORT_BATCH_SIZE, parse_count) {
            config.max_export_batch_size = v;
        }
        if let Some(v) = read(&lookup, ENV_EXPORT_TIMEOUT, parse_duration) {
            config.export_timeout = v;
        }

        config
    }

    /// Checks the relationships between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.schedule_delay.is_zero() {
            return Err(ConfigError::ZeroScheduleDelay);
        }
        if self.max_export_batch_size == 0 || self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::InvalidBatchSize {
                batch_size: self.max_export_batch_size,
                max_queue_size: self.max_queue_size,
            });
        }
        Ok(())
    }

    /// Sets the ring capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the periodic export interval.
    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }

    /// Sets the periodic export batch cap.
    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    /// Sets the export timeout.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }
}

fn read<F, T>(lookup: &F, key: &str, parse: fn(&str) -> Option<T>) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid batch processor setting");
    }
    parsed
}

fn parse_count(s: &str) -> Option<usize> {
    s.parse::<usize>().ok().filter(|&n| n > 0)
}

fn parse_positive_duration(s: &str) -> Option<Duration> {
    parse_duration(s).filter(|d| !d.is_zero())
}

/// Parses `<digits><unit>` where unit is one of `ns`, `us`, `ms`, `s`, `m`,
/// `h`. No unit means milliseconds.
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let value: u64 = digits.parse().ok()?;

    match unit {
        "ns" => Some(Duration::from_nanos(value)),
        "us" => Some(Duration::from_micros(value)),
        "" | "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
