//! Typed configuration: a TOML file with environment overrides.
//!
//! Every field has a default, so a missing file or an empty table is a
//! valid configuration. Overrides are applied after the file and the
//! result is validated once, failing fast on nonsense values.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub dispatcher: DispatcherSettings,
    pub retry: RetrySettings,
    pub monitor: MonitorSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSettings {
    /// Concurrent worker loops.
    pub workers: usize,
    /// Size of the executor for blocking work.
    pub blocking_threads: usize,
    /// Bound on waiting tasks; unbounded when absent.
    pub queue_capacity: Option<usize>,
    /// Deadline for tasks submitted without one.
    pub default_timeout_ms: u64,
    /// Events buffered per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            blocking_threads: 2,
            queue_capacity: None,
            default_timeout_ms: 30_000,
            event_capacity: 1024,
        }
    }
}

/// Retry policy for tasks submitted without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 1.0,
            max_retry_delay_ms: None,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            multiplier: settings.backoff_multiplier,
            max_delay: settings.max_retry_delay_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    pub interval_ms: u64,
    /// Samples kept for the moving average.
    pub window: usize,
    /// Warn when this many tasks are waiting.
    pub queue_depth_warn: Option<usize>,
    /// Warn when this many tasks are running.
    pub running_warn: Option<usize>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            window: 12,
            queue_depth_warn: Some(1_000),
            running_warn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySettings {
    pub otel_endpoint: Option<String>,
    pub service_name: String,
    pub log_level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            otel_endpoint: None,
            service_name: "taskq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply environment overrides, and
    /// validate.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Override fields from `TASKQ_*`, `OTEL_ENDPOINT`, and `LOG_LEVEL`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("TASKQ_WORKERS")? {
            self.dispatcher.workers = v;
        }
        if let Some(v) = env_parse("TASKQ_BLOCKING_THREADS")? {
            self.dispatcher.blocking_threads = v;
        }
        if let Some(v) = env_parse("TASKQ_QUEUE_CAPACITY")? {
            self.dispatcher.queue_capacity = Some(v);
        }
        if let Some(v) = env_parse("TASKQ_DEFAULT_TIMEOUT_MS")? {
            self.dispatcher.default_timeout_ms = v;
        }
        if let Some(v) = env_parse("TASKQ_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.telemetry.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;
        if d.workers == 0 {
            return Err(Error::Config("dispatcher.workers must be at least 1".into()));
        }
        if d.blocking_threads == 0 {
            return Err(Error::Config(
                "dispatcher.blocking_threads must be at least 1".into(),
            ));
        }
        if d.queue_capacity == Some(0) {
            return Err(Error::Config("dispatcher.queue_capacity must be at least 1".into()));
        }
        if d.default_timeout_ms == 0 {
            return Err(Error::Config("dispatcher.default_timeout_ms must be non-zero".into()));
        }
        RetryPolicy::from(&self.retry)
            .validate()
            .map_err(|e| Error::Config(format!("retry: {e}")))?;
        if self.monitor.interval_ms == 0 || self.monitor.window == 0 {
            return Err(Error::Config(
                "monitor.interval_ms and monitor.window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
