//! Runtime configuration.
//!
//! Configuration is assembled from defaults, an optional `.env` file and
//! `CHOPPER_*` environment variables, in that order of precedence (later wins).

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ingest::FileCacheConfig;
use crate::monitor::MonitorSchedulerConfig;
use crate::task::TaskCenterConfig;
use crate::{Error, Result};

/// Prefix shared by every environment override.
const ENV_PREFIX: &str = "CHOPPER_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChopperConfig {
    /// Root directory for ingested data.
    pub data_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// File cache settings.
    pub file_cache: FileCacheConfig,
    /// Monitor scheduler settings.
    pub monitor: MonitorSchedulerConfig,
    /// Task center settings.
    pub task_center: TaskCenterConfig,
}

impl Default for ChopperConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./logs"),
            file_cache: FileCacheConfig::default(),
            monitor: MonitorSchedulerConfig::default(),
            task_center: TaskCenterConfig::default(),
        }
    }
}

impl ChopperConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        Ok(config)
    }

    /// Parse configuration from a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("Invalid config: {}", e)))
    }

    /// Apply overrides from a key lookup (keys are given without the prefix).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_override(&lookup, "FLUSH_THRESHOLD_BYTES")? {
            self.file_cache.flush_threshold_bytes = v;
        }
        if let Some(v) = parse_override(&lookup, "MONITOR_PERIOD_MS")? {
            self.monitor.period_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "MONITOR_INITIAL_DELAY_MS")? {
            self.monitor.initial_delay_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "MONITOR_MAX_CONCURRENT")? {
            self.monitor.max_concurrent = v;
        }
        if let Some(v) = parse_override(&lookup, "MAX_CONCURRENT_TASKS")? {
            self.task_center.max_concurrent_tasks = v;
        }
        if let Some(v) = parse_override(&lookup, "SHUTDOWN_TIMEOUT_SECS")? {
            self.task_center.shutdown_timeout_secs = v;
        }
        self.validate()
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.period_ms == 0 {
            return Err(Error::config("monitor period must be greater than zero"));
        }
        if self.monitor.max_concurrent == 0 {
            return Err(Error::config("monitor pool needs at least one slot"));
        }
        if self.task_center.max_concurrent_tasks == 0 {
            return Err(Error::config("task center needs at least one slot"));
        }
        Ok(())
    }

    /// Directory barrage partitions are written under.
    pub fn barrage_dir(&self) -> PathBuf {
        self.data_dir.join("barrage")
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw.trim().parse::<T>().map_err(|e| {
                Error::config(format!("{ENV_PREFIX}{key}={raw:?} is not valid: {e}"))
            })?;
            debug!(key = %key, value = %raw, "Applied config override");
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
