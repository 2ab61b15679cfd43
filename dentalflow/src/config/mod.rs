//! Engine configuration.
//!
//! Settings are read from a JSON document with per-field defaults, then
//! overridden from `DENTALFLOW_*` environment variables (see [`env`]).

pub mod env;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::SweepSettings;
use crate::errors::SettingsError;
use crate::worker::RetryPolicy;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of concurrent task loops.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard wall-clock limit per job attempt, in seconds.
    #[serde(default = "default_task_time_limit")]
    pub task_time_limit_secs: u64,
    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Interval between heartbeats of a running job, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// A processing job without a heartbeat for this long is stale, in seconds.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_task_time_limit() -> u64 {
    30 * 60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    5 * 60
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_time_limit_secs: default_task_time_limit(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl WorkerSettings {
    /// Per-attempt time limit.
    #[must_use]
    pub fn task_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit_secs)
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Stale-claim deadline.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Step cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Directory for the filesystem store. `None` keeps the cache in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Default entry TTL, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// How long past its last access an expired entry survives, in seconds.
    #[serde(default = "default_eviction_grace")]
    pub eviction_grace_secs: u64,
    /// Time between eviction sweeps, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_eviction_grace() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: default_cache_ttl(),
            eviction_grace_secs: default_eviction_grace(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheSettings {
    /// Default entry TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep schedule.
    #[must_use]
    pub fn sweep(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(self.sweep_interval_secs),
            grace: Duration::from_secs(self.eviction_grace_secs),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Include the event target (module path).
    #[serde(default = "default_include_target")]
    pub include_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include_target() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            include_target: default_include_target(),
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool.
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Retry and backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Step cache.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Parses settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Io`] or [`SettingsError::Parse`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Defaults, overridden from the process environment, then validated.
    ///
    /// # Errors
    ///
    /// Returns the first bad override or validation failure.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DENTALFLOW_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidEnv`] for unparsable values.
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        env::apply_overrides(self, |name| std::env::var(name).ok())
    }

    /// Rejects inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: &str| Err(SettingsError::Invalid(msg.to_string()));
        if self.worker.concurrency == 0 {
            return invalid("worker.concurrency must be at least 1");
        }
        if self.worker.task_time_limit_secs == 0 {
            return invalid("worker.task_time_limit_secs must be positive");
        }
        if self.worker.heartbeat_interval_secs == 0 {
            return invalid("worker.heartbeat_interval_secs must be positive");
        }
        if self.worker.stale_after_secs <= self.worker.heartbeat_interval_secs {
            return invalid("worker.stale_after_secs must exceed the heartbeat interval");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be positive");
        }
        if self.cache.sweep_interval_secs == 0 {
            return invalid("cache.sweep_interval_secs must be positive");
        }
        Ok(())
    }
}
