//! Environment variable overrides.
//!
//! | Variable | Field |
//! |---|---|
//! | `DENTALFLOW_WORKER_CONCURRENCY` | `worker.concurrency` |
//! | `DENTALFLOW_TASK_TIME_LIMIT_SECS` | `worker.task_time_limit_secs` |
//! | `DENTALFLOW_MAX_RETRIES` | `retry.max_retries` |
//! | `DENTALFLOW_CACHE_DIR` | `cache.dir` |
//! | `DENTALFLOW_CACHE_TTL_SECS` | `cache.ttl_secs` |
//! | `DENTALFLOW_LOG_LEVEL` | `logging.level` |
//! | `DENTALFLOW_LOG_JSON` | `logging.json` |

use std::path::PathBuf;
use std::str::FromStr;

use super::EngineConfig;
use crate::errors::SettingsError;

/// Worker concurrency.
pub const WORKER_CONCURRENCY: &str = "DENTALFLOW_WORKER_CONCURRENCY";
/// Per-attempt time limit in seconds.
pub const TASK_TIME_LIMIT_SECS: &str = "DENTALFLOW_TASK_TIME_LIMIT_SECS";
/// Default retry budget.
pub const MAX_RETRIES: &str = "DENTALFLOW_MAX_RETRIES";
/// Filesystem cache directory.
pub const CACHE_DIR: &str = "DENTALFLOW_CACHE_DIR";
/// Cache TTL in seconds.
pub const CACHE_TTL_SECS: &str = "DENTALFLOW_CACHE_TTL_SECS";
/// Log filter.
pub const LOG_LEVEL: &str = "DENTALFLOW_LOG_LEVEL";
/// JSON log output.
pub const LOG_JSON: &str = "DENTALFLOW_LOG_JSON";

fn parse<T: FromStr>(var: &str, raw: &str) -> Result<T, SettingsError> {
    raw.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        var: var.to_string(),
        value: raw.to_string(),
    })
}

fn parse_bool(var: &str, raw: &str) -> Result<bool, SettingsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidEnv {
            var: var.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Applies overrides using `lookup` to read variables.
///
/// # Errors
///
/// Returns [`SettingsError::InvalidEnv`] for the first unparsable value.
pub fn apply_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<(), SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(WORKER_CONCURRENCY) {
        config.worker.concurrency = parse(WORKER_CONCURRENCY, &raw)?;
    }
    if let Some(raw) = lookup(TASK_TIME_LIMIT_SECS) {
        config.worker.task_time_limit_secs = parse(TASK_TIME_LIMIT_SECS, &raw)?;
    }
    if let Some(raw) = lookup(MAX_RETRIES) {
        config.retry.max_retries = parse(MAX_RETRIES, &raw)?;
    }
    if let Some(raw) = lookup(CACHE_DIR) {
        let trimmed = raw.trim();
        config.cache.dir = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
    }
    if let Some(raw) = lookup(CACHE_TTL_SECS) {
        config.cache.ttl_secs = parse(CACHE_TTL_SECS, &raw)?;
    }
    if let Some(raw) = lookup(LOG_LEVEL) {
        config.logging.level = raw.trim().to_string();
    }
    if let Some(raw) = lookup(LOG_JSON) {
        config.logging.json = parse_bool(LOG_JSON, &raw)?;
    }
    Ok(())
}
