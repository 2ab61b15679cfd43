//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;
use crate::errors::SettingsError;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `settings.level`. JSON output is used
/// when `settings.json` is set.
///
/// # Errors
///
/// Returns [`SettingsError::Logging`] if the level is not a valid filter or a
/// global subscriber is already installed.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), SettingsError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| SettingsError::Logging(format!("invalid level '{}': {e}", settings.level)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(settings.include_target);

    let result = if settings.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| SettingsError::Logging(e.to_string()))
}
