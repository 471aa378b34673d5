//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG`, when set, takes precedence over the configured level.

use crate::config::ApplicationSettings;
use crate::error::{AppResult, CaptureError};
use tracing_subscriber::EnvFilter;

/// Build the filter from `RUST_LOG`, falling back to `level` for this crate.
pub fn env_filter(level: &str) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,sync_capture={level}"))
        .map_err(|e| CaptureError::Configuration(format!("invalid log level '{level}': {e}")))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(settings: &ApplicationSettings) -> AppResult<()> {
    let filter = env_filter(&settings.log_level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if settings.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| CaptureError::Configuration(format!("logging already initialized: {e}")))
}
