/// Tracing subscriber setup for the binaries
use tracing_subscriber::EnvFilter;

use crate::error::{Result, SyncError};
use crate::types::{Config, LogFormat};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| SyncError::ConfigError(format!("bad log_level '{}': {}", config.log_level, e)))?;

    let installed = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
    installed.map_err(|e| SyncError::InternalError(format!("tracing already initialised: {}", e)))
}
