/// Configuration loading from TOML file with `BARSYNC_` environment overrides
use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};

use crate::error::{Result, SyncError};
use crate::types::Config;

const ENV_PREFIX: &str = "BARSYNC";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let settings = config::Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(true))
        .add_source(env_source())
        .build()
        .map_err(|e| SyncError::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;

    finish(settings)
}

/// Load from an in-memory TOML document (environment overrides still apply)
pub fn load_config_str(content: &str) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(File::from_str(content, FileFormat::Toml))
        .add_source(env_source())
        .build()?;

    finish(settings)
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("resolutions")
        .with_list_parse_key("ws_reconnect_backoff_sec")
}

fn finish(settings: config::Config) -> Result<Config> {
    let mut config: Config = settings
        .try_deserialize()
        .map_err(|e| SyncError::ConfigError(format!("Failed to parse config: {}", e)))?;

    config.symbol = config.symbol.trim().to_uppercase();

    // Keep the first occurrence of each resolution
    let mut seen = HashSet::new();
    config.resolutions.retain(|r| seen.insert(*r));

    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.symbol.is_empty() {
        return Err(SyncError::ConfigError("symbol is empty".to_string()));
    }

    if config.resolutions.is_empty() {
        return Err(SyncError::ConfigError("no resolutions configured".to_string()));
    }

    if config.write_buffer_capacity == 0 {
        return Err(SyncError::ConfigError("write_buffer_capacity must be > 0".to_string()));
    }

    if config.max_retained_bars < config.write_buffer_capacity {
        return Err(SyncError::ConfigError(format!(
            "max_retained_bars ({}) must be >= write_buffer_capacity ({})",
            config.max_retained_bars, config.write_buffer_capacity
        )));
    }

    if config.flush_interval_ms == 0 {
        return Err(SyncError::ConfigError("flush_interval_ms must be > 0".to_string()));
    }

    // The klines endpoint serves at most 1000 rows per request
    if config.page_size == 0 || config.page_size > 1000 {
        return Err(SyncError::ConfigError(format!(
            "Invalid page_size: {} (expected 1..=1000)",
            config.page_size
        )));
    }

    if config.gap_scan_chunk == 0 {
        return Err(SyncError::ConfigError("gap_scan_chunk must be > 0".to_string()));
    }

    if config.retry_attempts == 0 {
        return Err(SyncError::ConfigError("retry_attempts must be >= 1".to_string()));
    }

    if config.retry_cap_ms < config.retry_backoff_ms
        || config.supervisor_cap_ms < config.supervisor_backoff_ms
    {
        return Err(SyncError::ConfigError(
            "backoff caps must be >= their base delays".to_string(),
        ));
    }

    if config.rate_limit_historical == 0 {
        return Err(SyncError::ConfigError("rate_limit_historical must be > 0".to_string()));
    }

    Ok(())
}
