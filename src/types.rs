/// Core type definitions for the bar synchronizer
use serde::{Deserialize, Deserializer, Serialize};

use crate::data::Resolution;
use crate::error::{Result, SyncError};

/// OHLCV bar for one resolution window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub resolution: Resolution,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub trade_count: u64,
}

impl Bar {
    /// Bar with no trades yet: every price at `price`, all amounts zero
    pub fn flat(resolution: Resolution, open_time: i64, price: f64) -> Self {
        Bar {
            resolution,
            open_time,
            close_time: resolution.close_time(open_time),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            quote_volume: 0.0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            trade_count: 0,
        }
    }

    /// Volume-weighted average price, absent for bars without volume
    pub fn average_price(&self) -> Option<f64> {
        if self.volume > 0.0 {
            Some(self.quote_volume / self.volume)
        } else {
            None
        }
    }

    /// Reject bars no consistent feed could have produced
    pub fn validate(&self) -> Result<()> {
        let values = [
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.quote_volume,
            self.taker_buy_volume,
            self.taker_buy_quote_volume,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SyncError::InvalidBarData(format!(
                "non-finite value in {} bar @ {}",
                self.resolution, self.open_time
            )));
        }
        if self.low > self.high
            || self.open < self.low
            || self.open > self.high
            || self.close < self.low
            || self.close > self.high
        {
            return Err(SyncError::InvalidBarData(format!(
                "inconsistent OHLC in {} bar @ {}: O:{} H:{} L:{} C:{}",
                self.resolution, self.open_time, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 || self.quote_volume < 0.0 {
            return Err(SyncError::InvalidBarData(format!(
                "negative volume in {} bar @ {}",
                self.resolution, self.open_time
            )));
        }
        if self.open_time < 0 || self.close_time < self.open_time {
            return Err(SyncError::InvalidBarData(format!(
                "bad window [{}, {}] for {} bar",
                self.open_time, self.close_time, self.resolution
            )));
        }
        Ok(())
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Configuration for the synchronizer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Instrument
    pub symbol: String,
    #[serde(
        default = "default_resolutions",
        deserialize_with = "deserialize_resolutions"
    )]
    pub resolutions: Vec<Resolution>,

    // Upstream Endpoints
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    #[serde(default = "default_rate_limit_historical")]
    pub rate_limit_historical: u32,

    // Storage
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // Write Buffer
    #[serde(default = "default_write_buffer_capacity")]
    pub write_buffer_capacity: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retained_bars")]
    pub max_retained_bars: usize,

    // Backfill & Gap Scan
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_gap_scan_chunk")]
    pub gap_scan_chunk: usize,
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,

    // Retry & Supervision
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_supervisor_max_restarts")]
    pub supervisor_max_restarts: u32,
    #[serde(default = "default_supervisor_backoff_ms")]
    pub supervisor_backoff_ms: u64,
    #[serde(default = "default_supervisor_cap_ms")]
    pub supervisor_cap_ms: u64,

    // WebSocket
    #[serde(default = "default_ws_reconnect_backoff_sec")]
    pub ws_reconnect_backoff_sec: Vec<u64>,

    // Monitoring
    #[serde(default = "default_health_interval_sec")]
    pub health_interval_sec: u64,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_resolutions() -> Vec<Resolution> {
    Resolution::ALL.to_vec()
}

/// Resolution names are case-sensitive ("1m" vs "1M"), so they are read as plain
/// strings and parsed here rather than through enum variant matching.
fn deserialize_resolutions<'de, D>(deserializer: D) -> std::result::Result<Vec<Resolution>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|name| name.trim().parse::<Resolution>().map_err(serde::de::Error::custom))
        .collect()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_request_timeout_sec() -> u64 {
    30
}

fn default_rate_limit_historical() -> u32 {
    10
}

fn default_data_dir() -> String {
    "data/bars".to_string()
}

fn default_write_buffer_capacity() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_retained_bars() -> usize {
    100_000
}

fn default_page_size() -> usize {
    1000
}

fn default_gap_scan_chunk() -> usize {
    10_000
}

fn default_reconcile_interval_sec() -> u64 {
    3600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_cap_ms() -> u64 {
    10_000
}

fn default_supervisor_max_restarts() -> u32 {
    5
}

fn default_supervisor_backoff_ms() -> u64 {
    5_000
}

fn default_supervisor_cap_ms() -> u64 {
    300_000
}

fn default_ws_reconnect_backoff_sec() -> Vec<u64> {
    vec![1, 2, 4, 8, 16]
}

fn default_health_interval_sec() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}
