/// Time utilities for epoch-millisecond open-times
use chrono::{DateTime, SecondsFormat, Utc};

use crate::data::Resolution;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render an epoch-ms timestamp for logs
pub fn format_ms(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| timestamp.to_string())
}

/// Open-time of the most recent fully closed bar at `now`
pub fn last_closed_open_time(resolution: Resolution, now: i64) -> i64 {
    resolution.prev_open_time(resolution.open_time_containing(now))
}
