/// Bar resolutions and open-time arithmetic
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Weekly bars open on Monday 00:00 UTC; the epoch fell on a Thursday.
const WEEK_OFFSET_MS: i64 = 4 * DAY_MS;

/// Supported bar widths. Closed set: every per-resolution table in the crate is a
/// fixed-size array indexed by [`Resolution::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Resolution {
    pub const COUNT: usize = 15;

    pub const ALL: [Resolution; Resolution::COUNT] = [
        Resolution::OneMinute,
        Resolution::ThreeMinutes,
        Resolution::FiveMinutes,
        Resolution::FifteenMinutes,
        Resolution::ThirtyMinutes,
        Resolution::OneHour,
        Resolution::TwoHours,
        Resolution::FourHours,
        Resolution::SixHours,
        Resolution::EightHours,
        Resolution::TwelveHours,
        Resolution::OneDay,
        Resolution::ThreeDays,
        Resolution::OneWeek,
        Resolution::OneMonth,
    ];

    /// Slot of this resolution in per-resolution arrays
    pub fn index(self) -> usize {
        self as usize
    }

    /// Wire name, shared by the REST and stream APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::ThreeMinutes => "3m",
            Resolution::FiveMinutes => "5m",
            Resolution::FifteenMinutes => "15m",
            Resolution::ThirtyMinutes => "30m",
            Resolution::OneHour => "1h",
            Resolution::TwoHours => "2h",
            Resolution::FourHours => "4h",
            Resolution::SixHours => "6h",
            Resolution::EightHours => "8h",
            Resolution::TwelveHours => "12h",
            Resolution::OneDay => "1d",
            Resolution::ThreeDays => "3d",
            Resolution::OneWeek => "1w",
            Resolution::OneMonth => "1M",
        }
    }

    /// Persistence table identifier
    pub fn table_name(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "min_1",
            Resolution::ThreeMinutes => "min_3",
            Resolution::FiveMinutes => "min_5",
            Resolution::FifteenMinutes => "min_15",
            Resolution::ThirtyMinutes => "min_30",
            Resolution::OneHour => "hour_1",
            Resolution::TwoHours => "hour_2",
            Resolution::FourHours => "hour_4",
            Resolution::SixHours => "hour_6",
            Resolution::EightHours => "hour_8",
            Resolution::TwelveHours => "hour_12",
            Resolution::OneDay => "day_1",
            Resolution::ThreeDays => "day_3",
            Resolution::OneWeek => "week_1",
            Resolution::OneMonth => "month_1",
        }
    }

    /// Nominal bar width. `1M` reports 30 days; stepping uses calendar months.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Resolution::OneMinute => MINUTE_MS,
            Resolution::ThreeMinutes => 3 * MINUTE_MS,
            Resolution::FiveMinutes => 5 * MINUTE_MS,
            Resolution::FifteenMinutes => 15 * MINUTE_MS,
            Resolution::ThirtyMinutes => 30 * MINUTE_MS,
            Resolution::OneHour => HOUR_MS,
            Resolution::TwoHours => 2 * HOUR_MS,
            Resolution::FourHours => 4 * HOUR_MS,
            Resolution::SixHours => 6 * HOUR_MS,
            Resolution::EightHours => 8 * HOUR_MS,
            Resolution::TwelveHours => 12 * HOUR_MS,
            Resolution::OneDay => DAY_MS,
            Resolution::ThreeDays => 3 * DAY_MS,
            Resolution::OneWeek => WEEK_MS,
            Resolution::OneMonth => 30 * DAY_MS,
        }
    }

    /// Open-time `steps` bars away from `open_time` (negative steps go back)
    pub fn step_from(&self, open_time: i64, steps: i64) -> i64 {
        match self {
            Resolution::OneMonth => shift_months(open_time, steps),
            _ => open_time.saturating_add(steps.saturating_mul(self.duration_ms())),
        }
    }

    pub fn next_open_time(&self, open_time: i64) -> i64 {
        self.step_from(open_time, 1)
    }

    pub fn prev_open_time(&self, open_time: i64) -> i64 {
        self.step_from(open_time, -1)
    }

    /// Last millisecond covered by the bar opening at `open_time`
    pub fn close_time(&self, open_time: i64) -> i64 {
        self.next_open_time(open_time) - 1
    }

    /// Open-time of the bar whose window contains `timestamp`
    pub fn open_time_containing(&self, timestamp: i64) -> i64 {
        match self {
            Resolution::OneMonth => DateTime::<Utc>::from_timestamp_millis(timestamp)
                .and_then(|dt| Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0).single())
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(timestamp),
            Resolution::OneWeek => {
                timestamp - (timestamp - WEEK_OFFSET_MS).rem_euclid(WEEK_MS)
            }
            _ => timestamp - timestamp.rem_euclid(self.duration_ms()),
        }
    }

    /// Up to `max` consecutive open-times starting at `from`, none later than `to`
    pub fn open_times(&self, from: i64, to: i64, max: usize) -> Vec<i64> {
        let mut times = Vec::with_capacity(max.min(16_384));
        let mut current = from;
        while current <= to && times.len() < max {
            times.push(current);
            let next = self.next_open_time(current);
            if next <= current {
                break;
            }
            current = next;
        }
        times
    }
}

fn shift_months(open_time: i64, months: i64) -> i64 {
    let Some(dt) = DateTime::<Utc>::from_timestamp_millis(open_time) else {
        return open_time;
    };
    let count = Months::new(u32::try_from(months.unsigned_abs()).unwrap_or(u32::MAX));
    let shifted = if months >= 0 {
        dt.checked_add_months(count)
    } else {
        dt.checked_sub_months(count)
    };
    shifted.map(|d| d.timestamp_millis()).unwrap_or(open_time)
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| SyncError::UnknownResolution(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, res) in Resolution::ALL.iter().enumerate() {
            assert_eq!(res.index(), i);
        }
    }

    #[test]
    fn test_parse_roundtrip_names() {
        assert_eq!("15m".parse::<Resolution>().unwrap(), Resolution::FifteenMinutes);
        assert_eq!("1M".parse::<Resolution>().unwrap(), Resolution::OneMonth);
        assert!("2m".parse::<Resolution>().is_err());
        assert_eq!(Resolution::TwelveHours.table_name(), "hour_12");
    }

    #[test]
    fn test_fixed_stepping() {
        let res = Resolution::OneMinute;
        assert_eq!(res.next_open_time(1_000), 61_000);
        assert_eq!(res.step_from(1_000, -2), -119_000);
        assert_eq!(res.close_time(0), 59_999);
    }

    #[test]
    fn test_monthly_steps_by_calendar() {
        let res = Resolution::OneMonth;
        let jan = ms(2024, 1, 1);
        assert_eq!(res.next_open_time(jan), ms(2024, 2, 1));
        assert_eq!(res.step_from(jan, 2), ms(2024, 3, 1));
        assert_eq!(res.prev_open_time(jan), ms(2023, 12, 1));
        // February 2024 has 29 days
        assert_eq!(res.close_time(ms(2024, 2, 1)), ms(2024, 3, 1) - 1);
    }

    #[test]
    fn test_open_time_containing() {
        let ts = ms(2024, 5, 15) + 3 * HOUR_MS + 17 * MINUTE_MS + 5_000;
        assert_eq!(
            Resolution::FifteenMinutes.open_time_containing(ts),
            ms(2024, 5, 15) + 3 * HOUR_MS + 15 * MINUTE_MS
        );
        assert_eq!(Resolution::OneMonth.open_time_containing(ts), ms(2024, 5, 1));
        // 2024-05-13 is a Monday
        assert_eq!(Resolution::OneWeek.open_time_containing(ts), ms(2024, 5, 13));
    }

    #[test]
    fn test_open_times_bounded() {
        let res = Resolution::OneMinute;
        let times = res.open_times(0, 300_000, 10_000);
        assert_eq!(times.len(), 6);
        assert_eq!(*times.last().unwrap(), 300_000);

        let capped = res.open_times(0, 300_000, 4);
        assert_eq!(capped, vec![0, 60_000, 120_000, 180_000]);

        assert!(res.open_times(10, 5, 100).is_empty());
    }
}
