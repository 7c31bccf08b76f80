/// Pipeline counters and health reporting
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::data::Resolution;
use crate::utils::format_ms;

/// Lock-free counters shared by every task of one resolution pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    updates_received: AtomicU64,
    malformed_updates: AtomicU64,
    stale_updates: AtomicU64,
    bootstraps: AtomicU64,
    bars_finalized: AtomicU64,
    bars_enqueued: AtomicU64,
    bars_flushed: AtomicU64,
    bars_dropped: AtomicU64,
    flush_failures: AtomicU64,
    fetch_requests: AtomicU64,
    bars_fetched: AtomicU64,
    scans_completed: AtomicU64,
    retries: AtomicU64,
    budgets_exhausted: AtomicU64,
    supervisor_restarts: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub updates_received: u64,
    pub malformed_updates: u64,
    pub stale_updates: u64,
    pub bootstraps: u64,
    pub bars_finalized: u64,
    pub bars_enqueued: u64,
    pub bars_flushed: u64,
    pub bars_dropped: u64,
    pub flush_failures: u64,
    pub fetch_requests: u64,
    pub bars_fetched: u64,
    pub scans_completed: u64,
    pub retries: u64,
    pub budgets_exhausted: u64,
    pub supervisor_restarts: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_updates_received, updates_received);
    counter!(add_malformed_updates, malformed_updates);
    counter!(add_stale_updates, stale_updates);
    counter!(add_bootstraps, bootstraps);
    counter!(add_bars_finalized, bars_finalized);
    counter!(add_bars_enqueued, bars_enqueued);
    counter!(add_bars_flushed, bars_flushed);
    counter!(add_bars_dropped, bars_dropped);
    counter!(add_flush_failures, flush_failures);
    counter!(add_fetch_requests, fetch_requests);
    counter!(add_bars_fetched, bars_fetched);
    counter!(add_scans_completed, scans_completed);
    counter!(add_retries, retries);
    counter!(add_budgets_exhausted, budgets_exhausted);
    counter!(add_supervisor_restarts, supervisor_restarts);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            updates_received: self.updates_received.load(Ordering::Relaxed),
            malformed_updates: self.malformed_updates.load(Ordering::Relaxed),
            stale_updates: self.stale_updates.load(Ordering::Relaxed),
            bootstraps: self.bootstraps.load(Ordering::Relaxed),
            bars_finalized: self.bars_finalized.load(Ordering::Relaxed),
            bars_enqueued: self.bars_enqueued.load(Ordering::Relaxed),
            bars_flushed: self.bars_flushed.load(Ordering::Relaxed),
            bars_dropped: self.bars_dropped.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            bars_fetched: self.bars_fetched.load(Ordering::Relaxed),
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            budgets_exhausted: self.budgets_exhausted.load(Ordering::Relaxed),
            supervisor_restarts: self.supervisor_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Health of one resolution pipeline
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub resolution: Resolution,
    pub last_stored: Option<String>,
    pub last_closed: String,
    /// Closed bars not yet persisted at the head of the series; `None` when nothing is stored
    pub lag_bars: Option<u64>,
    pub stats: StatsSnapshot,
}

impl HealthReport {
    pub fn new(
        resolution: Resolution,
        last_stored_open_time: Option<i64>,
        last_closed_open_time: i64,
        stats: StatsSnapshot,
    ) -> Self {
        HealthReport {
            resolution,
            last_stored: last_stored_open_time.map(format_ms),
            last_closed: format_ms(last_closed_open_time),
            lag_bars: last_stored_open_time
                .map(|last| bars_between(resolution, last, last_closed_open_time)),
            stats,
        }
    }

    /// Caught up with the wall clock and nothing was lost
    pub fn is_healthy(&self) -> bool {
        self.lag_bars == Some(0) && self.stats.bars_dropped == 0
    }
}

/// Number of whole steps from `from` forward to `to` (0 when `to <= from`)
pub fn bars_between(resolution: Resolution, from: i64, to: i64) -> u64 {
    if to <= from {
        return 0;
    }
    match resolution {
        Resolution::OneMonth => {
            let mut steps = 0u64;
            let mut cursor = from;
            while cursor < to {
                let next = resolution.next_open_time(cursor);
                if next <= cursor {
                    break;
                }
                cursor = next;
                steps += 1;
            }
            steps
        }
        _ => ((to - from) / resolution.duration_ms()) as u64,
    }
}
