/// Gap detection and targeted refetch
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::data::backfiller::Backfiller;
use crate::data::bar_store::BarStore;
use crate::data::stats::PipelineStats;
use crate::data::write_buffer::WriteBufferHandle;
use crate::data::Resolution;
use crate::error::Result;
use crate::utils::format_ms;

/// Maximal run of consecutive missing open-times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRun {
    pub start: i64,
    pub len: usize,
}

impl MissingRun {
    /// Open-time of the last bar in the run
    pub fn last(&self, resolution: Resolution) -> i64 {
        resolution.step_from(self.start, self.len as i64 - 1)
    }
}

/// Outcome of one scan pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub target: i64,
    /// Earliest stored open-time after the backward pass
    pub lower_bound: Option<i64>,
    pub expected: usize,
    pub missing: usize,
    pub runs: usize,
    pub fetched: usize,
    pub backfilled: usize,
}

/// Group ascending open-times into runs of consecutive bars
pub fn cluster_runs(resolution: Resolution, missing: &[i64]) -> Vec<MissingRun> {
    let mut runs: Vec<MissingRun> = Vec::new();
    let mut prev: Option<i64> = None;

    for &t in missing {
        match (runs.last_mut(), prev) {
            (Some(run), Some(p)) if resolution.next_open_time(p) == t => run.len += 1,
            _ => runs.push(MissingRun { start: t, len: 1 }),
        }
        prev = Some(t);
    }
    runs
}

pub struct GapScanner {
    backfiller: Backfiller,
    store: Arc<dyn BarStore>,
    writer: WriteBufferHandle,
    chunk_size: usize,
    stats: Arc<PipelineStats>,
}

impl GapScanner {
    pub fn new(
        backfiller: Backfiller,
        store: Arc<dyn BarStore>,
        writer: WriteBufferHandle,
        chunk_size: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        GapScanner {
            backfiller,
            store,
            writer,
            chunk_size: chunk_size.max(1),
            stats,
        }
    }

    pub fn backfiller(&self) -> &Backfiller {
        &self.backfiller
    }

    /// Make the store gapless from its earliest bar up to and including `target`.
    ///
    /// Runs a backward fill first, then walks the expected open-times in chunks
    /// and fetches exactly the missing runs. Everything fetched is flushed
    /// before returning.
    pub async fn scan(&self, target: i64) -> Result<ScanReport> {
        let res = self.backfiller.resolution();
        let mut report = ScanReport {
            target,
            ..ScanReport::default()
        };

        // Store reads must see everything already enqueued
        self.writer.flush().await?;

        let backward_from = match self.store.first(res).await? {
            Some(first) => first.open_time,
            None => res.next_open_time(target),
        };
        report.backfilled = self.backfiller.backward_fill(backward_from).await?;
        self.writer.flush().await?;

        let Some(first) = self.store.first(res).await? else {
            debug!(resolution = %res, "Store empty after backward fill, nothing to scan");
            self.stats.add_scans_completed(1);
            return Ok(report);
        };
        report.lower_bound = Some(first.open_time);

        let mut cursor = first.open_time;
        while cursor <= target {
            let expected = res.open_times(cursor, target, self.chunk_size);
            let Some(&chunk_last) = expected.last() else {
                break;
            };
            report.expected += expected.len();

            let missing = self.store.find_missing(res, &expected).await?;
            report.missing += missing.len();

            let runs = cluster_runs(res, &missing);
            report.runs += runs.len();
            for run in runs {
                report.fetched += self.fetch_run(run).await?;
            }

            let next = res.next_open_time(chunk_last);
            if next <= cursor {
                break;
            }
            cursor = next;
        }

        self.writer.flush().await?;
        self.stats.add_scans_completed(1);

        if report.missing > 0 {
            info!(
                resolution = %res,
                target = %format_ms(target),
                missing = report.missing,
                runs = report.runs,
                fetched = report.fetched,
                "🔍 Gap scan filled missing bars"
            );
        } else {
            debug!(
                resolution = %res,
                target = %format_ms(target),
                expected = report.expected,
                "Gap scan found no gaps"
            );
        }
        Ok(report)
    }

    /// One request per run, split at the page size
    async fn fetch_run(&self, run: MissingRun) -> Result<usize> {
        let res = self.backfiller.resolution();
        let page = self.backfiller.page_size();
        let mut fetched = 0;
        let mut start = run.start;
        let mut remaining = run.len;

        while remaining > 0 {
            let len = remaining.min(page);
            let end = res.step_from(start, len as i64) - 1;
            fetched += self.backfiller.fetch_span(start, end, len).await?.len();
            start = res.step_from(start, len as i64);
            remaining -= len;
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::MemoryBarStore;
    use crate::testing::{bar, spawn_writer, MockHistoricalApi};
    use crate::types::Bar;

    const M1: Resolution = Resolution::OneMinute;
    const MIN: i64 = 60_000;

    struct Fixture {
        scanner: GapScanner,
        api: Arc<MockHistoricalApi>,
        store: Arc<MemoryBarStore>,
        _shutdown: tokio::sync::watch::Sender<bool>,
    }

    fn fixture(page: usize, chunk: usize) -> Fixture {
        let api = Arc::new(MockHistoricalApi::new());
        let store = Arc::new(MemoryBarStore::new());
        let stats = Arc::new(PipelineStats::new());
        let (writer, shutdown) = spawn_writer(M1, store.clone());
        let backfiller = Backfiller::new(api.clone(), writer.clone(), page, stats.clone());
        let scanner = GapScanner::new(backfiller, store.clone(), writer, chunk, stats);
        Fixture {
            scanner,
            api,
            store,
            _shutdown: shutdown,
        }
    }

    async fn seed(store: &MemoryBarStore, times: &[i64]) {
        let bars: Vec<Bar> = times.iter().map(|t| bar(M1, *t, 1.0)).collect();
        store.insert_batch(M1, &bars).await.unwrap();
    }

    #[test]
    fn test_cluster_runs() {
        let runs = cluster_runs(M1, &[100_000, 220_000]);
        assert_eq!(
            runs,
            vec![
                MissingRun { start: 100_000, len: 1 },
                MissingRun { start: 220_000, len: 1 }
            ]
        );

        let runs = cluster_runs(M1, &[100_000, 160_000, 220_000]);
        assert_eq!(runs, vec![MissingRun { start: 100_000, len: 3 }]);
        assert_eq!(runs[0].last(M1), 220_000);

        assert!(cluster_runs(M1, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_separate_gaps_fetched_separately() {
        let f = fixture(1000, 10_000);
        seed(&f.store, &[40_000, 160_000, 280_000]).await;

        let report = f.scanner.scan(280_000).await.unwrap();

        assert_eq!(report.missing, 2);
        let calls = f.api.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].start, calls[0].end, calls[0].limit), (100_000, 159_999, 1));
        assert_eq!((calls[1].start, calls[1].end, calls[1].limit), (220_000, 279_999, 1));
    }

    #[tokio::test]
    async fn test_contiguous_gap_is_one_fetch() {
        let f = fixture(1000, 10_000);
        seed(&f.store, &[40_000, 280_000]).await;

        f.scanner.scan(280_000).await.unwrap();

        let calls = f.api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].start, calls[0].end, calls[0].limit), (100_000, 279_999, 3));
    }

    #[tokio::test]
    async fn test_scan_makes_store_complete() {
        let f = fixture(1000, 7);
        f.api.add_bars(M1, (0..50).map(|i| i * MIN));
        let seeded: Vec<i64> = (0..10).chain(20..30).map(|i| i * MIN).collect();
        seed(&f.store, &seeded).await;

        let report = f.scanner.scan(49 * MIN).await.unwrap();

        assert_eq!(report.lower_bound, Some(0));
        assert_eq!(report.expected, 50);
        assert_eq!(report.missing, 30);
        assert_eq!(report.fetched, 30);

        let rows = f.store.list_range(M1, 0, 49 * MIN).await.unwrap();
        let times: Vec<i64> = rows.iter().map(|b| b.open_time).collect();
        let expected: Vec<i64> = (0..50).map(|i| i * MIN).collect();
        assert_eq!(times, expected);
    }

    #[tokio::test]
    async fn test_long_run_split_by_page() {
        let f = fixture(4, 10_000);
        f.api.add_bars(M1, (0..11).map(|i| i * MIN));
        seed(&f.store, &[0, 10 * MIN]).await;

        let report = f.scanner.scan(10 * MIN).await.unwrap();

        assert_eq!(report.runs, 1);
        assert_eq!(report.fetched, 9);
        let limits: Vec<usize> = f.api.calls().iter().map(|c| c.limit).collect();
        assert_eq!(limits, vec![4, 4, 1]);
        assert_eq!(f.store.count(M1).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_empty_store_backfills_then_scans() {
        let f = fixture(1000, 10_000);
        f.api.add_bars(M1, (5..20).map(|i| i * MIN));

        let report = f.scanner.scan(19 * MIN).await.unwrap();

        assert_eq!(report.backfilled, 15);
        assert_eq!(report.lower_bound, Some(5 * MIN));
        assert_eq!(report.missing, 0);
        assert_eq!(f.store.count(M1).await.unwrap(), 15);
    }
}
