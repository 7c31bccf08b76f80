/// Paginated historical backfill in either direction
use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::HistoricalApi;
use crate::data::stats::PipelineStats;
use crate::data::write_buffer::WriteBufferHandle;
use crate::data::Resolution;
use crate::error::Result;
use crate::types::Bar;
use crate::utils::format_ms;

/// Pages the historical API for one resolution and feeds every row to the
/// write buffer. Replaying a span is harmless: the store ignores rows it has.
#[derive(Clone)]
pub struct Backfiller {
    resolution: Resolution,
    api: Arc<dyn HistoricalApi>,
    writer: WriteBufferHandle,
    page_size: usize,
    stats: Arc<PipelineStats>,
}

impl Backfiller {
    pub fn new(
        api: Arc<dyn HistoricalApi>,
        writer: WriteBufferHandle,
        page_size: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Backfiller {
            resolution: writer.resolution(),
            api,
            writer,
            page_size: page_size.max(1),
            stats,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch `[start, end]` (at most `limit` rows) and enqueue the result
    pub async fn fetch_span(&self, start: i64, end: i64, limit: usize) -> Result<Vec<Bar>> {
        self.stats.add_fetch_requests(1);
        let bars = self.api.fetch_range(self.resolution, start, end, limit).await?;
        // Rows outside the requested span are not ours to write
        let bars: Vec<Bar> = bars
            .into_iter()
            .filter(|b| b.resolution == self.resolution && b.open_time >= start && b.open_time <= end)
            .collect();

        self.stats.add_bars_fetched(bars.len() as u64);
        self.writer.push_batch(bars.clone())?;
        Ok(bars)
    }

    /// Fill from the bar after `from_open_time` up to, not including,
    /// `to_exclusive`. Returns the number of bars fetched.
    pub async fn forward_fill(&self, from_open_time: i64, to_exclusive: i64) -> Result<usize> {
        let res = self.resolution;
        let end_limit = to_exclusive - 1;
        let mut cursor = from_open_time;
        let mut total = 0;

        loop {
            let start = res.next_open_time(cursor);
            if start > end_limit {
                break;
            }
            let end = (res.step_from(start, self.page_size as i64) - 1).min(end_limit);

            let bars = self.fetch_span(start, end, self.page_size).await?;
            let Some(last) = bars.last().map(|b| b.open_time) else {
                break;
            };
            total += bars.len();

            if last <= cursor {
                break;
            }
            cursor = last;
            if end >= end_limit {
                break;
            }
        }

        if total > 0 {
            info!(
                resolution = %res,
                from = %format_ms(from_open_time),
                to = %format_ms(cursor),
                bars = total,
                "⏩ Forward fill complete"
            );
        }
        Ok(total)
    }

    /// Fill backwards from the bar before `from_open_time` until the venue has
    /// nothing older. Returns the number of bars fetched.
    pub async fn backward_fill(&self, from_open_time: i64) -> Result<usize> {
        let res = self.resolution;
        let mut cursor = from_open_time;
        let mut total = 0;

        loop {
            let end = res.prev_open_time(cursor);
            if end < 0 {
                break;
            }
            let start = res.step_from(cursor, -(self.page_size as i64)).max(0);
            if start > end {
                break;
            }

            let bars = self.fetch_span(start, end, self.page_size).await?;
            let Some(first) = bars.first().map(|b| b.open_time) else {
                break;
            };
            total += bars.len();

            if first >= cursor {
                break;
            }
            cursor = first;
        }

        if total > 0 {
            info!(
                resolution = %res,
                from = %format_ms(from_open_time),
                to = %format_ms(cursor),
                bars = total,
                "⏪ Backward fill complete"
            );
        } else {
            debug!(resolution = %res, from = %format_ms(from_open_time), "Nothing older to backfill");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::{BarStore, MemoryBarStore};
    use crate::testing::{spawn_writer, MockHistoricalApi};

    const M1: Resolution = Resolution::OneMinute;
    const MIN: i64 = 60_000;

    async fn setup(
        venue: std::ops::Range<i64>,
        page: usize,
    ) -> (Backfiller, Arc<MockHistoricalApi>, Arc<MemoryBarStore>, WriteBufferHandle, tokio::sync::watch::Sender<bool>) {
        let api = Arc::new(MockHistoricalApi::new());
        api.add_bars(M1, venue.map(|i| i * MIN));
        let store = Arc::new(MemoryBarStore::new());
        let (writer, shutdown) = spawn_writer(M1, store.clone());
        let filler = Backfiller::new(api.clone(), writer.clone(), page, Arc::new(PipelineStats::new()));
        (filler, api, store, writer, shutdown)
    }

    #[tokio::test]
    async fn test_forward_fill_pages_to_target() {
        let (filler, api, store, writer, _shutdown) = setup(0..100, 10).await;

        // from bar 5 up to (not including) bar 40
        let fetched = filler.forward_fill(5 * MIN, 40 * MIN).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(fetched, 34);
        assert_eq!(store.count(M1).await.unwrap(), 34);
        assert_eq!(store.first(M1).await.unwrap().unwrap().open_time, 6 * MIN);
        assert_eq!(store.last(M1).await.unwrap().unwrap().open_time, 39 * MIN);

        let calls = api.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].start, 6 * MIN);
        assert_eq!(calls[0].end, 16 * MIN - 1);
        assert_eq!(calls[3].end, 40 * MIN - 1);
    }

    #[tokio::test]
    async fn test_forward_fill_stops_when_venue_runs_dry() {
        let (filler, api, _store, _writer, _shutdown) = setup(0..12, 5).await;

        let fetched = filler.forward_fill(0, 1_000 * MIN).await.unwrap();
        assert_eq!(fetched, 11);
        // pages [1..5], [6..10], [11], then an empty page
        assert_eq!(api.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_backward_fill_reaches_history_start() {
        let (filler, api, store, writer, _shutdown) = setup(20..50, 10).await;

        let fetched = filler.backward_fill(50 * MIN).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(fetched, 30);
        assert_eq!(store.first(M1).await.unwrap().unwrap().open_time, 20 * MIN);
        assert_eq!(store.last(M1).await.unwrap().unwrap().open_time, 49 * MIN);
        // three full pages, then [10, 19] comes back empty
        assert_eq!(api.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_backward_fill_clamps_at_epoch() {
        let (filler, api, _store, _writer, _shutdown) = setup(0..3, 10).await;

        assert_eq!(filler.backward_fill(3 * MIN).await.unwrap(), 3);
        let calls = api.calls();
        assert_eq!(calls[0].start, 0);
        assert_eq!(calls[0].end, 2 * MIN);
        // cursor reached bar 0: nothing before the epoch is requested
        assert_eq!(calls.len(), 1);
    }
}
