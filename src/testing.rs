/// Shared fakes for unit tests
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::broker::HistoricalApi;
use crate::data::bar_store::{BarStore, MemoryBarStore};
use crate::data::stats::PipelineStats;
use crate::data::trigger_registry::Triggers;
use crate::data::write_buffer::{WriteBuffer, WriteBufferConfig, WriteBufferHandle};
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::Bar;

/// Valid bar with one unit of volume traded at `price`
pub fn bar(resolution: Resolution, open_time: i64, price: f64) -> Bar {
    let mut bar = Bar::flat(resolution, open_time, price);
    bar.volume = 1.0;
    bar.quote_volume = price;
    bar.trade_count = 1;
    bar
}

/// Run a write buffer with default settings. Dropping the returned sender stops it.
pub fn spawn_writer(
    resolution: Resolution,
    store: Arc<dyn BarStore>,
) -> (WriteBufferHandle, watch::Sender<bool>) {
    let (buffer, handle) = WriteBuffer::new(
        resolution,
        store,
        WriteBufferConfig::default(),
        Arc::new(PipelineStats::new()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(buffer.run(shutdown_rx));
    (handle, shutdown_tx)
}

/// Captures everything an accumulator emits
#[derive(Clone, Default)]
pub struct Recorder {
    stored: Arc<Mutex<Vec<Bar>>>,
    bootstraps: Arc<Mutex<Vec<i64>>>,
    scans: Arc<Mutex<Vec<i64>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self, resolution: Resolution) -> Triggers {
        let mut triggers = Triggers::new();
        let stored = self.stored.clone();
        triggers
            .store
            .register(resolution, Arc::new(move |b| stored.lock().unwrap().push(b)));
        let bootstraps = self.bootstraps.clone();
        triggers
            .uptodate
            .register(resolution, Arc::new(move |t| bootstraps.lock().unwrap().push(t)));
        let scans = self.scans.clone();
        triggers
            .check
            .register(resolution, Arc::new(move |t| scans.lock().unwrap().push(t)));
        triggers
    }

    pub fn stored(&self) -> Vec<Bar> {
        self.stored.lock().unwrap().clone()
    }

    pub fn bootstraps(&self) -> Vec<i64> {
        self.bootstraps.lock().unwrap().clone()
    }

    pub fn scans(&self) -> Vec<i64> {
        self.scans.lock().unwrap().clone()
    }
}

/// Memory store whose inserts can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryBarStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BarStore for FlakyStore {
    async fn insert_batch(&self, resolution: Resolution, bars: &[Bar]) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::StoreError("injected insert failure".to_string()));
        }
        self.inner.insert_batch(resolution, bars).await
    }

    async fn first(&self, resolution: Resolution) -> Result<Option<Bar>> {
        self.inner.first(resolution).await
    }

    async fn last(&self, resolution: Resolution) -> Result<Option<Bar>> {
        self.inner.last(resolution).await
    }

    async fn list_range(&self, resolution: Resolution, from: i64, to: i64) -> Result<Vec<Bar>> {
        self.inner.list_range(resolution, from, to).await
    }

    async fn find_missing(&self, resolution: Resolution, open_times: &[i64]) -> Result<Vec<i64>> {
        self.inner.find_missing(resolution, open_times).await
    }

    async fn count(&self, resolution: Resolution) -> Result<usize> {
        self.inner.count(resolution).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCall {
    pub resolution: Resolution,
    pub start: i64,
    pub end: i64,
    pub limit: usize,
}

/// In-memory venue recording every range request
#[derive(Default)]
pub struct MockHistoricalApi {
    venue: Mutex<BTreeMap<(usize, i64), Bar>>,
    calls: Mutex<Vec<FetchCall>>,
    failures_left: AtomicU32,
    rejections_left: AtomicU32,
}

impl MockHistoricalApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bars(&self, resolution: Resolution, open_times: impl IntoIterator<Item = i64>) {
        let mut venue = self.venue.lock().unwrap();
        for t in open_times {
            venue.insert((resolution.index(), t), bar(resolution, t, 100.0));
        }
    }

    /// Fail the next `n` requests with a timeout
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` requests with an invalid row
    pub fn reject_next(&self, n: u32) {
        self.rejections_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoricalApi for MockHistoricalApi {
    async fn fetch_range(
        &self,
        resolution: Resolution,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.calls.lock().unwrap().push(FetchCall {
            resolution,
            start,
            end,
            limit,
        });

        if take_one(&self.failures_left) {
            return Err(SyncError::NetworkTimeout("injected fetch failure".to_string()));
        }
        if take_one(&self.rejections_left) {
            return Err(SyncError::InvalidBarData("injected bad kline row".to_string()));
        }

        if start > end {
            return Ok(Vec::new());
        }
        let idx = resolution.index();
        let venue = self.venue.lock().unwrap();
        Ok(venue
            .range((idx, start)..=(idx, end))
            .map(|(_, b)| b.clone())
            .take(limit)
            .collect())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
