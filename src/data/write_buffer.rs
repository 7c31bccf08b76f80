/// Batched single-writer path to the bar store
///
/// Every bar of a resolution, live or backfilled, reaches the store through one
/// `WriteBuffer`. Its loop is the only owner of the pending list and flushes on
/// two triggers: the list reaching `capacity`, or the interval timer firing
/// while the list is non-empty.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::data::bar_store::BarStore;
use crate::data::stats::PipelineStats;
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::{Bar, Config};

/// Message accepted by the buffer loop
#[derive(Debug)]
pub enum WriteItem {
    Bar(Bar),
    Batch(Vec<Bar>),
    /// Flush now and report the outcome
    Flush(oneshot::Sender<Result<()>>),
}

#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    /// Pending length that forces a flush
    pub capacity: usize,
    pub flush_interval: Duration,
    /// Upper bound on pending bars while flushes keep failing; oldest are dropped
    pub max_retained: usize,
}

impl WriteBufferConfig {
    pub fn from_config(config: &Config) -> Self {
        WriteBufferConfig {
            capacity: config.write_buffer_capacity,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_retained: config.max_retained_bars,
        }
    }
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        WriteBufferConfig {
            capacity: 1000,
            flush_interval: Duration::from_secs(1),
            max_retained: 100_000,
        }
    }
}

/// Cloneable producer side of a [`WriteBuffer`]
#[derive(Clone)]
pub struct WriteBufferHandle {
    resolution: Resolution,
    tx: mpsc::UnboundedSender<WriteItem>,
    stats: Arc<PipelineStats>,
}

impl WriteBufferHandle {
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Enqueue one finalized bar. Never blocks.
    pub fn push(&self, bar: Bar) -> Result<()> {
        self.send(WriteItem::Bar(bar), 1)
    }

    /// Enqueue a page of bars. Never blocks.
    pub fn push_batch(&self, bars: Vec<Bar>) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let n = bars.len() as u64;
        self.send(WriteItem::Batch(bars), n)
    }

    /// Flush everything enqueued so far and wait for the store's answer
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteItem::Flush(reply_tx))
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())?
    }

    fn send(&self, item: WriteItem, n: u64) -> Result<()> {
        self.tx.send(item).map_err(|_| self.closed())?;
        self.stats.add_bars_enqueued(n);
        Ok(())
    }

    fn closed(&self) -> SyncError {
        SyncError::ChannelClosed(format!("{} write buffer", self.resolution))
    }
}

/// Consumer loop owning the pending list
pub struct WriteBuffer {
    resolution: Resolution,
    store: Arc<dyn BarStore>,
    config: WriteBufferConfig,
    rx: mpsc::UnboundedReceiver<WriteItem>,
    pending: Vec<Bar>,
    /// Set while the last flush failed; only the timer retries then
    failing: bool,
    stats: Arc<PipelineStats>,
}

impl WriteBuffer {
    pub fn new(
        resolution: Resolution,
        store: Arc<dyn BarStore>,
        config: WriteBufferConfig,
        stats: Arc<PipelineStats>,
    ) -> (WriteBuffer, WriteBufferHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WriteBufferHandle {
            resolution,
            tx,
            stats: stats.clone(),
        };
        let buffer = WriteBuffer {
            resolution,
            store,
            pending: Vec::with_capacity(config.capacity),
            config,
            rx,
            failing: false,
            stats,
        };
        (buffer, handle)
    }

    /// Run until shutdown is signalled or every handle is dropped, then flush
    /// whatever is still pending.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        debug!(resolution = %self.resolution, "Write buffer started");

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(WriteItem::Flush(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                    }
                    Some(item) => {
                        self.accept(item);
                        if self.pending.len() >= self.config.capacity && !self.failing {
                            let _ = self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        let _ = self.flush().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain().await;
    }

    fn accept(&mut self, item: WriteItem) {
        match item {
            WriteItem::Bar(bar) => self.pending.push(bar),
            WriteItem::Batch(bars) => self.pending.extend(bars),
            WriteItem::Flush(_) => {}
        }

        if self.pending.len() > self.config.max_retained {
            let excess = self.pending.len() - self.config.max_retained;
            self.pending.drain(..excess);
            self.stats.add_bars_dropped(excess as u64);
            warn!(
                resolution = %self.resolution,
                dropped = excess,
                retained = self.pending.len(),
                "Write buffer over retention limit, dropped oldest bars"
            );
        }
    }

    /// Write the pending list: deduplicated by open-time (latest wins) and
    /// sorted. Cleared on success, kept for the next trigger on failure.
    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut unique: BTreeMap<i64, &Bar> = BTreeMap::new();
        for bar in &self.pending {
            unique.insert(bar.open_time, bar);
        }
        let batch: Vec<Bar> = unique.into_values().cloned().collect();

        match self.store.insert_batch(self.resolution, &batch).await {
            Ok(written) => {
                debug!(
                    resolution = %self.resolution,
                    flushed = batch.len(),
                    written,
                    "Flushed write buffer"
                );
                if self.failing {
                    info!(resolution = %self.resolution, "✅ Store writes recovered");
                }
                self.stats.add_bars_flushed(batch.len() as u64);
                self.pending.clear();
                self.failing = false;
                Ok(())
            }
            Err(e) => {
                self.stats.add_flush_failures(1);
                self.failing = true;
                warn!(
                    resolution = %self.resolution,
                    retained = self.pending.len(),
                    code = e.error_code(),
                    "Flush failed, retaining bars: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn drain(&mut self) {
        self.rx.close();
        let mut replies = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            match item {
                WriteItem::Flush(reply) => replies.push(reply),
                item => self.accept(item),
            }
        }

        let pending = self.pending.len();
        let result = self.flush().await;
        match &result {
            Ok(()) if pending > 0 => {
                info!(resolution = %self.resolution, bars = pending, "Flushed write buffer on shutdown")
            }
            Ok(()) => {}
            Err(e) => error!(
                resolution = %self.resolution,
                lost = self.pending.len(),
                "Final flush failed: {}",
                e
            ),
        }

        for reply in replies {
            let _ = reply.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(SyncError::StoreError(e.to_string())),
            });
        }
    }
}
