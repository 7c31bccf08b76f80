/// Per-resolution pipeline assembly
///
/// Every configured resolution gets its own task group: accumulator, write
/// buffer, reconciler and (optionally) a periodic scan ticker. Groups share
/// nothing but the store and talk to each other only through channels and
/// the trigger registries.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::broker::HistoricalApi;
use crate::data::backfiller::Backfiller;
use crate::data::bar_accumulator::{BarAccumulator, FeedMessage};
use crate::data::bar_store::BarStore;
use crate::data::gap_scanner::GapScanner;
use crate::data::reconciler::{ReconcileRequest, Reconciler, SupervisorPolicy};
use crate::data::stats::{HealthReport, PipelineStats};
use crate::data::trigger_registry::{TriggerRegistry, Triggers};
use crate::data::write_buffer::{WriteBuffer, WriteBufferConfig, WriteBufferHandle};
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::{Bar, Config};
use crate::utils::{last_closed_open_time, now_ms};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub write_buffer: WriteBufferConfig,
    pub page_size: usize,
    pub gap_scan_chunk: usize,
    pub supervisor: SupervisorPolicy,
    /// Periodic scan to the last closed bar; `None` disables it
    pub reconcile_interval: Option<Duration>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            write_buffer: WriteBufferConfig::from_config(config),
            page_size: config.page_size,
            gap_scan_chunk: config.gap_scan_chunk,
            supervisor: SupervisorPolicy::from_config(config),
            reconcile_interval: (config.reconcile_interval_sec > 0)
                .then(|| Duration::from_secs(config.reconcile_interval_sec)),
        }
    }
}

/// Handles kept for one running pipeline
struct Pipeline {
    stats: Arc<PipelineStats>,
    writer: WriteBufferHandle,
    current: watch::Receiver<Option<Bar>>,
}

pub struct PipelineSet {
    store: Arc<dyn BarStore>,
    feed: Arc<TriggerRegistry<FeedMessage>>,
    pipelines: [Option<Pipeline>; Resolution::COUNT],
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineSet {
    /// Start one pipeline per resolution. Must be called inside a tokio runtime.
    pub fn spawn(
        settings: &PipelineSettings,
        resolutions: &[Resolution],
        store: Arc<dyn BarStore>,
        api: Arc<dyn HistoricalApi>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut triggers = Triggers::new();
        let mut pipelines: [Option<Pipeline>; Resolution::COUNT] = std::array::from_fn(|_| None);
        let mut accumulator_inputs = Vec::with_capacity(resolutions.len());
        let mut tasks = Vec::new();

        for &res in resolutions {
            if pipelines[res.index()].is_some() {
                continue;
            }
            let stats = Arc::new(PipelineStats::new());

            let (buffer, writer) = WriteBuffer::new(
                res,
                store.clone(),
                settings.write_buffer.clone(),
                stats.clone(),
            );
            tasks.push(tokio::spawn(buffer.run(shutdown.clone())));

            let backfiller = Backfiller::new(api.clone(), writer.clone(), settings.page_size, stats.clone());
            let scanner = GapScanner::new(
                backfiller,
                store.clone(),
                writer.clone(),
                settings.gap_scan_chunk,
                stats.clone(),
            );
            let reconciler = Reconciler::new(scanner, store.clone(), settings.supervisor.clone(), stats.clone());
            let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(reconciler.run(reconcile_rx, shutdown.clone())));

            let store_writer = writer.clone();
            triggers.store.register(
                res,
                Arc::new(move |bar: Bar| {
                    if let Err(e) = store_writer.push(bar) {
                        error!(resolution = %res, "Finalized bar lost: {}", e);
                    }
                }),
            );
            let tx = reconcile_tx.clone();
            triggers.uptodate.register(
                res,
                Arc::new(move |live| {
                    let _ = tx.send(ReconcileRequest::Bootstrap(live));
                }),
            );
            let tx = reconcile_tx.clone();
            triggers.check.register(
                res,
                Arc::new(move |target| {
                    let _ = tx.send(ReconcileRequest::Scan(target));
                }),
            );

            if let Some(interval) = settings.reconcile_interval {
                tasks.push(tokio::spawn(periodic_scan(
                    res,
                    interval,
                    reconcile_tx,
                    shutdown.clone(),
                )));
            }

            let (current_tx, current_rx) = watch::channel(None);
            accumulator_inputs.push((res, stats.clone(), current_tx));
            pipelines[res.index()] = Some(Pipeline {
                stats,
                writer,
                current: current_rx,
            });
        }

        // Accumulators need the complete trigger table
        let triggers = Arc::new(triggers);
        let mut feed = TriggerRegistry::new();
        for (res, stats, current_tx) in accumulator_inputs {
            let accumulator = BarAccumulator::new(res, triggers.clone(), stats);
            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            feed.register(
                res,
                Arc::new(move |msg: FeedMessage| {
                    let _ = feed_tx.send(msg);
                }),
            );
            tasks.push(tokio::spawn(accumulator.run(feed_rx, current_tx, shutdown.clone())));
        }

        info!("🚀 Started {} bar pipelines", resolutions.len());
        PipelineSet {
            store,
            feed: Arc::new(feed),
            pipelines,
            tasks,
        }
    }

    /// Registry the live feed dispatches into
    pub fn feed(&self) -> Arc<TriggerRegistry<FeedMessage>> {
        self.feed.clone()
    }

    /// Route one feed message; `false` if `resolution` has no pipeline
    pub fn dispatch(&self, resolution: Resolution, msg: FeedMessage) -> bool {
        self.feed.trigger(resolution, msg)
    }

    pub fn resolutions(&self) -> Vec<Resolution> {
        Resolution::ALL
            .iter()
            .copied()
            .filter(|r| self.pipelines[r.index()].is_some())
            .collect()
    }

    fn pipeline(&self, resolution: Resolution) -> Result<&Pipeline> {
        self.pipelines[resolution.index()]
            .as_ref()
            .ok_or_else(|| SyncError::InvalidParameter(format!("no pipeline for {}", resolution)))
    }

    /// The bar currently forming in the live feed
    pub fn current_bar(&self, resolution: Resolution) -> Option<Bar> {
        self.pipelines[resolution.index()]
            .as_ref()
            .and_then(|p| p.current.borrow().clone())
    }

    pub fn stats(&self, resolution: Resolution) -> Option<Arc<PipelineStats>> {
        self.pipelines[resolution.index()].as_ref().map(|p| p.stats.clone())
    }

    /// Flush the write buffer of `resolution` and wait for the store
    pub async fn flush(&self, resolution: Resolution) -> Result<()> {
        self.pipeline(resolution)?.writer.flush().await
    }

    pub async fn health(&self, resolution: Resolution) -> Result<HealthReport> {
        self.health_at(resolution, now_ms()).await
    }

    /// Health as of wall-clock time `now`
    pub async fn health_at(&self, resolution: Resolution, now: i64) -> Result<HealthReport> {
        let pipeline = self.pipeline(resolution)?;
        let last = self.store.last(resolution).await?.map(|b| b.open_time);
        Ok(HealthReport::new(
            resolution,
            last,
            last_closed_open_time(resolution, now),
            pipeline.stats.snapshot(),
        ))
    }

    pub async fn health_all(&self) -> Result<Vec<HealthReport>> {
        let mut reports = Vec::new();
        for res in self.resolutions() {
            reports.push(self.health(res).await?);
        }
        Ok(reports)
    }

    /// Wait for every task to stop. Signal shutdown first.
    pub async fn join(self) {
        let PipelineSet { pipelines, tasks, feed, .. } = self;
        // Dropping our senders lets loops blocked on empty channels finish
        drop(pipelines);
        drop(feed);
        for task in tasks {
            if let Err(e) = task.await {
                error!("Pipeline task failed: {}", e);
            }
        }
        debug!("All pipeline tasks stopped");
    }
}

async fn periodic_scan(
    resolution: Resolution,
    interval: Duration,
    tx: mpsc::UnboundedSender<ReconcileRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Startup is covered by the bootstrap pass
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let target = last_closed_open_time(resolution, now_ms());
                if tx.send(ReconcileRequest::Scan(target)).is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::MemoryBarStore;
    use crate::testing::{bar, MockHistoricalApi};

    const M1: Resolution = Resolution::OneMinute;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            write_buffer: WriteBufferConfig::default(),
            page_size: 1000,
            gap_scan_chunk: 10_000,
            supervisor: SupervisorPolicy {
                retry: crate::utils::RetryPolicy::new(
                    3,
                    Duration::from_millis(10),
                    Duration::from_millis(100),
                ),
                max_restarts: 2,
                restart_backoff: crate::utils::RetryPolicy::new(
                    2,
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                ),
            },
            reconcile_interval: None,
        }
    }

    fn update(open_time: i64, price: f64) -> FeedMessage {
        FeedMessage::Update(bar(M1, open_time, price))
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_feed_end_to_end() {
        let store = Arc::new(MemoryBarStore::new());
        let api = Arc::new(MockHistoricalApi::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let set = PipelineSet::spawn(&settings(), &[M1], store.clone(), api.clone(), shutdown_rx);

        assert!(set.dispatch(M1, update(1000, 10.0)));
        assert!(set.dispatch(M1, update(1000, 11.0)));
        assert!(set.dispatch(M1, update(1_060_000, 12.0)));

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let rows = store.list_range(M1, 0, i64::MAX).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].open_time, 1000);
        assert_eq!(rows[0].close, 11.0);

        let current = set.current_bar(M1).unwrap();
        assert_eq!(current.open_time, 1_060_000);
        assert_eq!(current.close, 12.0);

        let stats = set.stats(M1).unwrap().snapshot();
        assert_eq!(stats.updates_received, 3);
        assert_eq!(stats.bars_finalized, 1);
        // First update bootstraps; the jump to 1_060_000 asks for one more scan
        assert_eq!(stats.bootstraps, 1);
        assert_eq!(stats.scans_completed, 2);
        assert!(api.calls().iter().all(|c| c.end < 1_060_000));

        shutdown_tx.send(true).unwrap();
        set.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_catches_up_from_history() {
        const MIN: i64 = 60_000;
        let store = Arc::new(MemoryBarStore::new());
        let api = Arc::new(MockHistoricalApi::new());
        api.add_bars(M1, (0..30).map(|i| i * MIN));
        let seeded: Vec<Bar> = (0..5).map(|i| bar(M1, i * MIN, 1.0)).collect();
        store.insert_batch(M1, &seeded).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let set = PipelineSet::spawn(&settings(), &[M1], store.clone(), api.clone(), shutdown_rx);

        set.dispatch(M1, update(20 * MIN, 3.0));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let rows = store.list_range(M1, 0, i64::MAX).await.unwrap();
        let times: Vec<i64> = rows.iter().map(|b| b.open_time).collect();
        let expected: Vec<i64> = (0..20).map(|i| i * MIN).collect();
        assert_eq!(times, expected);

        let health = set.health_at(M1, 20 * MIN + 30_000).await.unwrap();
        assert_eq!(health.lag_bars, Some(0));

        shutdown_tx.send(true).unwrap();
        set.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_to_unknown_resolution() {
        let store = Arc::new(MemoryBarStore::new());
        let api = Arc::new(MockHistoricalApi::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let set = PipelineSet::spawn(&settings(), &[M1], store, api, shutdown_rx);

        assert!(!set.dispatch(Resolution::OneHour, FeedMessage::Reset));
        assert!(set.flush(Resolution::OneHour).await.is_err());
        assert_eq!(set.resolutions(), vec![M1]);

        shutdown_tx.send(true).unwrap();
        set.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_forming_bar() {
        let store = Arc::new(MemoryBarStore::new());
        let api = Arc::new(MockHistoricalApi::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let set = PipelineSet::spawn(&settings(), &[M1], store.clone(), api, shutdown_rx);

        set.dispatch(M1, update(60_000, 1.0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(set.current_bar(M1).is_some());

        set.dispatch(M1, FeedMessage::Reset);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(set.current_bar(M1).is_none());
        assert_eq!(store.count(M1).await.unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        set.join().await;
    }
}
