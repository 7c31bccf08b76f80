/// Live-feed accumulator: holds the forming bar of one resolution
///
/// The feed repeats partial updates for the same open-time; a bar is only
/// known to be closed once an update for a later open-time arrives.
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::data::stats::PipelineStats;
use crate::data::trigger_registry::Triggers;
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::Bar;
use crate::utils::format_ms;

/// Message delivered to an accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Partial bar as seen by the feed so far
    Update(Bar),
    /// Feed reconnected; the forming bar may be stale
    Reset,
}

/// What an accepted update did to the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorEvent {
    /// First update since start or reset; carries its open-time
    Bootstrapped(i64),
    /// Same open-time, forming bar replaced
    Refined,
    /// Later open-time; carries the open-time of the bar sent to the store
    Finalized(i64),
    /// Earlier open-time than the forming bar; ignored
    Discarded,
}

pub struct BarAccumulator {
    resolution: Resolution,
    current: Option<Bar>,
    triggers: Arc<Triggers>,
    stats: Arc<PipelineStats>,
}

impl BarAccumulator {
    pub fn new(resolution: Resolution, triggers: Arc<Triggers>, stats: Arc<PipelineStats>) -> Self {
        BarAccumulator {
            resolution,
            current: None,
            triggers,
            stats,
        }
    }

    /// The bar currently forming, if any
    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Apply one feed update. Rejected updates leave the forming bar untouched.
    pub fn handle(&mut self, update: Bar) -> Result<AccumulatorEvent> {
        self.stats.add_updates_received(1);

        if let Err(e) = self.check(&update) {
            self.stats.add_malformed_updates(1);
            warn!(resolution = %self.resolution, code = e.error_code(), "Dropping feed update: {}", e);
            return Err(e);
        }

        let res = self.resolution;
        match self.current.take() {
            None => {
                let open_time = update.open_time;
                self.current = Some(update);
                debug!(resolution = %res, open_time = %format_ms(open_time), "Bootstrapping from live feed");
                self.stats.add_bootstraps(1);
                if !self.triggers.uptodate.trigger(res, open_time) {
                    warn!(resolution = %res, "No up-to-date trigger registered");
                }
                Ok(AccumulatorEvent::Bootstrapped(open_time))
            }
            Some(current) if current.open_time == update.open_time => {
                self.current = Some(update);
                Ok(AccumulatorEvent::Refined)
            }
            Some(current) if update.open_time < current.open_time => {
                self.stats.add_stale_updates(1);
                warn!(
                    resolution = %res,
                    forming = %format_ms(current.open_time),
                    received = %format_ms(update.open_time),
                    "Discarding out-of-order feed update"
                );
                self.current = Some(current);
                Ok(AccumulatorEvent::Discarded)
            }
            Some(current) => {
                let finalized = current.open_time;
                let expected = res.next_open_time(finalized);
                let new_open = update.open_time;

                self.stats.add_bars_finalized(1);
                if !self.triggers.store.trigger(res, current) {
                    warn!(resolution = %res, "No store trigger registered, finalized bar lost");
                }
                self.current = Some(update);

                if new_open > expected {
                    info!(
                        resolution = %res,
                        from = %format_ms(expected),
                        to = %format_ms(new_open),
                        "Live feed skipped bars, requesting gap scan"
                    );
                    self.triggers.check.trigger(res, res.prev_open_time(new_open));
                }
                Ok(AccumulatorEvent::Finalized(finalized))
            }
        }
    }

    /// Forget the forming bar; the next update bootstraps again
    pub fn reset(&mut self) {
        if let Some(bar) = self.current.take() {
            debug!(
                resolution = %self.resolution,
                open_time = %format_ms(bar.open_time),
                "Discarding forming bar after feed reset"
            );
        }
    }

    fn check(&self, update: &Bar) -> Result<()> {
        if update.resolution != self.resolution {
            return Err(SyncError::MalformedUpdate(format!(
                "{} update routed to {} accumulator",
                update.resolution, self.resolution
            )));
        }
        update.validate()
    }

    /// Consume feed messages until shutdown, publishing the forming bar
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<FeedMessage>,
        current_tx: watch::Sender<Option<Bar>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(FeedMessage::Update(bar)) => {
                        if self.handle(bar).is_ok() {
                            current_tx.send_replace(self.current.clone());
                        }
                    }
                    Some(FeedMessage::Reset) => {
                        self.reset();
                        current_tx.send_replace(None);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(resolution = %self.resolution, "Accumulator stopped");
    }
}
