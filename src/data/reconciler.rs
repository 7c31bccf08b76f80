/// Reconciliation worker: catch-up and gap scans under supervision
///
/// Each pass runs inside a bounded retry of recoverable errors. When the retry
/// budget is spent the supervisor backs off exponentially and restarts the pass,
/// up to a cap; after that the pass is abandoned with an alert and the worker
/// moves on. Non-retryable errors end the pass at once.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::data::bar_store::BarStore;
use crate::data::gap_scanner::{GapScanner, ScanReport};
use crate::data::stats::PipelineStats;
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::Config;
use crate::utils::{format_ms, retry_with_backoff, RetryPolicy};

/// Work item for a reconciliation worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// Live feed bootstrapped at this open-time: catch the store up to it
    Bootstrap(i64),
    /// Make the store gapless up to and including this open-time
    Scan(i64),
}

impl ReconcileRequest {
    fn label(&self) -> &'static str {
        match self {
            ReconcileRequest::Bootstrap(_) => "up-to-date",
            ReconcileRequest::Scan(_) => "gap scan",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Bounded retry around one pass
    pub retry: RetryPolicy,
    pub max_restarts: u32,
    /// Delay before the n-th restart
    pub restart_backoff: RetryPolicy,
}

impl SupervisorPolicy {
    pub fn from_config(config: &Config) -> Self {
        SupervisorPolicy {
            retry: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_millis(config.retry_backoff_ms),
                Duration::from_millis(config.retry_cap_ms),
            ),
            max_restarts: config.supervisor_max_restarts,
            restart_backoff: RetryPolicy::new(
                config.supervisor_max_restarts,
                Duration::from_millis(config.supervisor_backoff_ms),
                Duration::from_millis(config.supervisor_cap_ms),
            ),
        }
    }
}

pub struct Reconciler {
    resolution: Resolution,
    scanner: GapScanner,
    store: Arc<dyn BarStore>,
    policy: SupervisorPolicy,
    stats: Arc<PipelineStats>,
}

impl Reconciler {
    pub fn new(
        scanner: GapScanner,
        store: Arc<dyn BarStore>,
        policy: SupervisorPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Reconciler {
            resolution: scanner.backfiller().resolution(),
            scanner,
            store,
            policy,
            stats,
        }
    }

    /// Bring the store up to the bar before `live_open_time`.
    ///
    /// Forward-fills from the latest stored bar when there is one, otherwise
    /// backward-fills from the live bar, then scans for gaps. The live bar is
    /// never fetched; it reaches the store through the accumulator.
    pub async fn up_to_date(&self, live_open_time: i64) -> Result<ScanReport> {
        let res = self.resolution;
        match self.store.last(res).await? {
            Some(last) if last.open_time < live_open_time => {
                self.scanner
                    .backfiller()
                    .forward_fill(last.open_time, live_open_time)
                    .await?;
            }
            Some(_) => {}
            None => {
                self.scanner.backfiller().backward_fill(live_open_time).await?;
            }
        }
        self.scanner.scan(res.prev_open_time(live_open_time)).await
    }

    /// One pass, no retry
    pub async fn handle(&self, request: ReconcileRequest) -> Result<ScanReport> {
        match request {
            ReconcileRequest::Bootstrap(live) => self.up_to_date(live).await,
            ReconcileRequest::Scan(target) => self.scanner.scan(target).await,
        }
    }

    /// One pass inside the bounded retry
    async fn attempt(&self, request: ReconcileRequest) -> Result<ScanReport> {
        let operation = format!("{} {}", request.label(), self.resolution);
        retry_with_backoff(&self.policy.retry, &operation, |attempt| {
            if attempt > 1 {
                self.stats.add_retries(1);
            }
            self.handle(request)
        })
        .await
    }

    /// Run a pass until it succeeds, the supervisor gives up, or shutdown
    pub async fn supervise(
        &self,
        request: ReconcileRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ScanReport> {
        let res = self.resolution;
        let mut restarts = 0u32;

        loop {
            let outcome = tokio::select! {
                outcome = self.attempt(request) => outcome,
                _ = shutdown.changed() => {
                    return Err(SyncError::SystemShutdown(format!("{} reconciliation aborted", res)));
                }
            };

            let err = match outcome {
                Ok(report) => return Ok(report),
                Err(e @ SyncError::RetriesExhausted { .. }) => e,
                Err(e) => {
                    // Restarting cannot fix bad data or a closed pipeline
                    if !e.is_fatal() {
                        error!(
                            alert = true,
                            resolution = %res,
                            code = e.error_code(),
                            "🚨 {} failed with a non-retryable error: {}",
                            request.label(),
                            e
                        );
                    }
                    return Err(e);
                }
            };

            self.stats.add_budgets_exhausted(1);
            if restarts >= self.policy.max_restarts {
                error!(
                    alert = true,
                    resolution = %res,
                    restarts,
                    code = err.error_code(),
                    "🚨 Giving up on {}: {}",
                    request.label(),
                    err
                );
                return Err(SyncError::SupervisorGaveUp {
                    operation: format!("{} {}", request.label(), res),
                    restarts,
                });
            }

            restarts += 1;
            self.stats.add_supervisor_restarts(1);
            let delay = self.policy.restart_backoff.delay_for(restarts);
            error!(
                alert = true,
                resolution = %res,
                restart = restarts,
                max_restarts = self.policy.max_restarts,
                delay_ms = delay.as_millis() as u64,
                code = err.error_code(),
                "🚨 {} exhausted its retries, restarting: {}",
                request.label(),
                err
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    return Err(SyncError::SystemShutdown(format!("{} reconciliation aborted", res)));
                }
            }
        }
    }

    /// Serve requests until shutdown or until every sender is gone
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ReconcileRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let res = self.resolution;
        loop {
            let first = tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            for request in coalesce(res, first, &mut rx) {
                let pass = Uuid::new_v4();
                let span = info_span!("reconcile", resolution = %res, pass = %pass);
                let result = self.supervise(request, &mut shutdown).instrument(span).await;

                match result {
                    Ok(report) => debug!(
                        resolution = %res,
                        pass = %pass,
                        target = %format_ms(report.target),
                        fetched = report.fetched + report.backfilled,
                        "Reconciliation pass done"
                    ),
                    Err(SyncError::SystemShutdown(_)) => {
                        info!(resolution = %res, "Reconciliation interrupted by shutdown");
                        return;
                    }
                    Err(e) => warn!(
                        resolution = %res,
                        pass = %pass,
                        code = e.error_code(),
                        "Reconciliation pass abandoned: {}",
                        e
                    ),
                }
            }
        }
        debug!(resolution = %res, "Reconciler stopped");
    }
}

/// Merge everything already queued behind `first`: the latest bootstrap wins,
/// scans collapse to the furthest target, and a scan the bootstrap already
/// covers is dropped.
fn coalesce(
    resolution: Resolution,
    first: ReconcileRequest,
    rx: &mut mpsc::UnboundedReceiver<ReconcileRequest>,
) -> Vec<ReconcileRequest> {
    let mut bootstrap: Option<i64> = None;
    let mut scan: Option<i64> = None;

    let mut next = Some(first);
    while let Some(request) = next {
        match request {
            ReconcileRequest::Bootstrap(t) => bootstrap = Some(t),
            ReconcileRequest::Scan(t) => scan = Some(scan.map_or(t, |s| s.max(t))),
        }
        next = rx.try_recv().ok();
    }

    let mut batch = Vec::with_capacity(2);
    if let Some(live) = bootstrap {
        batch.push(ReconcileRequest::Bootstrap(live));
        if scan.is_some_and(|t| t <= resolution.prev_open_time(live)) {
            scan = None;
        }
    }
    if let Some(target) = scan {
        batch.push(ReconcileRequest::Scan(target));
    }
    batch
}
