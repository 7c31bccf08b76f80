/// One-shot utility: bring the local bar store up to date and report health
/// Usage: cargo run --bin backfill --release -- [config.toml] [1m,1h,...]
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use barsync::{
    broker::{BinanceRestClient, HistoricalApi},
    config::load_config,
    data::{
        Backfiller, BarStore, GapScanner, HealthReport, JsonlBarStore, PipelineStats,
        ReconcileRequest, Reconciler, Resolution, SupervisorPolicy, WriteBuffer,
        WriteBufferConfig,
    },
    utils::{init_tracing, last_closed_open_time, now_ms},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    init_tracing(&config)?;

    let resolutions: Vec<Resolution> = match args.next() {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().parse::<Resolution>())
            .collect::<Result<_, _>>()?,
        None => config.resolutions.clone(),
    };

    info!("🚀 Historical Backfill Utility");
    info!("==============================");
    info!("Symbol: {} | Resolutions: {}", config.symbol, resolutions.len());

    let store: Arc<dyn BarStore> = Arc::new(JsonlBarStore::open(&config.data_dir, &config.symbol).await?);
    let api: Arc<dyn HistoricalApi> = Arc::new(BinanceRestClient::new(&config)?);
    let policy = SupervisorPolicy::from_config(&config);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received - stopping backfill");
            let _ = ctrl_c_tx.send(true);
        }
    });

    let mut reports = Vec::new();
    for res in resolutions {
        if *shutdown_rx.borrow() {
            break;
        }

        let stats = Arc::new(PipelineStats::new());
        let (buffer, writer) = WriteBuffer::new(
            res,
            store.clone(),
            WriteBufferConfig::from_config(&config),
            stats.clone(),
        );
        let (writer_stop_tx, writer_stop_rx) = watch::channel(false);
        let writer_task = tokio::spawn(buffer.run(writer_stop_rx));

        let backfiller = Backfiller::new(api.clone(), writer.clone(), config.page_size, stats.clone());
        let scanner = GapScanner::new(backfiller, store.clone(), writer, config.gap_scan_chunk, stats.clone());
        let reconciler = Reconciler::new(scanner, store.clone(), policy.clone(), stats.clone());

        // The bar forming now is not closed yet; catch up to the one before it
        let live = res.open_time_containing(now_ms());
        info!("📥 Syncing {} ...", res);
        match reconciler
            .supervise(ReconcileRequest::Bootstrap(live), &mut shutdown_rx)
            .await
        {
            Ok(report) => info!(
                "✅ {} done: {} backfilled, {} gaps refetched ({} bars)",
                res, report.backfilled, report.runs, report.fetched
            ),
            Err(e) => error!("❌ {} failed: {}", res, e),
        }

        let _ = writer_stop_tx.send(true);
        if let Err(e) = writer_task.await {
            error!("Write buffer task for {} failed: {}", res, e);
        }

        let last = store.last(res).await?.map(|b| b.open_time);
        reports.push(HealthReport::new(
            res,
            last,
            last_closed_open_time(res, now_ms()),
            stats.snapshot(),
        ));
    }
    drop(shutdown_tx);

    info!("📊 Summary");
    for report in &reports {
        info!(
            "{:>4} | last: {} | lag: {} bars | fetched: {}",
            report.resolution.as_str(),
            report.last_stored.as_deref().unwrap_or("-"),
            report.lag_bars.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
            report.stats.bars_fetched
        );
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    Ok(())
}
