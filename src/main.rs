/// Bar synchronizer daemon
/// Usage: barsync [config.toml]
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use barsync::{
    broker::{BinanceKlineStream, BinanceRestClient, HistoricalApi},
    config::load_config,
    data::{BarStore, JsonlBarStore, PipelineSet, PipelineSettings},
    utils::init_tracing,
    Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    init_tracing(&config)?;

    info!("🚀 Starting bar synchronizer for {}", config.symbol);
    info!(
        "Resolutions: {}",
        config
            .resolutions
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_handler(shutdown_tx);

    run(config, shutdown_rx).await?;

    info!("✅ Shutdown complete");
    Ok(())
}

async fn run(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let jsonl = JsonlBarStore::open(&config.data_dir, &config.symbol)
        .await
        .context("opening bar store")?;
    info!("💾 Bar store: {}/{}_<table>.jsonl", config.data_dir, jsonl.symbol());
    let store: Arc<dyn BarStore> = Arc::new(jsonl);
    let api: Arc<dyn HistoricalApi> = Arc::new(BinanceRestClient::new(&config)?);

    let pipelines = PipelineSet::spawn(
        &PipelineSettings::from_config(&config),
        &config.resolutions,
        store,
        api,
        shutdown.clone(),
    );

    let stream = BinanceKlineStream::new(&config, pipelines.feed());
    info!("📡 Live feed: {}", stream.url());
    let feed_task = tokio::spawn(stream.run(shutdown.clone()));

    report_health(&pipelines, Duration::from_secs(config.health_interval_sec.max(1)), shutdown).await;

    match feed_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Live feed stopped with error: {}", e),
        Err(e) => error!("Live feed task failed: {}", e),
    }

    info!("Waiting for pipelines to flush...");
    pipelines.join().await;
    Ok(())
}

/// Log the health of every pipeline until shutdown
async fn report_health(pipelines: &PipelineSet, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        let reports = match pipelines.health_all().await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(code = e.error_code(), "Health check failed: {}", e);
                continue;
            }
        };

        for report in reports {
            let stats = serde_json::to_string(&report.stats).unwrap_or_default();
            if report.is_healthy() {
                info!(
                    resolution = %report.resolution,
                    last = report.last_stored.as_deref().unwrap_or("-"),
                    "💚 Up to date {}",
                    stats
                );
            } else {
                warn!(
                    resolution = %report.resolution,
                    last = report.last_stored.as_deref().unwrap_or("-"),
                    expected = %report.last_closed,
                    lag_bars = ?report.lag_bars,
                    dropped = report.stats.bars_dropped,
                    "⚠️ Behind {}",
                    stats
                );
            }
        }
    }
}

fn spawn_shutdown_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received - initiating graceful shutdown"),
            Err(e) => error!("Failed to listen for Ctrl+C, shutting down: {}", e),
        }
        let _ = shutdown.send(true);
    });
}
