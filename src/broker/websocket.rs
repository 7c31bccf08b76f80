/// Binance combined kline stream for real-time bar updates
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::data::trigger_registry::TriggerRegistry;
use crate::data::{FeedMessage, Resolution};
use crate::error::{Result, SyncError};
use crate::types::{Bar, Config};

#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    taker_buy_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
}

/// How a connection ended
enum SessionEnd {
    Shutdown,
    Disconnected(SyncError),
}

/// Live feed for every configured resolution of one symbol.
///
/// Decoded updates are dispatched through the feed registry; after every
/// reconnect each resolution receives [`FeedMessage::Reset`].
pub struct BinanceKlineStream {
    url: String,
    symbol: String,
    resolutions: Vec<Resolution>,
    reconnect_backoff: Vec<u64>,
    feed: Arc<TriggerRegistry<FeedMessage>>,
}

impl BinanceKlineStream {
    pub fn new(config: &Config, feed: Arc<TriggerRegistry<FeedMessage>>) -> Self {
        let symbol = config.symbol.to_uppercase();
        BinanceKlineStream {
            url: stream_url(&config.ws_base_url, &symbol, &config.resolutions),
            symbol,
            resolutions: config.resolutions.clone(),
            reconnect_backoff: config.ws_reconnect_backoff_sec.clone(),
            feed,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stream until shutdown, reconnecting on every disconnect
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt = 0usize;
        let mut connected_before = false;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            info!("🔌 Connecting to kline stream for {}", self.symbol);
            match self.session(&mut shutdown, connected_before).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Kline stream stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected(e)) => {
                    connected_before = true;
                    attempt = 0;
                    warn!(code = e.error_code(), "Kline stream disconnected: {}", e);
                }
                Err(e) => {
                    error!(code = e.error_code(), "Kline stream connection failed: {}", e);
                }
            }

            let backoff = self.backoff_for(attempt);
            attempt += 1;
            warn!("Reconnecting (attempt {}), waiting {}s...", attempt, backoff.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn backoff_for(&self, attempt: usize) -> Duration {
        let secs = self
            .reconnect_backoff
            .get(attempt)
            .or_else(|| self.reconnect_backoff.last())
            .copied()
            .unwrap_or(1);
        Duration::from_secs(secs)
    }

    /// One connection: `Err` if it never came up
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        reconnected: bool,
    ) -> Result<SessionEnd> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::WebSocketError(format!("Connection failed: {}", e)))?;

        info!("✅ Kline stream connected ({} resolutions)", self.resolutions.len());

        if reconnected {
            for res in &self.resolutions {
                self.feed.trigger(*res, FeedMessage::Reset);
            }
        }

        loop {
            let msg = tokio::select! {
                msg = ws.next() => msg,
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Shutdown);
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.dispatch(&text),
                Some(Ok(Message::Ping(data))) => {
                    debug!("Received ping, sending pong");
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        return Ok(SessionEnd::Disconnected(SyncError::WebSocketError(
                            e.to_string(),
                        )));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(SessionEnd::Disconnected(SyncError::WebSocketDisconnected(
                        format!("closed by server: {:?}", frame),
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Ok(SessionEnd::Disconnected(SyncError::WebSocketError(
                        e.to_string(),
                    )));
                }
                None => {
                    return Ok(SessionEnd::Disconnected(SyncError::WebSocketDisconnected(
                        "stream ended".to_string(),
                    )));
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_kline_message(text) {
            Ok((symbol, bar)) if symbol == self.symbol => {
                let res = bar.resolution;
                if !self.feed.trigger(res, FeedMessage::Update(bar)) {
                    debug!(resolution = %res, "No pipeline for kline update");
                }
            }
            Ok((symbol, _)) => warn!("Ignoring kline for unexpected symbol {}", symbol),
            Err(e) => warn!(code = e.error_code(), "Dropping malformed kline payload: {}", e),
        }
    }
}

/// Combined-stream URL subscribing to every resolution
pub fn stream_url(base: &str, symbol: &str, resolutions: &[Resolution]) -> String {
    let lower = symbol.to_lowercase();
    let streams: Vec<String> = resolutions
        .iter()
        .map(|r| format!("{}@kline_{}", lower, r.as_str()))
        .collect();
    format!("{}/stream?streams={}", base.trim_end_matches('/'), streams.join("/"))
}

/// Decode a kline event, bare or wrapped in a combined-stream envelope
pub fn parse_kline_message(text: &str) -> Result<(String, Bar)> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SyncError::MalformedUpdate(format!("not JSON: {}", e)))?;
    let payload = value.get("data").unwrap_or(&value);
    let event = WsKlineEvent::deserialize(payload)
        .map_err(|e| SyncError::MalformedUpdate(format!("not a kline event: {}", e)))?;

    let k = event.kline;
    let resolution: Resolution = k.interval.parse()?;
    let num = |field: &str, value: &str| {
        value
            .parse::<f64>()
            .map_err(|_| SyncError::MalformedUpdate(format!("bad {} '{}'", field, value)))
    };

    let bar = Bar {
        resolution,
        open_time: k.open_time,
        close_time: resolution.close_time(k.open_time),
        open: num("open", &k.open)?,
        high: num("high", &k.high)?,
        low: num("low", &k.low)?,
        close: num("close", &k.close)?,
        volume: num("volume", &k.volume)?,
        quote_volume: num("quote volume", &k.quote_volume)?,
        taker_buy_volume: num("taker buy volume", &k.taker_buy_volume)?,
        taker_buy_quote_volume: num("taker buy quote volume", &k.taker_buy_quote_volume)?,
        trade_count: k.trade_count,
    };
    Ok((event.symbol, bar))
}
