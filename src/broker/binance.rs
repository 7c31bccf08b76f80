/// Binance spot REST client for historical klines
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::broker::HistoricalApi;
use crate::data::Resolution;
use crate::error::{Result, SyncError};
use crate::types::{Bar, Config};
use crate::utils::{format_ms, RateLimiter};

/// Venue cap on rows per klines request
pub const MAX_KLINES_PER_REQUEST: usize = 1000;

/// One row of `/api/v3/klines`:
/// open time, O, H, L, C, volume, close time, quote volume, trades,
/// taker buy base volume, taker buy quote volume, unused
type KlineRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    u64,
    String,
    String,
    serde_json::Value,
);

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    symbol: String,
    rate_limiter: RateLimiter,
}

impl BinanceRestClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_sec))
            .build()?;

        Ok(BinanceRestClient {
            client,
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            symbol: config.symbol.to_uppercase(),
            rate_limiter: RateLimiter::new(config.rate_limit_historical),
        })
    }
}

#[async_trait]
impl HistoricalApi for BinanceRestClient {
    async fn fetch_range(
        &self,
        resolution: Resolution,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        if start > end {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);

        self.rate_limiter.acquire().await;

        debug!(
            resolution = %resolution,
            start = %format_ms(start),
            end = %format_ms(end),
            limit,
            "Fetching klines"
        );

        let response = self
            .client
            .get(format!("{}/api/v3/klines", self.base_url))
            .query(&[
                ("symbol", self.symbol.clone()),
                ("interval", resolution.as_str().to_string()),
                ("startTime", start.to_string()),
                ("endTime", end.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let rows: Vec<KlineRow> = serde_json::from_str(&body)?;
        let mut bars = rows
            .iter()
            .map(|row| parse_kline_row(resolution, row))
            .collect::<Result<Vec<_>>>()?;
        bars.sort_by_key(|b| b.open_time);

        debug!(resolution = %resolution, rows = bars.len(), "Fetched klines");
        Ok(bars)
    }
}

/// Map a non-success response to a typed error
fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| format!("{} (code {})", e.msg, e.code))
        .unwrap_or_else(|_| body.chars().take(200).collect());

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            SyncError::RateLimitExceeded(message)
        }
        _ => SyncError::UpstreamApi {
            code: status.as_u16(),
            message,
        },
    }
}

fn parse_field(value: &str, field: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| SyncError::InvalidBarData(format!("bad {} '{}'", field, value)))
}

fn parse_kline_row(resolution: Resolution, row: &KlineRow) -> Result<Bar> {
    let bar = Bar {
        resolution,
        open_time: row.0,
        close_time: resolution.close_time(row.0),
        open: parse_field(&row.1, "open")?,
        high: parse_field(&row.2, "high")?,
        low: parse_field(&row.3, "low")?,
        close: parse_field(&row.4, "close")?,
        volume: parse_field(&row.5, "volume")?,
        quote_volume: parse_field(&row.7, "quote volume")?,
        trade_count: row.8,
        taker_buy_volume: parse_field(&row.9, "taker buy volume")?,
        taker_buy_quote_volume: parse_field(&row.10, "taker buy quote volume")?,
    };
    bar.validate()?;
    Ok(bar)
}
