/// Upstream market-data clients
use async_trait::async_trait;

use crate::data::Resolution;
use crate::error::Result;
use crate::types::Bar;

pub mod binance;
pub mod websocket;

pub use binance::BinanceRestClient;
pub use websocket::BinanceKlineStream;

/// Paginated historical range query
#[async_trait]
pub trait HistoricalApi: Send + Sync {
    /// Bars with `start <= open_time <= end`, ascending, at most `limit` of them.
    /// An empty result means the venue has nothing in that span.
    async fn fetch_range(
        &self,
        resolution: Resolution,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<Bar>>;
}
