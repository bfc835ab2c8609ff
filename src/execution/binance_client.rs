// =============================================================================
// Adapters wiring `BinanceClient` into the market-data fetch traits
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::binance::client::BinanceClient;
use crate::market_data::depth_cache::{DepthSnapshot, SnapshotFetcher};
use crate::market_data::historical::{HistoricalBar, KlineFetcher};
use crate::market_data::ticker_cache::TickerFetcher;

const DEPTH_SNAPSHOT_LIMIT: u32 = 1000;

#[async_trait::async_trait]
impl SnapshotFetcher for BinanceClient {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<DepthSnapshot> {
        let (last_update_id, bids, asks) = self.get_order_book(symbol, DEPTH_SNAPSHOT_LIMIT).await?;
        Ok(DepthSnapshot {
            last_update_id,
            bids,
            asks,
        })
    }
}

#[async_trait::async_trait]
impl TickerFetcher for BinanceClient {
    async fn fetch_all_prices(&self) -> Result<Vec<(String, f64)>> {
        self.get_all_ticker_prices().await
    }
}

#[async_trait::async_trait]
impl KlineFetcher for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalBar>> {
        let candles = self
            .get_historical_klines_range(symbol, start.timestamp_millis(), end.timestamp_millis())
            .await?;
        Ok(candles
            .into_iter()
            .map(|c| HistoricalBar {
                open_time: Utc.timestamp_millis_opt(c.open_time).single().unwrap_or(start),
                open_price: c.open,
            })
            .collect())
    }
}
