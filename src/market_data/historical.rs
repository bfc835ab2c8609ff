// =============================================================================
// Historical Price Provider — minute-bar key/value cache for backtesting
// =============================================================================
//
// A key/value cache keyed by `"{symbol} - {DD Mon YYYY HH:MM:SS}"`, fetched
// in 1000-minute windows from the exchange's historical klines endpoint and
// memoized per minute so repeat lookups never refetch. Minutes with no
// trade are marked with a zero price so the gap isn't queried again.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

const DATE_FORMAT: &str = "%d %b %Y %H:%M:%S";

fn cache_key(symbol: &str, at: DateTime<Utc>) -> String {
    format!("{symbol} - {}", at.format(DATE_FORMAT))
}

/// One minute-bar open price fetched from the exchange's kline history.
#[derive(Debug, Clone, Copy)]
pub struct HistoricalBar {
    pub open_time: DateTime<Utc>,
    pub open_price: f64,
}

/// Fetches historical 1-minute klines for a symbol over `[start, end]`.
#[async_trait::async_trait]
pub trait KlineFetcher: Send + Sync {
    async fn fetch_klines(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalBar>>;
}

/// Minute-bar price lookups for backtesting, backed by an in-memory map that
/// mirrors the on-disk cache a live deployment would persist.
pub struct HistoricalPriceProvider<F: KlineFetcher> {
    fetcher: F,
    cache: RwLock<HashMap<String, f64>>,
}

impl<F: KlineFetcher> HistoricalPriceProvider<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Look up `symbol`'s price at `at`, fetching and memoizing a 1000-minute
    /// window starting at `at` on a cache miss. Minutes with no trade are
    /// recorded as `0.0` and reported back as `None`.
    pub async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Result<Option<f64>> {
        let key = cache_key(symbol, at);
        if let Some(&cached) = self.cache.read().get(&key) {
            return Ok(if cached == 0.0 { None } else { Some(cached) });
        }

        let now = Utc::now();
        let mut window_end = at + Duration::minutes(1000);
        if window_end > now {
            window_end = now;
        }
        let klines = self.fetcher.fetch_klines(symbol, at, window_end).await?;

        let no_data_end = match klines.first() {
            None => window_end,
            Some(first) => first.open_time - Duration::minutes(1),
        };
        let mut cursor = at;
        {
            let mut cache = self.cache.write();
            while cursor <= no_data_end {
                cache.insert(cache_key(symbol, cursor), 0.0);
                cursor += Duration::minutes(1);
            }
            for bar in &klines {
                cache.insert(cache_key(symbol, bar.open_time), bar.open_price);
            }
        }

        let value = self.cache.read().get(&key).copied();
        Ok(value.filter(|&v| v != 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedFetcher {
        bars: Vec<HistoricalBar>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl KlineFetcher for FixedFetcher {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<HistoricalBar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.bars.clone())
        }
    }

    #[tokio::test]
    async fn fetches_once_then_serves_from_cache() {
        let t0 = Utc::now() - Duration::days(10);
        let fetcher = FixedFetcher {
            bars: vec![HistoricalBar {
                open_time: t0,
                open_price: 42.0,
            }],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let provider = HistoricalPriceProvider::new(fetcher);

        let first = provider.price_at("BTCUSDT", t0).await.unwrap();
        assert_eq!(first, Some(42.0));
        let second = provider.price_at("BTCUSDT", t0).await.unwrap();
        assert_eq!(second, Some(42.0));
        assert_eq!(provider.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gap_minutes_are_memoized_as_none() {
        let t0 = Utc::now() - Duration::days(10);
        let fetcher = FixedFetcher {
            bars: vec![HistoricalBar {
                open_time: t0 + Duration::minutes(5),
                open_price: 10.0,
            }],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let provider = HistoricalPriceProvider::new(fetcher);

        let gap = provider.price_at("ETHUSDT", t0 + Duration::minutes(2)).await.unwrap();
        assert_eq!(gap, None);
        // Still memoized — no second fetch for a minute inside the same window.
        let gap2 = provider.price_at("ETHUSDT", t0 + Duration::minutes(2)).await.unwrap();
        assert_eq!(gap2, None);
        assert_eq!(provider.fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
