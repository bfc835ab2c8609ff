// =============================================================================
// Ticker Cache — mini-ticker close prices and the non-existent-symbol set
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

/// Fetches the full ticker-price snapshot over REST on a cache miss. Lets
/// `TickerCache` resolve a miss without depending on the exchange client
/// directly -- mirrors how `SnapshotFetcher` decouples the depth cache.
#[async_trait::async_trait]
pub trait TickerFetcher: Send + Sync {
    async fn fetch_all_prices(&self) -> Result<Vec<(String, f64)>>;
}

/// Last observed close price per symbol, plus the set of symbols the
/// exchange has told us don't exist. A symbol never appears in both sets at
/// once: discovering a price for a symbol removes it from `non_existent`,
/// and vice versa.
#[derive(Default)]
pub struct TickerCache {
    prices: RwLock<std::collections::HashMap<String, f64>>,
    non_existent: RwLock<HashSet<String>>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
        self.non_existent.write().remove(symbol);
    }

    pub fn mark_non_existent(&self, symbol: &str) {
        self.non_existent.write().insert(symbol.to_string());
        self.prices.write().remove(symbol);
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }

    pub fn is_non_existent(&self, symbol: &str) -> bool {
        self.non_existent.read().contains(symbol)
    }

    pub fn known_symbol_count(&self) -> usize {
        self.prices.read().len()
    }

    /// Looks up `symbol`, refetching the whole ticker-price snapshot on a
    /// miss. A symbol still missing after the refetch is recorded in
    /// `non_existent` so later lookups skip straight past it without
    /// hitting the network again.
    pub async fn price_or_refetch(&self, symbol: &str, fetcher: &dyn TickerFetcher) -> Result<Option<f64>> {
        if let Some(p) = self.price(symbol) {
            return Ok(Some(p));
        }
        if self.is_non_existent(symbol) {
            return Ok(None);
        }

        let all = fetcher.fetch_all_prices().await?;
        for (sym, price) in all {
            self.update(&sym, price);
        }

        if let Some(p) = self.price(symbol) {
            return Ok(Some(p));
        }
        info!(symbol, "ticker does not exist -- will not be fetched again");
        self.mark_non_existent(symbol);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_clears_non_existent_and_vice_versa() {
        let cache = TickerCache::new();
        cache.mark_non_existent("FOOBAR");
        assert!(cache.is_non_existent("FOOBAR"));

        cache.update("FOOBAR", 1.23);
        assert!(!cache.is_non_existent("FOOBAR"));
        assert_eq!(cache.price("FOOBAR"), Some(1.23));

        cache.mark_non_existent("FOOBAR");
        assert!(cache.price("FOOBAR").is_none());
        assert!(cache.is_non_existent("FOOBAR"));
    }

    #[test]
    fn unknown_symbol_has_no_price_and_is_not_flagged() {
        let cache = TickerCache::new();
        assert_eq!(cache.price("GHOST"), None);
        assert!(!cache.is_non_existent("GHOST"));
    }

    struct FakeFetcher {
        prices: Vec<(String, f64)>,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl TickerFetcher for FakeFetcher {
        async fn fetch_all_prices(&self) -> Result<Vec<(String, f64)>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.prices.clone())
        }
    }

    #[tokio::test]
    async fn price_or_refetch_fills_cache_from_a_miss() {
        let cache = TickerCache::new();
        let fetcher = FakeFetcher {
            prices: vec![("BTCUSDT".to_string(), 20000.0)],
            calls: std::sync::atomic::AtomicU32::new(0),
        };
        assert_eq!(cache.price_or_refetch("BTCUSDT", &fetcher).await.unwrap(), Some(20000.0));
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn price_or_refetch_marks_non_existent_after_one_failed_refetch() {
        let cache = TickerCache::new();
        let fetcher = FakeFetcher {
            prices: vec![("BTCUSDT".to_string(), 20000.0)],
            calls: std::sync::atomic::AtomicU32::new(0),
        };
        assert_eq!(cache.price_or_refetch("GHOST", &fetcher).await.unwrap(), None);
        assert!(cache.is_non_existent("GHOST"));

        // A second miss on the same symbol must not refetch again.
        assert_eq!(cache.price_or_refetch("GHOST", &fetcher).await.unwrap(), None);
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
