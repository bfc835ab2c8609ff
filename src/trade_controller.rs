// =============================================================================
// TradeController — orchestrates a single coin-jump transaction
// =============================================================================
//
// A jump is sell current -> bridge, buy bridge -> best, then re-derive every
// ratio row for the new holding and commit. The whole thing runs inside a
// `postpone_heavy_calls` scope: if either leg fails, the ratio matrix rolls
// back and no scout-history or trade-log writes survive.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::execution::OrderExecutor;
use crate::market_data::TickerCache;
use crate::persistence::PersistencePort;
use crate::postpone::postpone_heavy_calls;
use crate::ratio_matrix::RatioMatrix;
use crate::registry::CoinRegistry;

pub struct TradeController {
    registry: CoinRegistry,
    ratio_matrix: RatioMatrix,
    executor: Arc<dyn OrderExecutor>,
    persistence: Arc<dyn PersistencePort>,
    ticker_cache: Arc<TickerCache>,
    bridge_symbol: String,
    /// ratio(bridge -> coin j), parallel to registry indices. Not part of
    /// the NxN matrix since the bridge isn't a watchlist coin; NaN until the
    /// bridge-scout comparison first observes a pair.
    bridge_ratios: Vec<f64>,
}

impl TradeController {
    pub fn new(
        registry: CoinRegistry,
        ratio_matrix: RatioMatrix,
        executor: Arc<dyn OrderExecutor>,
        persistence: Arc<dyn PersistencePort>,
        ticker_cache: Arc<TickerCache>,
        bridge_symbol: impl Into<String>,
    ) -> Self {
        let bridge_ratios = vec![f64::NAN; registry.count()];
        Self {
            registry,
            ratio_matrix,
            executor,
            persistence,
            ticker_cache,
            bridge_symbol: bridge_symbol.into(),
            bridge_ratios,
        }
    }

    pub fn registry(&self) -> &CoinRegistry {
        &self.registry
    }

    pub fn ratio_matrix(&self) -> &RatioMatrix {
        &self.ratio_matrix
    }

    pub fn ratio_matrix_mut(&mut self) -> &mut RatioMatrix {
        &mut self.ratio_matrix
    }

    pub fn executor(&self) -> &Arc<dyn OrderExecutor> {
        &self.executor
    }

    pub fn bridge_symbol(&self) -> &str {
        &self.bridge_symbol
    }

    pub fn ticker_cache(&self) -> &Arc<TickerCache> {
        &self.ticker_cache
    }

    pub fn bridge_ratios(&self) -> &[f64] {
        &self.bridge_ratios
    }

    pub fn set_bridge_ratio(&mut self, idx: usize, value: f64) {
        self.bridge_ratios[idx] = value;
    }

    /// Sell `from_symbol` into the bridge, buy `to_symbol` with the
    /// proceeds, re-derive every ratio row for the new holding, and persist.
    pub async fn jump(&mut self, from_symbol: &str, to_symbol: &str, sell_price: f64, buy_price: f64) -> Result<()> {
        let Some(to_idx) = self.registry.by_symbol(to_symbol).map(|s| s.idx) else {
            bail!("jump to unregistered coin: {to_symbol}");
        };
        if self.registry.by_symbol(from_symbol).is_none() {
            bail!("jump from unregistered coin: {from_symbol}");
        }

        let executor = self.executor.clone();
        let bridge = self.bridge_symbol.clone();
        let from_owned = from_symbol.to_string();
        let to_owned = to_symbol.to_string();

        let result = postpone_heavy_calls(|| {
            let executor = executor.clone();
            let bridge = bridge.clone();
            let from_owned = from_owned.clone();
            let to_owned = to_owned.clone();
            async move {
                executor.sell_alt(&from_owned, &bridge, sell_price).await?;
                executor.buy_alt(&to_owned, &bridge, buy_price).await
            }
        })
        .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.ratio_matrix.rollback();
                warn!(from = from_symbol, to = to_symbol, error = %e, "jump aborted, ratio matrix rolled back");
                return Err(e);
            }
        };

        self.finish_jump(to_idx, to_symbol, report.order_id).await
    }

    /// Buy `to_symbol` directly with bridge holdings (the bridge-scout
    /// case), skipping the sell leg since there's nothing else to sell.
    pub async fn jump_from_bridge(&mut self, to_symbol: &str, buy_price: f64) -> Result<()> {
        let Some(to_idx) = self.registry.by_symbol(to_symbol).map(|s| s.idx) else {
            bail!("jump to unregistered coin: {to_symbol}");
        };

        let executor = self.executor.clone();
        let bridge = self.bridge_symbol.clone();
        let to_owned = to_symbol.to_string();

        let result = postpone_heavy_calls(|| {
            let executor = executor.clone();
            let bridge = bridge.clone();
            let to_owned = to_owned.clone();
            async move { executor.buy_alt(&to_owned, &bridge, buy_price).await }
        })
        .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.ratio_matrix.rollback();
                warn!(to = to_symbol, error = %e, "bridge jump aborted, ratio matrix rolled back");
                return Err(e);
            }
        };

        self.finish_jump(to_idx, to_symbol, report.order_id).await
    }

    async fn finish_jump(&mut self, best_idx: usize, best_symbol: &str, order_id: u64) -> Result<()> {
        self.update_ratios_for(best_idx);
        if let Err(e) = self.commit_ratios().await {
            self.ratio_matrix.rollback();
            warn!(error = %e, "ratio commit failed, rolled back");
            return Err(e);
        }
        let _ = self.persistence.current_coin_set(best_symbol).await;
        info!(to = best_symbol, order_id, "jump committed");
        Ok(())
    }

    /// For every enabled coin K, set matrix[best][k] = price(best)/price(K)
    /// when K's price is known; leave NaN otherwise.
    fn update_ratios_for(&mut self, best_idx: usize) {
        let best_symbol = match self.registry.by_index(best_idx) {
            Some(stub) => stub.symbol.clone(),
            None => return,
        };
        let Some(new_price_best) = self.ticker_cache.price(&format!("{best_symbol}{}", self.bridge_symbol)) else {
            return;
        };
        for stub in self.registry.all().to_vec() {
            if stub.idx == best_idx {
                continue;
            }
            if let Some(price_k) = self.ticker_cache.price(&format!("{}{}", stub.symbol, self.bridge_symbol)) {
                self.ratio_matrix.set(best_idx, stub.idx, new_price_best / price_k);
            }
        }
    }

    /// Persist every dirty cell in a single bulk update, then clear the
    /// dirty set. Safe to call even with nothing dirty.
    pub async fn commit_ratios(&mut self) -> Result<()> {
        let batch: Vec<(u64, f64)> = self
            .ratio_matrix
            .get_dirty()
            .map(|(i, j)| (self.ratio_matrix.get_pair_id(i, j), self.ratio_matrix.get(i, j)))
            .collect();
        if !batch.is_empty() {
            self.persistence.pair_ratios_update(&batch).await?;
        }
        self.ratio_matrix.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderExecutor;
    use crate::persistence::json_store::JsonStore;
    use crate::registry::set_coins;
    use crate::types::{OrderReport, OrderSide};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubExecutor {
        next_id: AtomicU64,
        fail_sell: bool,
    }

    #[async_trait]
    impl OrderExecutor for StubExecutor {
        async fn buy_alt(&self, origin: &str, target: &str, _buy_price: f64) -> Result<OrderReport> {
            Ok(OrderReport {
                order_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                symbol: format!("{origin}{target}"),
                side: OrderSide::Buy,
                status: "FILLED".into(),
                executed_qty: 1.0,
                cumulative_quote_qty: 100.0,
                price: 0.0,
            })
        }

        async fn sell_alt(&self, origin: &str, target: &str, _sell_price: f64) -> Result<OrderReport> {
            if self.fail_sell {
                anyhow::bail!("simulated exchange fault");
            }
            Ok(OrderReport {
                order_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                symbol: format!("{origin}{target}"),
                side: OrderSide::Sell,
                status: "FILLED".into(),
                executed_qty: 1.0,
                cumulative_quote_qty: 100.0,
                price: 0.0,
            })
        }

        async fn currency_balance(&self, _symbol: &str, _force: bool) -> Result<f64> {
            Ok(1.0)
        }
    }

    async fn build_controller(executor: Arc<dyn OrderExecutor>) -> (TradeController, tempfile_dir::TempDir) {
        let dir = tempfile_dir::TempDir::new();
        let store: Arc<dyn PersistencePort> = Arc::new(JsonStore::open(dir.path().join("s.json")).unwrap());
        let mut registry = CoinRegistry::new();
        let matrix = set_coins(&*store, &mut registry, &["BTC".into(), "ETH".into()])
            .await
            .unwrap();
        let ticker = Arc::new(TickerCache::new());
        ticker.update("BTCUSDT", 20000.0);
        ticker.update("ETHUSDT", 1500.0);
        let controller = TradeController::new(registry, matrix, executor, store, ticker, "USDT");
        (controller, dir)
    }

    mod tempfile_dir {
        pub struct TempDir(std::path::PathBuf);
        impl TempDir {
            pub fn new() -> Self {
                let dir = std::env::temp_dir().join(format!("ratio-trader-tc-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }
            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }
        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn successful_jump_updates_ratios_and_commits() {
        let executor = Arc::new(StubExecutor {
            next_id: AtomicU64::new(1),
            fail_sell: false,
        });
        let (mut controller, _dir) = build_controller(executor).await;

        controller.jump("BTC", "ETH", 20000.0, 1500.0).await.unwrap();

        let eth_idx = controller.registry().by_symbol("ETH").unwrap().idx;
        let btc_idx = controller.registry().by_symbol("BTC").unwrap().idx;
        assert_eq!(controller.ratio_matrix().get(eth_idx, btc_idx), 1500.0 / 20000.0);
        assert_eq!(controller.ratio_matrix().dirty_len(), 0);
    }

    #[tokio::test]
    async fn failed_sell_rolls_back_ratio_matrix() {
        let executor = Arc::new(StubExecutor {
            next_id: AtomicU64::new(1),
            fail_sell: true,
        });
        let (mut controller, _dir) = build_controller(executor).await;

        let btc_idx = controller.registry().by_symbol("BTC").unwrap().idx;
        let eth_idx = controller.registry().by_symbol("ETH").unwrap().idx;
        controller.ratio_matrix_mut().set(btc_idx, eth_idx, 42.0);

        let err = controller.jump("BTC", "ETH", 20000.0, 1500.0).await;
        assert!(err.is_err());
        assert!(controller.ratio_matrix().get(btc_idx, eth_idx).is_nan());
    }
}
