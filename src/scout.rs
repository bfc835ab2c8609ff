// =============================================================================
// ScoutEngine — per-tick evaluation of every enabled coin's jump candidates
// =============================================================================
//
// For each enabled coin, in watchlist order: skip if the bridge pair is
// unknown or too thin, skip if below the exchange minimum notional, else
// compare its current bridge-priced ratio against every other enabled
// coin's recorded target ratio. The candidate with the largest positive
// deviation becomes a jump; at most one jump fires per tick. Once the
// watchlist is exhausted, the bridge currency itself is evaluated the same
// way, skipping the minimum-notional check.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::execution::estimate_fee_rate;
use crate::fees::FeeProvider;
use crate::market_data::{StreamPlane, TickerCache, TickerFetcher};
use crate::persistence::PersistencePort;
use crate::strategy::StrategyPort;
use crate::trade_controller::TradeController;
use crate::types::ScoutHistoryEntry;

const MIN_NOTIONAL_CACHE_TTL: Duration = Duration::from_secs(12 * 3600);

pub struct ScoutEngine {
    ticker_cache: Arc<TickerCache>,
    ticker_fetcher: Arc<dyn TickerFetcher>,
    stream_plane: Arc<StreamPlane>,
    persistence: Arc<dyn PersistencePort>,
    fees: Arc<dyn FeeProvider>,
    strategy: Arc<dyn StrategyPort>,
    bridge_symbol: String,
    scout_margin: f64,
    use_margin: bool,
    min_notional_cache: RwLock<HashMap<String, (f64, Instant)>>,
}

struct Candidate {
    symbol: String,
    ratio_diff: f64,
    price: f64,
}

impl ScoutEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticker_cache: Arc<TickerCache>,
        ticker_fetcher: Arc<dyn TickerFetcher>,
        stream_plane: Arc<StreamPlane>,
        persistence: Arc<dyn PersistencePort>,
        fees: Arc<dyn FeeProvider>,
        strategy: Arc<dyn StrategyPort>,
        bridge_symbol: impl Into<String>,
        scout_margin: f64,
        use_margin: bool,
    ) -> Self {
        Self {
            ticker_cache,
            ticker_fetcher,
            stream_plane,
            persistence,
            fees,
            strategy,
            bridge_symbol: bridge_symbol.into(),
            scout_margin,
            use_margin,
            min_notional_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn min_notional(&self, symbol: &str) -> Result<f64> {
        if let Some((v, at)) = self.min_notional_cache.read().get(symbol).copied() {
            if at.elapsed() < MIN_NOTIONAL_CACHE_TTL {
                return Ok(v);
            }
        }
        let v = self.fees.min_notional(symbol).await?;
        self.min_notional_cache.write().insert(symbol.to_string(), (v, Instant::now()));
        Ok(v)
    }

    /// `(1 - fee(current, bridge, selling)) * (1 - fee(bridge, other, buying))`,
    /// or 1.0 when margin-adjustment is disabled.
    async fn fees_factor(&self, controller: &TradeController, current_symbol: &str, other_symbol: &str) -> Result<f64> {
        if !self.use_margin {
            return Ok(1.0);
        }
        let sell_fee = self.fee_rate(controller, &format!("{current_symbol}{}", self.bridge_symbol), current_symbol).await?;
        let buy_fee = self.fee_rate(controller, &format!("{}{other_symbol}", self.bridge_symbol), other_symbol).await?;
        Ok((1.0 - sell_fee) * (1.0 - buy_fee))
    }

    /// Same as `fees_factor` but for the bridge-as-current-coin case, where
    /// the "sell" leg is a no-op (the bridge is already held).
    async fn fees_factor_from_bridge(&self, controller: &TradeController, other_symbol: &str) -> Result<f64> {
        if !self.use_margin {
            return Ok(1.0);
        }
        let buy_fee = self.fee_rate(controller, &format!("{}{other_symbol}", self.bridge_symbol), other_symbol).await?;
        Ok(1.0 - buy_fee)
    }

    async fn fee_rate(&self, controller: &TradeController, trading_symbol: &str, priced_symbol: &str) -> Result<f64> {
        let base_fee = self.fees.taker_fee(trading_symbol).await?;
        let uses_bnb = self.fees.uses_bnb_for_fees().await?;
        let bnb_balance = controller.executor().currency_balance("BNB", false).await.unwrap_or(0.0);
        let origin_price_in_bnb = price_in_bnb(&self.ticker_cache, priced_symbol, &self.bridge_symbol);
        Ok(estimate_fee_rate(base_fee, uses_bnb, 1.0, priced_symbol, origin_price_in_bnb, bnb_balance))
    }

    /// Compare `current_symbol` against every other enabled coin. Seeds any
    /// uninitialized target ratio to the current observed ratio and skips
    /// evaluating that pair this tick (nothing to beat yet).
    async fn jump_to_best_coin(
        &self,
        controller: &mut TradeController,
        current_symbol: &str,
        current_idx: usize,
        price: f64,
    ) -> Result<(Option<Candidate>, Vec<ScoutHistoryEntry>)> {
        let mut best: Option<Candidate> = None;
        let mut observations = Vec::new();
        let others = controller.registry().all().to_vec();

        for stub in &others {
            if stub.idx == current_idx {
                continue;
            }
            let symbol = format!("{}{}", stub.symbol, self.bridge_symbol);
            let Some(p_other) = self.ticker_cache.price_or_refetch(&symbol, self.ticker_fetcher.as_ref()).await? else {
                continue;
            };
            let current_ratio = price / p_other;

            let target_ratio = controller.ratio_matrix().get(current_idx, stub.idx);
            if target_ratio.is_nan() {
                controller.ratio_matrix_mut().set(current_idx, stub.idx, current_ratio);
                continue;
            }

            let fees_factor = self.fees_factor(controller, current_symbol, &stub.symbol).await?;
            let scout_margin_factor = self.strategy.scout_margin_factor(self.scout_margin, fees_factor);
            let ratio_diff = (current_ratio - target_ratio * scout_margin_factor) / target_ratio;

            observations.push(ScoutHistoryEntry {
                pair_id: controller.ratio_matrix().get_pair_id(current_idx, stub.idx),
                ratio_diff,
                target_ratio,
                current_coin_price: price,
                other_coin_price: p_other,
                datetime: chrono::Utc::now(),
            });

            if ratio_diff > 0.0 && best.as_ref().map(|b| ratio_diff > b.ratio_diff).unwrap_or(true) {
                best = Some(Candidate {
                    symbol: stub.symbol.clone(),
                    ratio_diff,
                    price: p_other,
                });
            }
        }
        Ok((best, observations))
    }

    /// Run one scout tick. Returns `true` if a jump was initiated.
    pub async fn tick(&self, controller: &mut TradeController) -> Result<bool> {
        let mut history = Vec::new();
        let coins = controller.registry().all().to_vec();

        for stub in &coins {
            let bal = controller.executor().currency_balance(&stub.symbol, false).await?;
            let symbol = format!("{}{}", stub.symbol, controller.bridge_symbol());
            let Some(cache) = self.stream_plane.depth_cache_snapshot(&symbol) else {
                debug!(symbol, "skipping scout -- pair unknown");
                continue;
            };
            let (price, _quote) = cache.market_sell_price(bal);
            let Some(price) = price else {
                debug!(symbol, "skipping scout -- book too thin to price");
                continue;
            };
            if price * bal < self.min_notional(&symbol).await? {
                continue;
            }

            let (best, observations) = self.jump_to_best_coin(controller, &stub.symbol, stub.idx, price).await?;
            history.extend(observations);

            if let Some(candidate) = best {
                if !history.is_empty() {
                    let _ = self.persistence.scout_history_append_batch(&history).await;
                }
                info!(from = %stub.symbol, to = %candidate.symbol, ratio_diff = candidate.ratio_diff, "coin jump selected");
                controller.jump(&stub.symbol, &candidate.symbol, price, candidate.price).await?;
                return Ok(true);
            }
        }

        if !history.is_empty() {
            let _ = self.persistence.scout_history_append_batch(&history).await;
        }
        controller.commit_ratios().await?;

        self.bridge_scout(controller).await
    }

    /// After the watchlist is exhausted, evaluate a jump from the bridge
    /// itself, skipping the minimum-notional check.
    async fn bridge_scout(&self, controller: &mut TradeController) -> Result<bool> {
        let bal = controller.executor().currency_balance(controller.bridge_symbol(), false).await?;
        if bal <= 0.0 {
            return Ok(false);
        }
        if !controller.bridge_ratios().iter().any(|r| !r.is_nan()) {
            return Ok(false);
        }

        let coins = controller.registry().all().to_vec();
        let mut best: Option<Candidate> = None;

        for stub in &coins {
            let symbol = format!("{}{}", stub.symbol, self.bridge_symbol);
            let Some(p_other) = self.ticker_cache.price_or_refetch(&symbol, self.ticker_fetcher.as_ref()).await? else {
                continue;
            };
            let current_ratio = 1.0 / p_other;

            let target_ratio = controller.bridge_ratios()[stub.idx];
            if target_ratio.is_nan() {
                controller.set_bridge_ratio(stub.idx, current_ratio);
                continue;
            }

            let fees_factor = self.fees_factor_from_bridge(controller, &stub.symbol).await?;
            let scout_margin_factor = self.strategy.scout_margin_factor(self.scout_margin, fees_factor);
            let ratio_diff = (current_ratio - target_ratio * scout_margin_factor) / target_ratio;

            if ratio_diff > 0.0 && best.as_ref().map(|b| ratio_diff > b.ratio_diff).unwrap_or(true) {
                best = Some(Candidate {
                    symbol: stub.symbol.clone(),
                    ratio_diff,
                    price: p_other,
                });
            }
        }

        if let Some(candidate) = best {
            info!(to = %candidate.symbol, ratio_diff = candidate.ratio_diff, "bridge jump selected");
            controller.jump_from_bridge(&candidate.symbol, candidate.price).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn price_in_bnb(ticker: &TickerCache, symbol: &str, bridge: &str) -> Option<f64> {
    if symbol == "BNB" {
        return Some(1.0);
    }
    if let Some(direct) = ticker.price(&format!("{symbol}BNB")) {
        return Some(direct);
    }
    let bridge_price = ticker.price(&format!("{symbol}{bridge}"))?;
    let bnb_bridge_price = ticker.price(&format!("BNB{bridge}"))?;
    Some(bridge_price / bnb_bridge_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderExecutor;
    use crate::fees::FixedFeeProvider;
    use crate::market_data::depth_cache::{DepthEvent, DepthSnapshot, SnapshotFetcher};
    use crate::market_data::BalanceCache;
    use crate::persistence::json_store::JsonStore;
    use crate::registry::{set_coins, CoinRegistry};
    use crate::strategy::DefaultRatioJumpStrategy;
    use crate::types::{OrderReport, OrderSide};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FakeExecutor {
        balances: parking_lot::RwLock<HashMap<String, f64>>,
        next_id: AtomicU64,
    }

    #[async_trait]
    impl OrderExecutor for FakeExecutor {
        async fn buy_alt(&self, origin: &str, target: &str, _buy_price: f64) -> Result<OrderReport> {
            self.balances.write().insert(target.to_string(), 0.0);
            *self.balances.write().entry(origin.to_string()).or_insert(0.0) += 1.0;
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
            let bal = self.balances.read().get(origin).copied().unwrap_or(0.0);
            self.balances.write().insert(origin.to_string(), 0.0);
            *self.balances.write().entry(target.to_string()).or_insert(0.0) += 100.0;
            Ok(OrderReport {
                order_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                symbol: format!("{origin}{target}"),
                side: OrderSide::Sell,
                status: "FILLED".into(),
                executed_qty: bal,
                cumulative_quote_qty: 100.0,
                price: 0.0,
            })
        }

        async fn currency_balance(&self, symbol: &str, _force: bool) -> Result<f64> {
            Ok(self.balances.read().get(symbol).copied().unwrap_or(0.0))
        }
    }

    struct DummyFetcher;

    #[async_trait]
    impl SnapshotFetcher for DummyFetcher {
        async fn fetch_snapshot(&self, _symbol: &str) -> Result<DepthSnapshot> {
            anyhow::bail!("no network access in tests")
        }
    }

    #[async_trait]
    impl TickerFetcher for DummyFetcher {
        async fn fetch_all_prices(&self) -> Result<Vec<(String, f64)>> {
            anyhow::bail!("no network access in tests")
        }
    }

    struct TmpDir(std::path::PathBuf);
    impl TmpDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("ratio-trader-scout-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }
    impl Drop for TmpDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn build(
        balances: HashMap<String, f64>,
    ) -> (ScoutEngine, TradeController, Arc<StreamPlane>, Arc<TickerCache>, Arc<dyn PersistencePort>, TmpDir) {
        let dir = TmpDir::new();
        let store: Arc<dyn PersistencePort> = Arc::new(JsonStore::open(dir.0.join("s.json")).unwrap());
        let mut registry = CoinRegistry::new();
        let matrix = set_coins(&*store, &mut registry, &["BTC".into(), "ETH".into(), "BNB".into()])
            .await
            .unwrap();
        let ticker = Arc::new(TickerCache::new());
        ticker.update("BTCUSDT", 20000.0);
        ticker.update("ETHUSDT", 1500.0);
        ticker.update("BNBUSDT", 300.0);
        let balance_cache = Arc::new(BalanceCache::new());
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "BNBUSDT".to_string()];
        let plane = Arc::new(StreamPlane::new(&symbols, ticker.clone(), balance_cache));

        let dummy_fetcher = Arc::new(DummyFetcher);
        let fetcher: Arc<dyn SnapshotFetcher> = dummy_fetcher.clone();
        let plane_for_listener = plane.clone();
        tokio::spawn(async move { plane_for_listener.run_depth_listener(fetcher).await });

        // first_update_id/final_update_id of 0 match the manager's initial
        // last_update_id of -1, so this applies cleanly with no resync.
        plane.push_depth_event(
            "BTCUSDT".to_string(),
            DepthEvent {
                first_update_id: 0,
                final_update_id: 0,
                bids: vec![(20000.0, 10.0)],
                asks: vec![(20001.0, 10.0)],
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let executor: Arc<dyn OrderExecutor> = Arc::new(FakeExecutor {
            balances: parking_lot::RwLock::new(balances),
            next_id: AtomicU64::new(1),
        });
        let controller = TradeController::new(registry, matrix, executor, store.clone(), ticker.clone(), "USDT");
        let fees: Arc<dyn FeeProvider> = Arc::new(FixedFeeProvider { taker_fee: 0.0 });
        let strategy: Arc<dyn StrategyPort> = Arc::new(DefaultRatioJumpStrategy);
        let ticker_fetcher: Arc<dyn TickerFetcher> = dummy_fetcher;
        let scout = ScoutEngine::new(
            ticker.clone(),
            ticker_fetcher,
            plane.clone(),
            store.clone(),
            fees,
            strategy,
            "USDT",
            0.0,
            false,
        );
        (scout, controller, plane, ticker, store, dir)
    }

    #[tokio::test]
    async fn first_tick_seeds_ratios_without_trading() {
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), 1.0);
        let (scout, mut controller, _plane, _ticker, _store, _dir) = build(balances).await;

        let jumped = scout.tick(&mut controller).await.unwrap();
        assert!(!jumped);

        let btc_idx = controller.registry().by_symbol("BTC").unwrap().idx;
        let eth_idx = controller.registry().by_symbol("ETH").unwrap().idx;
        assert_eq!(controller.ratio_matrix().get(btc_idx, eth_idx), 20000.0 / 1500.0);
    }

    #[tokio::test]
    async fn price_drop_after_seeding_triggers_exactly_one_jump() {
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), 1.0);
        let (scout, mut controller, _plane, ticker, store, _dir) = build(balances).await;

        // Seed the matrix first, as a real first tick would (S1 scenario).
        scout.tick(&mut controller).await.unwrap();

        // ETH drops: BTC->ETH ratio_diff = (20000/1400 - 13.33)/13.33 > 0.
        ticker.update("ETHUSDT", 1400.0);

        let jumped = scout.tick(&mut controller).await.unwrap();
        assert!(jumped);
        assert_eq!(store.current_coin_get().await.unwrap(), Some("ETH".to_string()));
    }

    #[tokio::test]
    async fn bridge_scout_does_nothing_without_a_recorded_target() {
        let balances = HashMap::new();
        let (scout, mut controller, _plane, _ticker, _store, _dir) = build(balances).await;

        let jumped = scout.bridge_scout(&mut controller).await.unwrap();
        assert!(!jumped);
    }
}
