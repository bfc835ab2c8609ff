// =============================================================================
// Backtest driver — replays historical minute bars through the same decision
// core used live
// =============================================================================
//
// Walks the clock forward one minute at a time, feeding each symbol's
// historical price into the same `TickerCache` the live mini-ticker stream
// writes to, then running one scout tick. Cooperative yielding back to the
// runtime happens every `yield_interval` ticks rather than every tick, so a
// long backtest doesn't starve other tasks on the executor but also doesn't
// pay a yield's scheduling overhead on every single minute.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::market_data::historical::{HistoricalPriceProvider, KlineFetcher};
use crate::market_data::TickerCache;
use crate::scout::ScoutEngine;
use crate::trade_controller::TradeController;

#[derive(Debug, Clone, Copy)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// How many simulated minutes elapse between cooperative yields.
    pub yield_interval: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BacktestReport {
    pub ticks: u64,
    pub jumps: u64,
}

/// Runs one simulated minute at a time over `[config.start, config.end]`,
/// updating `ticker_cache` from `provider` and driving `scout`/`controller`
/// exactly as the live scheduler's scout job would.
pub async fn run_backtest<F: KlineFetcher>(
    provider: &HistoricalPriceProvider<F>,
    ticker_cache: &TickerCache,
    scout: &ScoutEngine,
    controller: &mut TradeController,
    symbols: &[String],
    bridge_symbol: &str,
    config: BacktestConfig,
) -> Result<BacktestReport> {
    let mut report = BacktestReport::default();
    let mut clock = config.start;
    let mut n: u32 = 0;

    while clock <= config.end {
        for symbol in symbols {
            if let Some(price) = provider.price_at(symbol, clock).await? {
                ticker_cache.update(&format!("{symbol}{bridge_symbol}"), price);
            }
        }

        if scout.tick(controller).await? {
            report.jumps += 1;
        }
        report.ticks += 1;

        n += 1;
        if config.yield_interval > 0 && n % config.yield_interval == 0 {
            debug!(tick = n, "backtest driver yielding");
            tokio::task::yield_now().await;
        }

        clock += Duration::minutes(1);
    }

    info!(ticks = report.ticks, jumps = report.jumps, "backtest run complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderExecutor;
    use crate::fees::FixedFeeProvider;
    use crate::market_data::historical::HistoricalBar;
    use crate::market_data::StreamPlane;
    use crate::persistence::json_store::JsonStore;
    use crate::registry::{set_coins, CoinRegistry};
    use crate::strategy::DefaultRatioJumpStrategy;
    use crate::types::OrderReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl KlineFetcher for ScriptedFetcher {
        async fn fetch_klines(
            &self,
            _symbol: &str,
            start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<HistoricalBar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![HistoricalBar {
                open_time: start,
                open_price: 100.0,
            }])
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl OrderExecutor for NoopExecutor {
        async fn buy_alt(&self, _origin: &str, _target: &str, _price: f64) -> Result<OrderReport> {
            anyhow::bail!("not used in this test")
        }
        async fn sell_alt(&self, _origin: &str, _target: &str, _price: f64) -> Result<OrderReport> {
            anyhow::bail!("not used in this test")
        }
        async fn currency_balance(&self, _symbol: &str, _force: bool) -> Result<f64> {
            Ok(0.0)
        }
    }

    struct NoopTickerFetcher;

    #[async_trait]
    impl crate::market_data::TickerFetcher for NoopTickerFetcher {
        async fn fetch_all_prices(&self) -> Result<Vec<(String, f64)>> {
            anyhow::bail!("no network access in tests")
        }
    }

    struct TempDir(std::path::PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("ratio-trader-backtest-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn yields_on_every_nth_tick_not_every_other_tick() {
        let dir = TempDir::new();
        let persistence = Arc::new(JsonStore::open(dir.0.join("s.json")).unwrap());
        let mut registry = CoinRegistry::new();
        let symbols = vec!["ETH".to_string()];
        let ratio_matrix = set_coins(persistence.as_ref(), &mut registry, &symbols).await.unwrap();

        let ticker_cache = Arc::new(TickerCache::new());
        let balance_cache = Arc::new(crate::market_data::BalanceCache::new());
        let plane = Arc::new(StreamPlane::new(&symbols, ticker_cache.clone(), balance_cache));

        let mut controller = TradeController::new(
            registry,
            ratio_matrix,
            Arc::new(NoopExecutor),
            persistence.clone(),
            ticker_cache.clone(),
            "USDT",
        );

        let scout = ScoutEngine::new(
            ticker_cache.clone(),
            Arc::new(NoopTickerFetcher),
            plane,
            persistence.clone(),
            Arc::new(FixedFeeProvider::default()),
            Arc::new(DefaultRatioJumpStrategy),
            "USDT",
            0.0,
            false,
        );

        let fetcher = ScriptedFetcher { calls: AtomicU32::new(0) };
        let provider = HistoricalPriceProvider::new(fetcher);

        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let config = BacktestConfig {
            start,
            end: start + Duration::minutes(4),
            yield_interval: 2,
        };

        let report = run_backtest(&provider, &ticker_cache, &scout, &mut controller, &symbols, "USDT", config)
            .await
            .unwrap();

        assert_eq!(report.ticks, 5);
    }
}
