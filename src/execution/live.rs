// =============================================================================
// LiveExecutor — places real orders against the exchange
// =============================================================================
//
// Every buy/sell is wrapped in a fixed retry policy (20 attempts, 1 s sleep
// between attempts) since a market order rejected by a transient exchange
// fault should be retried rather than treated as a decision-level failure.
// After a sell, execution blocks until the balance cache reflects the
// reduced balance (or a 1 s poll forces a REST refresh), mirroring the
// "wait for the fill to actually land" behavior a paper fill gets for free.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::binance::client::BinanceClient;
use crate::execution::{buy_quantity, sell_quantity, side_str, OrderExecutor};
use crate::market_data::BalanceCache;
use crate::persistence::PersistencePort;
use crate::postpone::heavy_call;
use crate::trade_log::TradeLog;
use crate::types::{OrderReport, OrderSide};

const MAX_RETRY_ATTEMPTS: u32 = 20;
const RETRY_SLEEP: Duration = Duration::from_secs(1);

pub struct LiveExecutor {
    client: Arc<BinanceClient>,
    balance_cache: Arc<BalanceCache>,
    persistence: Arc<dyn PersistencePort>,
    tick_cache: RwLock<HashMap<(String, String), i32>>,
}

impl LiveExecutor {
    pub fn new(
        client: Arc<BinanceClient>,
        balance_cache: Arc<BalanceCache>,
        persistence: Arc<dyn PersistencePort>,
    ) -> Self {
        Self {
            client,
            balance_cache,
            persistence,
            tick_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn lot_size_tick(&self, origin: &str, target: &str) -> Result<i32> {
        let key = (origin.to_string(), target.to_string());
        if let Some(&tick) = self.tick_cache.read().get(&key) {
            return Ok(tick);
        }
        let tick = self.client.get_lot_size_tick(origin, target).await?;
        self.tick_cache.write().insert(key, tick);
        Ok(tick)
    }

    async fn retry_order<'a, F, Fut>(&'a self, op: F) -> Result<serde_json::Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value>>,
    {
        let mut last_err = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, max = MAX_RETRY_ATTEMPTS, error = %e, "order attempt failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("order retries exhausted")))
    }

    fn parse_report(symbol: &str, side: OrderSide, value: &serde_json::Value) -> Result<OrderReport> {
        Ok(OrderReport {
            order_id: value["orderId"].as_u64().unwrap_or(0),
            symbol: symbol.to_string(),
            side,
            status: value["status"].as_str().unwrap_or("UNKNOWN").to_string(),
            executed_qty: value["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            cumulative_quote_qty: value["cummulativeQuoteQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            price: value["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
    }
}

#[async_trait::async_trait]
impl OrderExecutor for LiveExecutor {
    async fn currency_balance(&self, symbol: &str, force: bool) -> Result<f64> {
        let cached = self.balance_cache.get(symbol);
        if !force && cached != 0.0 {
            return Ok(cached);
        }
        let account = self.client.get_account().await.context("fetch account balances")?;
        let balances = account["balances"]
            .as_array()
            .context("account response missing balances")?;
        let parsed: Vec<crate::types::BalanceInfo> = balances
            .iter()
            .map(|b| crate::types::BalanceInfo {
                asset: b["asset"].as_str().unwrap_or_default().to_string(),
                free: b["free"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })
            .collect();
        self.balance_cache.replace_all(&parsed);
        Ok(self.balance_cache.get(symbol))
    }

    async fn buy_alt(&self, origin: &str, target: &str, buy_price: f64) -> Result<OrderReport> {
        let origin_balance = self.currency_balance(origin, false).await?;
        let target_balance = self.currency_balance(target, false).await?;
        let tick = self.lot_size_tick(origin, target).await?;
        let order_quantity = buy_quantity(target_balance, buy_price, tick);
        let symbol = format!("{origin}{target}");

        info!(symbol = %symbol, quantity = order_quantity, "buying");
        let value = self
            .retry_order(|| {
                let client = self.client.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .place_market_order(&symbol, side_str(OrderSide::Buy), None, Some(target_balance))
                        .await
                }
            })
            .await?;

        let mut report = Self::parse_report(&symbol, OrderSide::Buy, &value)?;
        let mut filled_quantity = order_quantity;
        if report.executed_qty > 0.0 && report.status == "FILLED" {
            filled_quantity = report.executed_qty;
        }
        report.executed_qty = filled_quantity;
        info!(symbol = %symbol, "bought");

        let persistence = self.persistence.clone();
        let origin_owned = origin.to_string();
        let target_owned = target.to_string();
        let quote_qty = report.cumulative_quote_qty;
        heavy_call(move || async move {
            if let Ok(log) = TradeLog::start(persistence, &origin_owned, &target_owned, false).await {
                let _ = log.set_ordered(origin_balance, target_balance, filled_quantity).await;
                let _ = log.set_complete(quote_qty).await;
            }
        })
        .await;

        Ok(report)
    }

    async fn sell_alt(&self, origin: &str, target: &str, sell_price: f64) -> Result<OrderReport> {
        let origin_balance = self.currency_balance(origin, false).await?;
        let target_balance = self.currency_balance(target, false).await?;
        let tick = self.lot_size_tick(origin, target).await?;
        let order_quantity = sell_quantity(origin_balance, tick);
        let symbol = format!("{origin}{target}");

        info!(symbol = %symbol, quantity = order_quantity, "selling");
        let value = self
            .retry_order(|| {
                let client = self.client.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .place_market_order(&symbol, side_str(OrderSide::Sell), Some(order_quantity), None)
                        .await
                }
            })
            .await?;

        let report = Self::parse_report(&symbol, OrderSide::Sell, &value)?;

        // Block until the fill is reflected in the balance cache, forcing a
        // REST refresh if a full second passes without a balance-changed
        // notification.
        let mut new_balance = self.currency_balance(origin, false).await?;
        while new_balance >= origin_balance {
            let changed = tokio::time::timeout(Duration::from_secs(1), self.balance_cache.wait_for_change())
                .await
                .is_ok();
            new_balance = self.currency_balance(origin, !changed).await?;
        }
        info!(symbol = %symbol, "sold");

        let persistence = self.persistence.clone();
        let origin_owned = origin.to_string();
        let target_owned = target.to_string();
        let quote_qty = report.cumulative_quote_qty;
        let sell_quantity = order_quantity;
        let _ = sell_price;
        heavy_call(move || async move {
            if let Ok(log) = TradeLog::start(persistence, &origin_owned, &target_owned, true).await {
                let _ = log.set_ordered(origin_balance, target_balance, sell_quantity).await;
                let _ = log.set_complete(quote_qty).await;
            }
        })
        .await;

        Ok(report)
    }
}
