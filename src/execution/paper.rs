// =============================================================================
// PaperExecutor — simulated order fills against a JSON-persisted wallet
// =============================================================================
//
// Fills happen instantly at the quoted price; no slippage, no partial fills.
// Both sides apply a 0.999 multiplier to the leg the wallet receives (a flat
// 0.1% simulated fee), matching a conservative paper-trading assumption. The
// wallet is flushed to disk only after a buy completes — a sell's balance
// change is visible to the in-process cache immediately but isn't persisted
// until the next buy. This quirk is intentional: see DESIGN.md.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::execution::OrderExecutor;
use crate::types::{OrderReport, OrderSide};

const FEE_MULTIPLIER: f64 = 0.999;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletDocument {
    balances: HashMap<String, f64>,
    fake_order_id: u64,
}

pub struct PaperExecutor {
    bridge_symbol: String,
    path: PathBuf,
    balances: RwLock<HashMap<String, f64>>,
    fake_order_id: AtomicU64,
}

impl PaperExecutor {
    pub fn new(bridge_symbol: impl Into<String>, path: impl AsRef<Path>, initial: HashMap<String, f64>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (balances, fake_order_id) = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<WalletDocument>(&raw) {
                Ok(doc) => (doc.balances, doc.fake_order_id),
                Err(_) => (initial, 0),
            },
            Err(_) => (initial, 0),
        };
        Self {
            bridge_symbol: bridge_symbol.into(),
            path,
            balances: RwLock::new(balances),
            fake_order_id: AtomicU64::new(fake_order_id),
        }
    }

    fn persist(&self) -> Result<()> {
        let doc = WalletDocument {
            balances: self.balances.read().clone(),
            fake_order_id: self.fake_order_id.load(Ordering::SeqCst),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn balance_of(&self, asset: &str) -> f64 {
        self.balances.read().get(asset).copied().unwrap_or(0.0)
    }

    fn next_order_id(&self) -> u64 {
        self.fake_order_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bridge_symbol(&self) -> &str {
        &self.bridge_symbol
    }
}

#[async_trait::async_trait]
impl OrderExecutor for PaperExecutor {
    async fn currency_balance(&self, symbol: &str, _force: bool) -> Result<f64> {
        Ok(self.balance_of(symbol))
    }

    async fn buy_alt(&self, origin: &str, target: &str, buy_price: f64) -> Result<OrderReport> {
        let target_balance = self.balance_of(target);
        let quantity = target_balance / buy_price;

        {
            let mut balances = self.balances.write();
            *balances.entry(target.to_string()).or_insert(0.0) -= target_balance;
            *balances.entry(origin.to_string()).or_insert(0.0) += quantity * FEE_MULTIPLIER;
        }
        let order_id = self.next_order_id();
        self.persist()?;
        info!(origin, target, quantity, "paper buy filled");

        Ok(OrderReport {
            order_id,
            symbol: format!("{origin}{target}"),
            side: OrderSide::Buy,
            status: "FILLED".to_string(),
            executed_qty: quantity,
            cumulative_quote_qty: target_balance,
            price: 0.0,
        })
    }

    async fn sell_alt(&self, origin: &str, target: &str, sell_price: f64) -> Result<OrderReport> {
        let origin_balance = self.balance_of(origin);
        let quote_quantity = sell_price * origin_balance;

        {
            let mut balances = self.balances.write();
            *balances.entry(origin.to_string()).or_insert(0.0) -= origin_balance;
            *balances.entry(target.to_string()).or_insert(0.0) += quote_quantity * FEE_MULTIPLIER;
        }
        let order_id = self.next_order_id();
        // A sell does not persist the wallet to disk immediately.
        info!(origin, target, origin_balance, "paper sell filled");

        Ok(OrderReport {
            order_id,
            symbol: format!("{origin}{target}"),
            side: OrderSide::Sell,
            status: "FILLED".to_string(),
            executed_qty: origin_balance,
            cumulative_quote_qty: quote_quantity,
            price: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ratio-trader-paper-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn buy_applies_fee_multiplier_and_persists() {
        let dir = tempdir();
        let mut initial = HashMap::new();
        initial.insert("USDT".to_string(), 100.0);
        let executor = PaperExecutor::new("USDT", dir.join("wallet.json"), initial);

        let report = executor.buy_alt("BTC", "USDT", 10.0).await.unwrap();
        assert_eq!(report.executed_qty, 10.0 * FEE_MULTIPLIER);
        assert_eq!(executor.currency_balance("USDT", false).await.unwrap(), 0.0);
        assert!(dir.join("wallet.json").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn sell_credits_bridge_with_fee_multiplier() {
        let dir = tempdir();
        let mut initial = HashMap::new();
        initial.insert("BTC".to_string(), 2.0);
        let executor = PaperExecutor::new("USDT", dir.join("wallet.json"), initial);

        let report = executor.sell_alt("BTC", "USDT", 10.0).await.unwrap();
        assert_eq!(report.cumulative_quote_qty, 20.0);
        let usdt = executor.currency_balance("USDT", false).await.unwrap();
        assert_eq!(usdt, 20.0 * FEE_MULTIPLIER);
        assert_eq!(executor.currency_balance("BTC", false).await.unwrap(), 0.0);
        let _ = std::fs::remove_dir_all(dir);
    }
}
