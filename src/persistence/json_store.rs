// =============================================================================
// JSON-file-backed PersistencePort implementation
// =============================================================================
//
// Coins, pairs, the current-coin log, scout history, coin values, and trades
// all live as top-level arrays in one JSON document, persisted with an
// atomic tmp-file + rename.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Coin, CoinValue, Pair, ScoutHistoryEntry, Trade, TradeState};

use super::{PersistencePort, ValueHistoryPolicy};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    coins: Vec<Coin>,
    pairs: Vec<Pair>,
    current_coin_log: Vec<(chrono::DateTime<chrono::Utc>, String)>,
    scout_history: Vec<ScoutHistoryEntry>,
    coin_values: Vec<CoinValue>,
    trades: Vec<Trade>,
    next_pair_id: u64,
    next_trade_id: u64,
}

/// A single-process, file-backed store implementing `PersistencePort`.
pub struct JsonStore {
    path: PathBuf,
    doc: RwLock<Document>,
}

impl JsonStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Document::default()
        };
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    fn persist(&self, doc: &Document) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl PersistencePort for JsonStore {
    async fn all_coins(&self) -> anyhow::Result<Vec<Coin>> {
        Ok(self.doc.read().coins.clone())
    }

    async fn coins_upsert(&self, symbols: &[String]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        for symbol in symbols {
            match doc.coins.iter_mut().find(|c| &c.symbol == symbol) {
                Some(c) => c.enabled = true,
                None => doc.coins.push(Coin::new(symbol.clone())),
            }
        }
        self.persist(&doc)
    }

    async fn coins_disable(&self, symbols: &[String]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        for c in doc.coins.iter_mut() {
            if symbols.contains(&c.symbol) {
                c.enabled = false;
            }
        }
        self.persist(&doc)
    }

    async fn pairs_upsert_all(&self, pairs: &[(String, String)]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        for (from, to) in pairs {
            let exists = doc
                .pairs
                .iter()
                .any(|p| &p.from_coin == from && &p.to_coin == to);
            if !exists {
                let id = doc.next_pair_id;
                doc.next_pair_id += 1;
                doc.pairs.push(Pair {
                    id,
                    from_coin: from.clone(),
                    to_coin: to.clone(),
                    ratio: None,
                    enabled: true,
                });
            }
        }
        self.persist(&doc)
    }

    async fn pairs_load_enabled(&self) -> anyhow::Result<Vec<(u64, String, String, Option<f64>)>> {
        Ok(self
            .doc
            .read()
            .pairs
            .iter()
            .filter(|p| p.enabled)
            .map(|p| (p.id, p.from_coin.clone(), p.to_coin.clone(), p.ratio))
            .collect())
    }

    async fn current_coin_set(&self, symbol: &str) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        doc.current_coin_log
            .push((chrono::Utc::now(), symbol.to_string()));
        self.persist(&doc)
    }

    async fn current_coin_get(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .doc
            .read()
            .current_coin_log
            .iter()
            .max_by_key(|(dt, _)| *dt)
            .map(|(_, sym)| sym.clone()))
    }

    async fn scout_history_append_batch(&self, rows: &[ScoutHistoryEntry]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        doc.scout_history.extend_from_slice(rows);
        self.persist(&doc)
    }

    async fn coin_value_append_batch(&self, rows: &[CoinValue]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        doc.coin_values.extend_from_slice(rows);
        self.persist(&doc)
    }

    async fn trade_create(&self, from: &str, to: &str, selling: bool) -> anyhow::Result<u64> {
        let mut doc = self.doc.write();
        let id = doc.next_trade_id;
        doc.next_trade_id += 1;
        doc.trades.push(Trade {
            id,
            from_coin: from.to_string(),
            to_coin: to.to_string(),
            selling,
            alt_starting_balance: 0.0,
            crypto_starting_balance: 0.0,
            alt_trade_amount: 0.0,
            crypto_trade_amount: 0.0,
            state: TradeState::Started,
            datetime: chrono::Utc::now(),
        });
        self.persist(&doc)?;
        Ok(id)
    }

    async fn trade_set_ordered(
        &self,
        id: u64,
        alt_start: f64,
        crypto_start: f64,
        alt_trade: f64,
    ) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        if let Some(t) = doc.trades.iter_mut().find(|t| t.id == id) {
            if !t.state.can_advance_to(TradeState::Ordered) {
                anyhow::bail!("trade {id} cannot advance {:?} -> Ordered", t.state);
            }
            t.alt_starting_balance = alt_start;
            t.crypto_starting_balance = crypto_start;
            t.alt_trade_amount = alt_trade;
            t.state = TradeState::Ordered;
        }
        self.persist(&doc)
    }

    async fn trade_set_complete(&self, id: u64, crypto_trade: f64) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        if let Some(t) = doc.trades.iter_mut().find(|t| t.id == id) {
            if !t.state.can_advance_to(TradeState::Complete) {
                anyhow::bail!("trade {id} cannot advance {:?} -> Complete", t.state);
            }
            t.crypto_trade_amount = crypto_trade;
            t.state = TradeState::Complete;
        }
        self.persist(&doc)
    }

    async fn trade_state(&self, id: u64) -> anyhow::Result<Option<TradeState>> {
        Ok(self
            .doc
            .read()
            .trades
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.state))
    }

    async fn pair_ratios_update(&self, batch: &[(u64, f64)]) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        for (pair_id, ratio) in batch {
            if let Some(p) = doc.pairs.iter_mut().find(|p| &p.id == pair_id) {
                p.ratio = Some(*ratio);
            } else {
                warn!(pair_id, "pair_ratios_update: unknown pair id");
            }
        }
        self.persist(&doc)
    }

    async fn prune_scout_history(&self, before: chrono::DateTime<chrono::Utc>) -> anyhow::Result<()> {
        let mut doc = self.doc.write();
        let before_len = doc.scout_history.len();
        doc.scout_history.retain(|row| row.datetime >= before);
        debug!(
            removed = before_len - doc.scout_history.len(),
            "pruned scout history"
        );
        self.persist(&doc)
    }

    async fn prune_value_history(&self, policy: ValueHistoryPolicy) -> anyhow::Result<()> {
        use crate::types::Interval;
        let mut doc = self.doc.write();
        let now = chrono::Utc::now();

        // Promote the latest row per (coin, bucket) to the coarser interval:
        // group by hour/day/week, keep the max datetime per group, bump its
        // interval, then drop anything outside the corresponding window.
        promote_latest_per_bucket(&mut doc.coin_values, Interval::Hourly, |dt| {
            dt.format("%Y-%m-%dT%H").to_string()
        });
        promote_latest_per_bucket(&mut doc.coin_values, Interval::Daily, |dt| {
            dt.format("%Y-%j").to_string()
        });
        promote_latest_per_bucket(&mut doc.coin_values, Interval::Weekly, |dt| {
            dt.format("%Y-W%W").to_string()
        });

        doc.coin_values.retain(|row| match row.interval {
            Interval::Minutely => now - row.datetime < chrono::Duration::days(1),
            Interval::Hourly => now - row.datetime < policy.daily_after,
            Interval::Daily => now - row.datetime < policy.weekly_after,
            Interval::Weekly => true,
        });

        self.persist(&doc)
    }
}

fn promote_latest_per_bucket(
    rows: &mut [CoinValue],
    target: crate::types::Interval,
    bucket_key: impl Fn(chrono::DateTime<chrono::Utc>) -> String,
) {
    use std::collections::HashMap;
    let mut latest_idx: HashMap<(String, String), usize> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let key = (row.coin.clone(), bucket_key(row.datetime));
        latest_idx
            .entry(key)
            .and_modify(|best| {
                if rows[*best].datetime < row.datetime {
                    *best = idx;
                }
            })
            .or_insert(idx);
    }
    for idx in latest_idx.into_values() {
        rows[idx].interval = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coins_upsert_then_disable_round_trips() {
        let dir = tempdir();
        let store = JsonStore::open(dir.join("store.json")).unwrap();
        store
            .coins_upsert(&["BTC".into(), "ETH".into()])
            .await
            .unwrap();
        let coins = store.all_coins().await.unwrap();
        assert_eq!(coins.len(), 2);
        assert!(coins.iter().all(|c| c.enabled));

        store.coins_disable(&["ETH".into()]).await.unwrap();
        let coins = store.all_coins().await.unwrap();
        assert!(coins.iter().find(|c| c.symbol == "ETH").unwrap().enabled == false);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn trade_lifecycle_rejects_out_of_order_transition() {
        let dir = tempdir();
        let store = JsonStore::open(dir.join("store.json")).unwrap();
        let id = store.trade_create("BTC", "ETH", true).await.unwrap();
        assert_eq!(store.trade_state(id).await.unwrap(), Some(TradeState::Started));

        // Skipping straight to Complete must be rejected.
        assert!(store.trade_set_complete(id, 1.0).await.is_err());

        store.trade_set_ordered(id, 1.0, 2.0, 3.0).await.unwrap();
        store.trade_set_complete(id, 4.0).await.unwrap();
        assert_eq!(store.trade_state(id).await.unwrap(), Some(TradeState::Complete));
        let _ = std::fs::remove_dir_all(dir);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ratio-trader-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
