// =============================================================================
// PersistencePort — the interface the core requires of a relational store
// =============================================================================
//
// The concrete relational store lives behind this trait; the core only ever
// talks to `PersistencePort`. `json_store` is a file-backed JSON
// implementation rather than a SQL database — see DESIGN.md for why.
// =============================================================================

pub mod json_store;

use async_trait::async_trait;

use crate::types::{Coin, CoinValue, ScoutHistoryEntry, TradeState};

/// Roll-up policy applied to `coin_values` on prune.
#[derive(Debug, Clone, Copy)]
pub struct ValueHistoryPolicy {
    pub hourly_after: chrono::Duration,
    pub daily_after: chrono::Duration,
    pub weekly_after: chrono::Duration,
}

impl Default for ValueHistoryPolicy {
    fn default() -> Self {
        Self {
            hourly_after: chrono::Duration::days(1),
            daily_after: chrono::Duration::days(30),
            weekly_after: chrono::Duration::days(365),
        }
    }
}

/// The persistence operations the decision core requires.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn all_coins(&self) -> anyhow::Result<Vec<Coin>>;
    async fn coins_upsert(&self, symbols: &[String]) -> anyhow::Result<()>;
    async fn coins_disable(&self, symbols: &[String]) -> anyhow::Result<()>;

    /// Ensure a `Pair` row exists for each `(from, to)` tuple; a no-op for
    /// pairs that already exist.
    async fn pairs_upsert_all(&self, pairs: &[(String, String)]) -> anyhow::Result<()>;

    /// Load every enabled pair as `(id, from, to, ratio)`.
    async fn pairs_load_enabled(&self) -> anyhow::Result<Vec<(u64, String, String, Option<f64>)>>;

    async fn current_coin_set(&self, symbol: &str) -> anyhow::Result<()>;
    async fn current_coin_get(&self) -> anyhow::Result<Option<String>>;

    async fn scout_history_append_batch(&self, rows: &[ScoutHistoryEntry]) -> anyhow::Result<()>;
    async fn coin_value_append_batch(&self, rows: &[CoinValue]) -> anyhow::Result<()>;

    /// Create a new trade in the `STARTED` state, returning its id.
    async fn trade_create(&self, from: &str, to: &str, selling: bool) -> anyhow::Result<u64>;
    async fn trade_set_ordered(
        &self,
        id: u64,
        alt_start: f64,
        crypto_start: f64,
        alt_trade: f64,
    ) -> anyhow::Result<()>;
    async fn trade_set_complete(&self, id: u64, crypto_trade: f64) -> anyhow::Result<()>;
    async fn trade_state(&self, id: u64) -> anyhow::Result<Option<TradeState>>;

    /// Bulk-update `(pair_id, ratio)` in a single call.
    async fn pair_ratios_update(&self, batch: &[(u64, f64)]) -> anyhow::Result<()>;

    async fn prune_scout_history(&self, before: chrono::DateTime<chrono::Utc>) -> anyhow::Result<()>;
    async fn prune_value_history(&self, policy: ValueHistoryPolicy) -> anyhow::Result<()>;
}
