// =============================================================================
// TradeLog — three-state append-only trade record
// =============================================================================
//
// A thin wrapper that creates a `Trade` row in the `STARTED` state and then
// carries its id forward through `set_ordered`/`set_complete`, so the caller
// never has to thread the id itself.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;

use crate::persistence::PersistencePort;

pub struct TradeLog {
    persistence: Arc<dyn PersistencePort>,
    trade_id: u64,
}

impl TradeLog {
    pub async fn start(
        persistence: Arc<dyn PersistencePort>,
        from_coin: &str,
        to_coin: &str,
        selling: bool,
    ) -> Result<Self> {
        let trade_id = persistence.trade_create(from_coin, to_coin, selling).await?;
        Ok(Self {
            persistence,
            trade_id,
        })
    }

    pub async fn set_ordered(
        &self,
        alt_starting_balance: f64,
        crypto_starting_balance: f64,
        alt_trade_amount: f64,
    ) -> Result<()> {
        self.persistence
            .trade_set_ordered(
                self.trade_id,
                alt_starting_balance,
                crypto_starting_balance,
                alt_trade_amount,
            )
            .await
    }

    pub async fn set_complete(&self, crypto_trade_amount: f64) -> Result<()> {
        self.persistence
            .trade_set_complete(self.trade_id, crypto_trade_amount)
            .await
    }

    pub fn trade_id(&self) -> u64 {
        self.trade_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::json_store::JsonStore;

    #[tokio::test]
    async fn start_then_ordered_then_complete_round_trips() {
        let dir = std::env::temp_dir().join(format!("ratio-trader-tl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store: Arc<dyn PersistencePort> = Arc::new(JsonStore::open(dir.join("s.json")).unwrap());

        let log = TradeLog::start(store.clone(), "BTC", "USDT", true).await.unwrap();
        log.set_ordered(1.0, 2.0, 3.0).await.unwrap();
        log.set_complete(4.0).await.unwrap();

        assert_eq!(
            store.trade_state(log.trade_id()).await.unwrap(),
            Some(crate::types::TradeState::Complete)
        );
        let _ = std::fs::remove_dir_all(dir);
    }
}
