// =============================================================================
// FeeProvider — taker commission, BNB-burn opt-in, and minimum notional
// =============================================================================
//
// All three are REST lookups that rarely change within a process lifetime,
// so the Binance-backed implementation caches each for 12h, the same
// horizon the exchange's LOT_SIZE tick cache uses.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::binance::client::BinanceClient;

const CACHE_TTL: Duration = Duration::from_secs(12 * 3600);

#[async_trait]
pub trait FeeProvider: Send + Sync {
    async fn taker_fee(&self, symbol: &str) -> Result<f64>;
    async fn min_notional(&self, symbol: &str) -> Result<f64>;
    async fn uses_bnb_for_fees(&self) -> Result<bool>;
}

struct FeeSnapshot {
    by_symbol: HashMap<String, f64>,
    fetched_at: Instant,
}

/// Fee data sourced from the live exchange, cached in memory.
pub struct BinanceFeeProvider {
    client: Arc<BinanceClient>,
    fees: RwLock<Option<FeeSnapshot>>,
    min_notional: RwLock<HashMap<String, f64>>,
    uses_bnb: RwLock<Option<(bool, Instant)>>,
}

impl BinanceFeeProvider {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self {
            client,
            fees: RwLock::new(None),
            min_notional: RwLock::new(HashMap::new()),
            uses_bnb: RwLock::new(None),
        }
    }

    async fn refresh_fees(&self) -> Result<()> {
        let by_symbol = self.client.get_trade_fees().await?;
        *self.fees.write() = Some(FeeSnapshot {
            by_symbol,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl FeeProvider for BinanceFeeProvider {
    async fn taker_fee(&self, symbol: &str) -> Result<f64> {
        {
            let guard = self.fees.read();
            if let Some(snapshot) = &*guard {
                if snapshot.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(snapshot.by_symbol.get(symbol).copied().unwrap_or(0.001));
                }
            }
        }
        self.refresh_fees().await?;
        Ok(self
            .fees
            .read()
            .as_ref()
            .and_then(|s| s.by_symbol.get(symbol).copied())
            .unwrap_or(0.001))
    }

    async fn min_notional(&self, symbol: &str) -> Result<f64> {
        if let Some(&v) = self.min_notional.read().get(symbol) {
            return Ok(v);
        }
        let v = self.client.get_min_notional(symbol).await?;
        self.min_notional.write().insert(symbol.to_string(), v);
        Ok(v)
    }

    async fn uses_bnb_for_fees(&self) -> Result<bool> {
        if let Some((v, at)) = *self.uses_bnb.read() {
            if at.elapsed() < CACHE_TTL {
                return Ok(v);
            }
        }
        let v = self.client.get_bnb_burn_spot_margin().await?;
        *self.uses_bnb.write() = Some((v, Instant::now()));
        Ok(v)
    }
}

/// A fixed-rate provider for paper trading, where no exchange credentials
/// are required and a concrete fee estimate is unnecessary.
pub struct FixedFeeProvider {
    pub taker_fee: f64,
}

impl Default for FixedFeeProvider {
    fn default() -> Self {
        Self { taker_fee: 0.001 }
    }
}

#[async_trait]
impl FeeProvider for FixedFeeProvider {
    async fn taker_fee(&self, _symbol: &str) -> Result<f64> {
        Ok(self.taker_fee)
    }

    async fn min_notional(&self, _symbol: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn uses_bnb_for_fees(&self) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_provider_reports_configured_fee_and_no_bnb_discount() {
        let p = FixedFeeProvider { taker_fee: 0.002 };
        assert_eq!(p.taker_fee("BTCUSDT").await.unwrap(), 0.002);
        assert!(!p.uses_bnb_for_fees().await.unwrap());
        assert_eq!(p.min_notional("BTCUSDT").await.unwrap(), 0.0);
    }
}
