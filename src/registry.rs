// =============================================================================
// Coin Registry — enabled coin set and stable index assignment
// =============================================================================
//
// An explicit struct instance owned by whichever engine built it, rather
// than global state — two concurrent engines never share indices because
// each owns its own `CoinRegistry`.
// =============================================================================

use std::collections::HashMap;

use crate::ratio_matrix::RatioMatrix;
use crate::types::{Coin, Pair};

/// An enabled coin together with its assigned 0..N-1 index.
#[derive(Debug, Clone)]
pub struct CoinStub {
    pub idx: usize,
    pub symbol: String,
}

/// The set of enabled coins with their stable indices, rebuilt every time the
/// watchlist changes.
#[derive(Default)]
pub struct CoinRegistry {
    by_index: Vec<CoinStub>,
    by_symbol: HashMap<String, usize>,
}

impl CoinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild indices for the given enabled symbols, sorted ascending —
    /// any input order yields the same assignment.
    pub fn rebuild(&mut self, mut symbols: Vec<String>) {
        symbols.sort();
        symbols.dedup();
        self.by_index = symbols
            .into_iter()
            .enumerate()
            .map(|(idx, symbol)| CoinStub { idx, symbol })
            .collect();
        self.by_symbol = self
            .by_index
            .iter()
            .map(|stub| (stub.symbol.clone(), stub.idx))
            .collect();
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&CoinStub> {
        self.by_symbol.get(symbol).map(|&idx| &self.by_index[idx])
    }

    pub fn by_index(&self, idx: usize) -> Option<&CoinStub> {
        self.by_index.get(idx)
    }

    pub fn count(&self) -> usize {
        self.by_index.len()
    }

    pub fn all(&self) -> &[CoinStub] {
        &self.by_index
    }
}

/// Coordinates a full watchlist change: disable/enable coins in persistence,
/// rebuild the registry's index namespace, ensure every ordered pair exists,
/// and construct a fresh `RatioMatrix` from the enabled pairs.
pub async fn set_coins(
    persistence: &dyn crate::persistence::PersistencePort,
    registry: &mut CoinRegistry,
    symbols: &[String],
) -> anyhow::Result<RatioMatrix> {
    let all_coins = persistence.all_coins().await?;
    let to_disable: Vec<String> = all_coins
        .iter()
        .filter(|c| c.enabled && !symbols.contains(&c.symbol))
        .map(|c| c.symbol.clone())
        .collect();
    if !to_disable.is_empty() {
        persistence.coins_disable(&to_disable).await?;
    }
    persistence.coins_upsert(symbols).await?;

    registry.rebuild(symbols.to_vec());

    let index_pairs: Vec<(String, String)> = registry
        .all()
        .iter()
        .flat_map(|from| {
            registry
                .all()
                .iter()
                .filter(move |to| to.symbol != from.symbol)
                .map(move |to| (from.symbol.clone(), to.symbol.clone()))
        })
        .collect();
    persistence.pairs_upsert_all(&index_pairs).await?;

    let enabled_pairs = persistence.pairs_load_enabled().await?;
    let n = registry.count();
    let cells = enabled_pairs.into_iter().filter_map(|(id, from, to, ratio)| {
        let i = registry.by_symbol(&from)?.idx;
        let j = registry.by_symbol(&to)?.idx;
        Some((i, j, ratio, id))
    });
    Ok(RatioMatrix::from_pairs(n, cells))
}

/// Construct the concrete `Pair` rows a freshly rebuilt registry needs,
/// mostly useful for tests that want to assert pair existence without a
/// persistence backend.
pub fn expected_pairs(symbols: &[String]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    for (id, from) in symbols.iter().enumerate() {
        for to in symbols.iter() {
            if from != to {
                pairs.push(Pair {
                    id: id as u64,
                    from_coin: from.clone(),
                    to_coin: to.clone(),
                    ratio: None,
                    enabled: true,
                });
            }
        }
    }
    pairs
}

pub fn coin_list(symbols: &[&str]) -> Vec<Coin> {
    symbols.iter().map(|s| Coin::new(*s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_assigned_ascending_regardless_of_input_order() {
        let mut r1 = CoinRegistry::new();
        r1.rebuild(vec!["ETH".into(), "BTC".into(), "BNB".into()]);

        let mut r2 = CoinRegistry::new();
        r2.rebuild(vec!["BNB".into(), "BTC".into(), "ETH".into()]);

        for sym in ["BTC", "ETH", "BNB"] {
            assert_eq!(
                r1.by_symbol(sym).unwrap().idx,
                r2.by_symbol(sym).unwrap().idx,
                "{sym} index mismatch"
            );
        }
        assert_eq!(r1.by_index(0).unwrap().symbol, "BNB");
        assert_eq!(r1.by_index(1).unwrap().symbol, "BTC");
        assert_eq!(r1.by_index(2).unwrap().symbol, "ETH");
    }

    #[test]
    fn rebuild_discards_stale_indices() {
        let mut r = CoinRegistry::new();
        r.rebuild(vec!["BTC".into(), "ETH".into()]);
        assert_eq!(r.count(), 2);
        r.rebuild(vec!["SOL".into()]);
        assert_eq!(r.count(), 1);
        assert!(r.by_symbol("BTC").is_none());
    }
}
