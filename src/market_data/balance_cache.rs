// =============================================================================
// Balance Cache — user-data account snapshot with change notification
// =============================================================================

use std::collections::HashMap;

use tokio::sync::Notify;

use crate::types::BalanceInfo;

/// Free balance per asset, refreshed wholesale on `outboundAccountPosition`
/// events and invalidated on reconnect. `changed` is notified on every
/// mutation so callers can wait for a balance to settle after an order.
#[derive(Default)]
pub struct BalanceCache {
    balances: parking_lot::RwLock<HashMap<String, f64>>,
    changed: Notify,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot, as delivered by an account-position event.
    pub fn replace_all(&self, balances: &[BalanceInfo]) {
        let mut map = self.balances.write();
        map.clear();
        for b in balances {
            map.insert(b.asset.clone(), b.free);
        }
        drop(map);
        self.changed.notify_waiters();
    }

    /// A single asset's balance changed (or was invalidated).
    pub fn update_one(&self, asset: &str, free: f64) {
        self.balances.write().insert(asset.to_string(), free);
        self.changed.notify_waiters();
    }

    pub fn remove_one(&self, asset: &str) {
        self.balances.write().remove(asset);
        self.changed.notify_waiters();
    }

    pub fn invalidate(&self) {
        self.balances.write().clear();
        self.changed.notify_waiters();
    }

    pub fn get(&self, asset: &str) -> f64 {
        self.balances.read().get(asset).copied().unwrap_or(0.0)
    }

    /// Wait until the cache is mutated at least once after this call starts.
    pub async fn wait_for_change(&self) {
        self.changed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_all_overwrites_prior_snapshot() {
        let cache = BalanceCache::new();
        cache.update_one("BTC", 1.0);
        cache.replace_all(&[BalanceInfo { asset: "ETH".into(), free: 2.0 }]);
        assert_eq!(cache.get("BTC"), 0.0);
        assert_eq!(cache.get("ETH"), 2.0);
    }

    #[tokio::test]
    async fn wait_for_change_resolves_after_update() {
        let cache = std::sync::Arc::new(BalanceCache::new());
        let waiter = cache.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_change().await;
        });
        tokio::task::yield_now().await;
        cache.update_one("BNB", 5.0);
        handle.await.unwrap();
        assert_eq!(cache.get("BNB"), 5.0);
    }
}
