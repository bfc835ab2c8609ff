// =============================================================================
// Depth Cache & Depth Cache Manager — incremental order-book mirror
// =============================================================================
//
// Sorted bid/ask sides with a `keep_limit`/`max_size` trim and buffered
// reinit on a sequence gap, laid out one file per concern with
// `anyhow::Result` and `tracing` logging to match the rest of this crate.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ordered_float::OrderedFloat;
use tracing::debug;

/// Default bound at which a book side is trimmed.
pub const DEFAULT_MAX_SIZE: usize = 400;
/// Number of best levels retained after a trim.
pub const DEFAULT_KEEP_LIMIT: usize = 200;

/// Treat amounts at or below this magnitude as a trivial zero.
const TRIVIAL_EPSILON: f64 = 1e-15;

/// One side of an order book: price -> quantity, kept sorted by price.
#[derive(Debug, Clone, Default)]
struct BookSide {
    levels: BTreeMap<OrderedFloat<f64>, f64>,
}

impl BookSide {
    fn upsert(&mut self, price: f64, qty: f64) {
        if qty == 0.0 {
            self.levels.remove(&OrderedFloat(price));
        } else {
            self.levels.insert(OrderedFloat(price), qty);
        }
    }

    fn len(&self) -> usize {
        self.levels.len()
    }

    fn clear(&mut self) {
        self.levels.clear();
    }

    /// Descending iteration (highest price first) — the bid-walking order.
    fn iter_desc(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.levels.iter().rev().map(|(p, q)| (p.0, *q))
    }

    /// Ascending iteration (lowest price first) — the ask-walking order.
    fn iter_asc(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.levels.iter().map(|(p, q)| (p.0, *q))
    }

    /// Keep only the `keep_limit` highest-price levels (used for bids).
    fn trim_keep_highest(&mut self, keep_limit: usize) {
        while self.levels.len() > keep_limit {
            let lowest = *self.levels.keys().next().unwrap();
            self.levels.remove(&lowest);
        }
    }

    /// Keep only the `keep_limit` lowest-price levels (used for asks).
    fn trim_keep_lowest(&mut self, keep_limit: usize) {
        while self.levels.len() > keep_limit {
            let highest = *self.levels.keys().next_back().unwrap();
            self.levels.remove(&highest);
        }
    }
}

/// The order book mirror for a single symbol: sorted bids/asks, bounded size.
#[derive(Debug, Clone)]
pub struct DepthCache {
    bids: BookSide,
    asks: BookSide,
    max_size: usize,
    keep_limit: usize,
}

impl Default for DepthCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_KEEP_LIMIT)
    }
}

impl DepthCache {
    pub fn new(max_size: usize, keep_limit: usize) -> Self {
        Self {
            bids: BookSide::default(),
            asks: BookSide::default(),
            max_size,
            keep_limit,
        }
    }

    pub fn add_bid(&mut self, price: f64, qty: f64) {
        self.bids.upsert(price, qty);
        if self.bids.len() >= self.max_size {
            self.bids.trim_keep_highest(self.keep_limit);
        }
    }

    pub fn add_ask(&mut self, price: f64, qty: f64) {
        self.asks.upsert(price, qty);
        if self.asks.len() >= self.max_size {
            self.asks.trim_keep_lowest(self.keep_limit);
        }
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter_desc().next()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter_asc().next()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    // -------------------------------------------------------------------
    // Market pricing queries
    // -------------------------------------------------------------------

    /// Walk bids from highest to lowest, filling `base_amount`. Returns
    /// `(avg_price, quote_gained)` if fully filled, or `(None, None)` if the
    /// book is too thin.
    pub fn market_sell_price(&self, base_amount: f64) -> (Option<f64>, Option<f64>) {
        if base_amount.abs() <= TRIVIAL_EPSILON {
            return (Some(0.0), Some(0.0));
        }
        let mut quote = 0.0;
        let mut unfilled = base_amount;
        for (price, bid_qty) in self.bids.iter_desc() {
            let fill = bid_qty.min(unfilled);
            quote += price * fill;
            unfilled -= fill;
            if unfilled.abs() <= TRIVIAL_EPSILON {
                return (Some(quote / base_amount), Some(quote));
            }
        }
        (None, None)
    }

    /// Walk asks from lowest to highest, consuming `quote_amount`. Returns
    /// `(avg_price, base_obtained)`.
    pub fn market_buy_price(&self, quote_amount: f64) -> (Option<f64>, Option<f64>) {
        if quote_amount.abs() <= TRIVIAL_EPSILON {
            return (Some(0.0), Some(0.0));
        }
        let mut base = 0.0;
        let mut unfilled_quote = quote_amount;
        for (price, ask_qty) in self.asks.iter_asc() {
            let max_base_at_price = unfilled_quote / price;
            let fill = max_base_at_price.min(ask_qty);
            base += fill;
            unfilled_quote -= fill * price;
            if unfilled_quote.abs() <= TRIVIAL_EPSILON {
                return (Some(quote_amount / base), Some(base));
            }
        }
        (None, None)
    }

    /// Walk bids until `quote_amount` has been produced. Returns
    /// `(avg_price, base_sold)`.
    pub fn market_sell_fill_quote(&self, quote_amount: f64) -> (Option<f64>, Option<f64>) {
        if quote_amount.abs() <= TRIVIAL_EPSILON {
            return (Some(0.0), Some(0.0));
        }
        let mut base = 0.0;
        let mut unfilled_quote = quote_amount;
        for (price, bid_qty) in self.bids.iter_desc() {
            let max_base_at_price = unfilled_quote / price;
            let fill = max_base_at_price.min(bid_qty);
            base += fill;
            unfilled_quote -= price * fill;
            if unfilled_quote.abs() <= TRIVIAL_EPSILON {
                return (Some(quote_amount / base), Some(base));
            }
        }
        (None, None)
    }
}

/// A raw incremental depth-update event, as received from the exchange.
#[derive(Debug, Clone)]
pub struct DepthEvent {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// A full order-book snapshot, fetched via REST on resync.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Fetches a full depth snapshot for a symbol, retrying on transient API
/// error with a fixed backoff.
#[async_trait::async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<DepthSnapshot>;
}

/// Owns one symbol's `DepthCache` plus the sequencing state needed to apply
/// incremental updates and resync on a gap.
pub struct DepthCacheManager {
    symbol: String,
    cache: DepthCache,
    last_update_id: i64,
    pending_reinit: bool,
    pending_signals: u32,
    buffered: Vec<DepthEvent>,
}

impl DepthCacheManager {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            cache: DepthCache::default(),
            last_update_id: -1,
            pending_reinit: false,
            pending_signals: 0,
            buffered: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn cache(&self) -> &DepthCache {
        &self.cache
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    fn buffering(&self) -> bool {
        self.pending_reinit || self.pending_signals > 0
    }

    /// A CONNECT/DISCONNECT arrived for this manager's stream. Increments the
    /// pending-signal counter; data is buffered until it's processed.
    pub fn notify_pending_signal(&mut self) {
        self.pending_signals += 1;
    }

    /// Process a CONNECT (triggers reinit) or DISCONNECT (clears the book)
    /// signal, then decrement the pending-signal counter.
    pub async fn process_signal(&mut self, is_connect: bool, fetcher: &dyn SnapshotFetcher) -> Result<()> {
        if is_connect {
            self.reinit(fetcher).await?;
        } else {
            self.cache.clear();
        }
        self.pending_signals = self.pending_signals.saturating_sub(1);
        self.drain_buffer_if_ready(fetcher).await
    }

    /// Apply (or buffer) one incremental event, enforcing the sequence-gap
    /// rule below.
    pub async fn process_event(&mut self, event: DepthEvent, fetcher: &dyn SnapshotFetcher) -> Result<()> {
        if self.buffering() {
            self.buffered.push(event);
            return Ok(());
        }
        self.handle_event(event, fetcher).await?;
        self.drain_buffer_if_ready(fetcher).await
    }

    async fn drain_buffer_if_ready(&mut self, fetcher: &dyn SnapshotFetcher) -> Result<()> {
        while !self.buffering() && !self.buffered.is_empty() {
            let next = self.buffered.remove(0);
            self.handle_event(next, fetcher).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: DepthEvent, fetcher: &dyn SnapshotFetcher) -> Result<()> {
        if event.final_update_id as i64 <= self.last_update_id {
            return Ok(()); // stale
        }
        if event.first_update_id as i64 > self.last_update_id + 1 {
            debug!(
                symbol = %self.symbol,
                delta = event.first_update_id as i64 - self.last_update_id,
                "order book gap detected, resyncing"
            );
            self.reinit(fetcher).await?;
            // The event that triggered the gap is dropped; subsequent events
            // will be evaluated against the snapshot's last_update_id.
            return Ok(());
        }
        self.apply(&event);
        self.last_update_id = event.final_update_id as i64;
        Ok(())
    }

    fn apply(&mut self, event: &DepthEvent) {
        for &(price, qty) in &event.bids {
            self.cache.add_bid(price, qty);
        }
        for &(price, qty) in &event.asks {
            self.cache.add_ask(price, qty);
        }
    }

    /// Clear the book and fetch a fresh snapshot, retrying on API error with
    /// a 500ms backoff.
    async fn reinit(&mut self, fetcher: &dyn SnapshotFetcher) -> Result<()> {
        self.pending_reinit = true;
        self.cache.clear();
        loop {
            match fetcher.fetch_snapshot(&self.symbol).await {
                Ok(snapshot) => {
                    for &(price, qty) in &snapshot.bids {
                        self.cache.add_bid(price, qty);
                    }
                    for &(price, qty) in &snapshot.asks {
                        self.cache.add_ask(price, qty);
                    }
                    self.last_update_id = snapshot.last_update_id as i64;
                    break;
                }
                Err(e) => {
                    debug!(symbol = %self.symbol, error = %e, "snapshot fetch failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
        self.pending_reinit = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedSnapshot {
        snapshot: DepthSnapshot,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SnapshotFetcher for FixedSnapshot {
        async fn fetch_snapshot(&self, _symbol: &str) -> Result<DepthSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    #[test]
    fn depth_bound_enforced_after_trim() {
        let mut cache = DepthCache::new(5, 3);
        for i in 0..10 {
            cache.add_bid(100.0 + i as f64, 1.0);
        }
        assert!(cache.bid_count() <= 5);
        // After trimming, the top 3 highest-price bids survive.
        let top: Vec<f64> = cache.bids.iter_desc().map(|(p, _)| p).collect();
        assert_eq!(top, vec![109.0, 108.0, 107.0]);
    }

    #[test]
    fn zero_quantity_removes_level() {
        let mut cache = DepthCache::default();
        cache.add_bid(100.0, 5.0);
        cache.add_bid(100.0, 0.0);
        assert_eq!(cache.bid_count(), 0);
    }

    #[test]
    fn market_sell_price_walks_bids_highest_first() {
        let mut cache = DepthCache::default();
        cache.add_bid(100.0, 1.0);
        cache.add_bid(99.0, 2.0);
        let (price, quote) = cache.market_sell_price(2.0);
        // 1.0 @ 100 + 1.0 @ 99 = 199
        assert_eq!(quote, Some(199.0));
        assert_eq!(price, Some(99.5));
    }

    #[test]
    fn market_sell_price_insufficient_depth_returns_none() {
        let mut cache = DepthCache::default();
        cache.add_bid(100.0, 1.0);
        let (price, quote) = cache.market_sell_price(5.0);
        assert_eq!(price, None);
        assert_eq!(quote, None);
    }

    #[test]
    fn trivial_amount_returns_zero() {
        let cache = DepthCache::default();
        assert_eq!(cache.market_sell_price(1e-16), (Some(0.0), Some(0.0)));
        assert_eq!(cache.market_buy_price(1e-16), (Some(0.0), Some(0.0)));
    }

    #[tokio::test]
    async fn gap_triggers_exactly_one_resync() {
        let fetcher = FixedSnapshot {
            snapshot: DepthSnapshot {
                last_update_id: 200,
                bids: vec![(50.0, 1.0)],
                asks: vec![(51.0, 1.0)],
            },
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut mgr = DepthCacheManager::new("BTCUSDT");
        mgr.last_update_id = 10;

        // A first_update_id past the expected continuation triggers exactly
        // one resync.
        mgr.process_event(
            DepthEvent {
                first_update_id: 12,
                final_update_id: 15,
                bids: vec![(1.0, 1.0)],
                asks: vec![],
            },
            &fetcher,
        )
        .await
        .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.last_update_id(), 200);
        // Only the snapshot's levels survive the resync.
        assert_eq!(mgr.cache().best_bid(), Some((50.0, 1.0)));
        assert_eq!(mgr.cache().best_ask(), Some((51.0, 1.0)));
    }

    #[tokio::test]
    async fn events_buffered_while_signal_pending_then_drained_in_order() {
        let fetcher = FixedSnapshot {
            snapshot: DepthSnapshot {
                last_update_id: 5,
                bids: vec![],
                asks: vec![],
            },
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut mgr = DepthCacheManager::new("ETHUSDT");
        mgr.notify_pending_signal();

        mgr.process_event(
            DepthEvent {
                first_update_id: 6,
                final_update_id: 6,
                bids: vec![(10.0, 1.0)],
                asks: vec![],
            },
            &fetcher,
        )
        .await
        .unwrap();
        // Still pending: event buffered, not applied yet.
        assert_eq!(mgr.cache().bid_count(), 0);

        mgr.process_signal(true, &fetcher).await.unwrap();
        // Reinit set last_update_id=5, then the buffered event (final=6) applies.
        assert_eq!(mgr.last_update_id(), 6);
        assert_eq!(mgr.cache().bid_count(), 1);
    }
}
