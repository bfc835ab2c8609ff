// =============================================================================
// Stream Plane — multiplexed Binance WebSocket streams
// =============================================================================
//
// One mpsc buffer per stream family (mini-tickers, user data, depth), fed by
// WebSocket connection tasks and drained by a listener task per buffer.
// Streams auto-replace themselves periodically (connection age limits on the
// exchange side); the replaced-stream's trailing signals are suppressed so a
// DISCONNECT from the old connection doesn't stomp state the new connection
// just established.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::market_data::balance_cache::BalanceCache;
use crate::market_data::depth_cache::{DepthCacheManager, DepthEvent, SnapshotFetcher};
use crate::market_data::ticker_cache::TickerCache;
use crate::types::BalanceInfo;

pub const BUFFER_MINITICKERS: &str = "mt";
pub const BUFFER_USERDATA: &str = "ud";
pub const BUFFER_DEPTH: &str = "de";

/// A lifecycle event for one underlying stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct StreamSignal {
    pub kind: SignalKind,
    pub stream_id: Uuid,
}

/// Raw mini-ticker update: symbol plus close price.
#[derive(Debug, Clone)]
pub struct MiniTickerEvent {
    pub symbol: String,
    pub close_price: f64,
}

/// Account/user-data events relevant to the balance cache.
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    BalanceUpdate { asset: String },
    AccountPosition { balances: Vec<BalanceInfo> },
}

/// One inbound item on a buffer: either a signal or payload data.
enum BufferItem<T> {
    Signal(StreamSignal),
    Data(T),
}

/// Suppresses signals belonging to a stream id that was just replaced, so a
/// trailing DISCONNECT from the old connection (or a stray CONNECT racing
/// the handoff) is dropped rather than acted on.
#[derive(Default)]
struct ReplaceSignals {
    connect: HashSet<Uuid>,
    disconnect: HashSet<Uuid>,
}

impl ReplaceSignals {
    fn notify_replace(&mut self, old_id: Uuid, new_id: Uuid) {
        self.connect.insert(new_id);
        self.disconnect.insert(old_id);
    }

    fn should_skip(&mut self, signal: &StreamSignal) -> bool {
        let set = match signal.kind {
            SignalKind::Connect => &mut self.connect,
            SignalKind::Disconnect => &mut self.disconnect,
        };
        set.remove(&signal.stream_id)
    }
}

/// Owns the channel endpoints feeding each stream family and the shared
/// caches the listener tasks update.
pub struct StreamPlane {
    ticker_tx: mpsc::UnboundedSender<BufferItem<MiniTickerEvent>>,
    ticker_rx: Mutex<Option<mpsc::UnboundedReceiver<BufferItem<MiniTickerEvent>>>>,
    userdata_tx: mpsc::UnboundedSender<BufferItem<UserDataEvent>>,
    userdata_rx: Mutex<Option<mpsc::UnboundedReceiver<BufferItem<UserDataEvent>>>>,
    depth_tx: mpsc::UnboundedSender<BufferItem<(String, DepthEvent)>>,
    depth_rx: Mutex<Option<mpsc::UnboundedReceiver<BufferItem<(String, DepthEvent)>>>>,
    replace_signals: Mutex<ReplaceSignals>,
    ticker_cache: Arc<TickerCache>,
    balance_cache: Arc<BalanceCache>,
    depth_managers: Mutex<HashMap<String, DepthCacheManager>>,
}

impl StreamPlane {
    pub fn new(
        symbols: &[String],
        ticker_cache: Arc<TickerCache>,
        balance_cache: Arc<BalanceCache>,
    ) -> Self {
        let (ticker_tx, ticker_rx) = mpsc::unbounded_channel();
        let (userdata_tx, userdata_rx) = mpsc::unbounded_channel();
        let (depth_tx, depth_rx) = mpsc::unbounded_channel();
        let depth_managers = symbols
            .iter()
            .map(|s| (s.clone(), DepthCacheManager::new(s.clone())))
            .collect();
        Self {
            ticker_tx,
            ticker_rx: Mutex::new(Some(ticker_rx)),
            userdata_tx,
            userdata_rx: Mutex::new(Some(userdata_rx)),
            depth_tx,
            depth_rx: Mutex::new(Some(depth_rx)),
            replace_signals: Mutex::new(ReplaceSignals::default()),
            ticker_cache,
            balance_cache,
            depth_managers: Mutex::new(depth_managers),
        }
    }

    /// Called when an `AutoReplacingStream` swaps its underlying connection:
    /// signals belonging to either id are dropped rather than acted on.
    pub fn notify_stream_replace(&self, old_id: Uuid, new_id: Uuid) {
        self.replace_signals.lock().notify_replace(old_id, new_id);
    }

    pub fn push_ticker_event(&self, event: MiniTickerEvent) {
        let _ = self.ticker_tx.send(BufferItem::Data(event));
    }

    pub fn push_ticker_signal(&self, signal: StreamSignal) {
        let _ = self.ticker_tx.send(BufferItem::Signal(signal));
    }

    pub fn push_userdata_event(&self, event: UserDataEvent) {
        let _ = self.userdata_tx.send(BufferItem::Data(event));
    }

    pub fn push_userdata_signal(&self, signal: StreamSignal) {
        let _ = self.userdata_tx.send(BufferItem::Signal(signal));
    }

    pub fn push_depth_event(&self, symbol: String, event: DepthEvent) {
        let _ = self.depth_tx.send(BufferItem::Data((symbol, event)));
    }

    pub fn push_depth_signal(&self, signal: StreamSignal) {
        let _ = self.depth_tx.send(BufferItem::Signal(signal));
    }

    pub fn depth_cache_snapshot(&self, symbol: &str) -> Option<crate::market_data::depth_cache::DepthCache> {
        self.depth_managers
            .lock()
            .get(symbol)
            .map(|m| m.cache().clone())
    }

    /// Drains the mini-ticker buffer forever, updating `ticker_cache`.
    pub async fn run_ticker_listener(&self) {
        let mut rx = self
            .ticker_rx
            .lock()
            .take()
            .expect("ticker listener already running");
        while let Some(item) = rx.recv().await {
            match item {
                BufferItem::Signal(signal) => {
                    if self.replace_signals.lock().should_skip(&signal) {
                        debug!(?signal.kind, "skip replaced-stream signal on ticker buffer");
                    }
                }
                BufferItem::Data(event) => {
                    self.ticker_cache.update(&event.symbol, event.close_price);
                }
            }
        }
    }

    /// Drains the user-data buffer forever, updating `balance_cache`.
    pub async fn run_userdata_listener(&self) {
        let mut rx = self
            .userdata_rx
            .lock()
            .take()
            .expect("userdata listener already running");
        while let Some(item) = rx.recv().await {
            match item {
                BufferItem::Signal(signal) => {
                    if self.replace_signals.lock().should_skip(&signal) {
                        continue;
                    }
                    if signal.kind == SignalKind::Connect {
                        info!("user data stream connected, invalidating balances");
                        self.balance_cache.invalidate();
                    }
                }
                BufferItem::Data(UserDataEvent::BalanceUpdate { asset }) => {
                    self.balance_cache.remove_one(&asset);
                }
                BufferItem::Data(UserDataEvent::AccountPosition { balances }) => {
                    self.balance_cache.replace_all(&balances);
                }
            }
        }
    }

    /// Drains the depth buffer forever, dispatching updates (and CONNECT/
    /// DISCONNECT signals, broadcast to every symbol's manager) into the
    /// per-symbol `DepthCacheManager`s.
    pub async fn run_depth_listener(&self, fetcher: Arc<dyn SnapshotFetcher>) {
        let mut rx = self
            .depth_rx
            .lock()
            .take()
            .expect("depth listener already running");
        while let Some(item) = rx.recv().await {
            match item {
                BufferItem::Signal(signal) => {
                    if self.replace_signals.lock().should_skip(&signal) {
                        continue;
                    }
                    let symbols: Vec<String> = self.depth_managers.lock().keys().cloned().collect();
                    for symbol in symbols {
                        // notify_pending_signal and process_signal must be
                        // sequenced under the same lock scope per symbol, but
                        // processing is async, so extract then reinsert.
                        let mut mgr = {
                            let mut guard = self.depth_managers.lock();
                            guard.remove(&symbol)
                        };
                        if let Some(ref mut m) = mgr {
                            m.notify_pending_signal();
                            if let Err(e) = m
                                .process_signal(signal.kind == SignalKind::Connect, fetcher.as_ref())
                                .await
                            {
                                error!(symbol = %symbol, error = %e, "depth signal processing failed");
                            }
                        }
                        if let Some(m) = mgr {
                            self.depth_managers.lock().insert(symbol, m);
                        }
                    }
                }
                BufferItem::Data((symbol, event)) => {
                    let mut mgr = {
                        let mut guard = self.depth_managers.lock();
                        guard.remove(&symbol)
                    };
                    if let Some(ref mut m) = mgr {
                        if let Err(e) = m.process_event(event, fetcher.as_ref()).await {
                            error!(symbol = %symbol, error = %e, "depth event processing failed");
                        }
                    }
                    if let Some(m) = mgr {
                        self.depth_managers.lock().insert(symbol, m);
                    }
                }
            }
        }
    }
}

/// Connects to the combined mini-ticker stream for `symbols` and feeds
/// decoded events into `plane` until the connection drops, then returns so
/// the caller can reconnect (or hand off via `AutoReplacingStream`).
pub async fn run_miniticker_connection(plane: &StreamPlane, stream_id: Uuid) -> Result<()> {
    let url = "wss://stream.binance.com:9443/ws/!miniTicker@arr";
    info!(%url, "connecting to miniticker stream");
    let (ws, _resp) = connect_async(url).await.context("miniticker connect failed")?;
    plane.push_ticker_signal(StreamSignal {
        kind: SignalKind::Connect,
        stream_id,
    });
    let (_write, mut read) = ws.split();
    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_miniticker_array(&text) {
                    Ok(events) => {
                        for e in events {
                            plane.push_ticker_event(e);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse miniTicker array"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "miniticker stream read error");
                break;
            }
            None => break,
        }
    }
    plane.push_ticker_signal(StreamSignal {
        kind: SignalKind::Disconnect,
        stream_id,
    });
    Ok(())
}

/// Connects to the combined depth-diff stream for `symbols` (`<sym>@depth`)
/// and feeds decoded events into `plane` until the connection drops.
pub async fn run_depth_connection(plane: &StreamPlane, symbols: &[String], stream_id: Uuid) -> Result<()> {
    if symbols.is_empty() {
        std::future::pending::<()>().await;
        unreachable!()
    }
    let streams = symbols
        .iter()
        .map(|s| format!("{}@depth", s.to_lowercase()))
        .collect::<Vec<_>>()
        .join("/");
    let url = format!("wss://stream.binance.com:9443/stream?streams={streams}");
    info!(%url, "connecting to depth stream");
    let (ws, _resp) = connect_async(&url).await.context("depth stream connect failed")?;
    plane.push_depth_signal(StreamSignal {
        kind: SignalKind::Connect,
        stream_id,
    });
    let (_write, mut read) = ws.split();
    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_combined_depth_event(&text) {
                    Ok(Some((symbol, event))) => plane.push_depth_event(symbol, event),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse depth diff event"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "depth stream read error");
                break;
            }
            None => break,
        }
    }
    plane.push_depth_signal(StreamSignal {
        kind: SignalKind::Disconnect,
        stream_id,
    });
    Ok(())
}

/// Connects to the user-data WebSocket for `listen_key` and feeds decoded
/// account events into `plane` until the connection drops. The caller is
/// responsible for periodically refreshing the listen key (it expires after
/// 60 minutes of inactivity on the Binance side).
pub async fn run_userdata_connection(plane: &StreamPlane, listen_key: &str, stream_id: Uuid) -> Result<()> {
    let url = format!("wss://stream.binance.com:9443/ws/{listen_key}");
    info!("connecting to user-data stream");
    let (ws, _resp) = connect_async(&url).await.context("user-data stream connect failed")?;
    plane.push_userdata_signal(StreamSignal {
        kind: SignalKind::Connect,
        stream_id,
    });
    let (_write, mut read) = ws.split();
    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_userdata_event(&text) {
                    Ok(Some(event)) => plane.push_userdata_event(event),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse user-data event"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "user-data stream read error");
                break;
            }
            None => break,
        }
    }
    plane.push_userdata_signal(StreamSignal {
        kind: SignalKind::Disconnect,
        stream_id,
    });
    Ok(())
}

fn parse_userdata_event(text: &str) -> Result<Option<UserDataEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value.get("e").and_then(|v| v.as_str()) {
        Some("balanceUpdate") => {
            let asset = value.get("a").and_then(|v| v.as_str()).context("missing asset")?.to_string();
            Ok(Some(UserDataEvent::BalanceUpdate { asset }))
        }
        Some("outboundAccountPosition") => {
            let raw = value.get("B").and_then(|v| v.as_array()).context("missing balances array")?;
            let mut balances = Vec::with_capacity(raw.len());
            for entry in raw {
                let asset = entry.get("a").and_then(|v| v.as_str()).context("missing asset")?.to_string();
                let free: f64 = entry
                    .get("f")
                    .and_then(|v| v.as_str())
                    .context("missing free balance")?
                    .parse()?;
                balances.push(BalanceInfo { asset, free });
            }
            Ok(Some(UserDataEvent::AccountPosition { balances }))
        }
        _ => Ok(None),
    }
}

fn parse_combined_depth_event(text: &str) -> Result<Option<(String, DepthEvent)>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let Some(data) = value.get("data") else {
        return Ok(None);
    };
    let symbol = data.get("s").and_then(|v| v.as_str()).context("missing symbol")?.to_string();
    let first_update_id = data.get("U").and_then(|v| v.as_u64()).context("missing U")?;
    let final_update_id = data.get("u").and_then(|v| v.as_u64()).context("missing u")?;
    let bids = parse_depth_levels(data.get("b").context("missing bids")?)?;
    let asks = parse_depth_levels(data.get("a").context("missing asks")?)?;
    Ok(Some((
        symbol,
        DepthEvent {
            first_update_id,
            final_update_id,
            bids,
            asks,
        },
    )))
}

fn parse_depth_levels(value: &serde_json::Value) -> Result<Vec<(f64, f64)>> {
    let arr = value.as_array().context("expected an array of [price, qty] levels")?;
    arr.iter()
        .map(|lvl| {
            let pair = lvl.as_array().context("expected a 2-element level")?;
            let price: f64 = pair.first().and_then(|v| v.as_str()).context("missing price")?.parse()?;
            let qty: f64 = pair.get(1).and_then(|v| v.as_str()).context("missing qty")?.parse()?;
            Ok((price, qty))
        })
        .collect()
}

fn parse_miniticker_array(text: &str) -> Result<Vec<MiniTickerEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let arr = value.as_array().context("expected a JSON array")?;
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let symbol = entry
            .get("s")
            .and_then(|v| v.as_str())
            .context("missing symbol field")?
            .to_string();
        let close_price: f64 = entry
            .get("c")
            .and_then(|v| v.as_str())
            .context("missing close price field")?
            .parse()?;
        out.push(MiniTickerEvent { symbol, close_price });
    }
    Ok(out)
}

/// Periodically replaces a long-lived WebSocket connection with a fresh one,
/// notifying the plane so the outgoing connection's trailing signals are
/// suppressed. Runs forever.
pub async fn run_auto_replacing_stream<F, Fut>(
    plane: Arc<StreamPlane>,
    restart_every: Duration,
    connect: F,
) where
    F: Fn(Arc<StreamPlane>, Uuid) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut current_id = Uuid::new_v4();
    loop {
        let plane_for_conn = plane.clone();
        let id = current_id;
        let handle = tokio::spawn(connect(plane_for_conn, id));

        tokio::time::sleep(restart_every).await;

        let new_id = Uuid::new_v4();
        plane.notify_stream_replace(id, new_id);
        current_id = new_id;
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_listener_applies_events_and_skips_replaced_signal() {
        let ticker_cache = Arc::new(TickerCache::new());
        let balance_cache = Arc::new(BalanceCache::new());
        let plane = Arc::new(StreamPlane::new(&[], ticker_cache.clone(), balance_cache));

        let plane2 = plane.clone();
        let handle = tokio::spawn(async move { plane2.run_ticker_listener().await });

        let old_id = Uuid::new_v4();
        plane.notify_stream_replace(old_id, Uuid::new_v4());
        plane.push_ticker_signal(StreamSignal {
            kind: SignalKind::Disconnect,
            stream_id: old_id,
        });
        plane.push_ticker_event(MiniTickerEvent {
            symbol: "BTCUSDT".into(),
            close_price: 50000.0,
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticker_cache.price("BTCUSDT"), Some(50000.0));
        handle.abort();
    }

    #[tokio::test]
    async fn userdata_listener_invalidates_on_connect() {
        let ticker_cache = Arc::new(TickerCache::new());
        let balance_cache = Arc::new(BalanceCache::new());
        balance_cache.update_one("BTC", 1.0);
        let plane = Arc::new(StreamPlane::new(&[], ticker_cache, balance_cache.clone()));

        let plane2 = plane.clone();
        let handle = tokio::spawn(async move { plane2.run_userdata_listener().await });

        plane.push_userdata_signal(StreamSignal {
            kind: SignalKind::Connect,
            stream_id: Uuid::new_v4(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(balance_cache.get("BTC"), 0.0);
        handle.abort();
    }
}
