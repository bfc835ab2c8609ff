// =============================================================================
// Shared types used across the ratio-jump trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset, as reported by the exchange or the
/// paper wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
}

/// A coin on the watchlist. Identity is the symbol; coins are never deleted,
/// only disabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Coin {
    pub symbol: String,
    pub enabled: bool,
}

impl Coin {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            enabled: true,
        }
    }
}

/// An ordered (from, to) coin pair with a stable persisted id and the last
/// recorded ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    pub id: u64,
    pub from_coin: String,
    pub to_coin: String,
    pub ratio: Option<f64>,
    pub enabled: bool,
}

/// Roll-up granularity for a `CoinValue` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Minutely,
    Hourly,
    Daily,
    Weekly,
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Interval::Minutely => "MINUTELY",
            Interval::Hourly => "HOURLY",
            Interval::Daily => "DAILY",
            Interval::Weekly => "WEEKLY",
        };
        write!(f, "{s}")
    }
}

/// An append-only balance/price snapshot for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinValue {
    pub coin: String,
    pub balance: f64,
    pub usd_price: f64,
    pub btc_price: f64,
    pub interval: Interval,
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// An append-only scout observation, pruned by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutHistoryEntry {
    pub pair_id: u64,
    pub ratio_diff: f64,
    pub target_ratio: f64,
    pub current_coin_price: f64,
    pub other_coin_price: f64,
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// Forward-only lifecycle state of a `Trade`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    Started,
    Ordered,
    Complete,
}

impl TradeState {
    /// `true` if advancing from `self` to `next` is a legal forward
    /// transition.
    pub fn can_advance_to(self, next: TradeState) -> bool {
        matches!(
            (self, next),
            (TradeState::Started, TradeState::Ordered)
                | (TradeState::Ordered, TradeState::Complete)
        )
    }
}

/// A single coin-jump order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub from_coin: String,
    pub to_coin: String,
    pub selling: bool,
    pub alt_starting_balance: f64,
    pub crypto_starting_balance: f64,
    pub alt_trade_amount: f64,
    pub crypto_trade_amount: f64,
    pub state: TradeState,
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// BUY or SELL, as sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// The outcome of a (possibly simulated) market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub status: String,
    pub executed_qty: f64,
    pub cumulative_quote_qty: f64,
    pub price: f64,
}

impl OrderReport {
    pub fn is_filled(&self) -> bool {
        self.executed_qty > 0.0 && self.status == "FILLED"
    }
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}
