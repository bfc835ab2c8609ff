// =============================================================================
// AppState — shared engine state behind the reporting API
// =============================================================================
//
// A single place that ties the trade controller, scout engine, and settings
// together so the API layer and the main loop can share them. The trade
// controller is wrapped in an async mutex since `ScoutEngine::tick` needs
// `&mut TradeController` across await points; the scheduler's scout job and
// the API's read-only snapshot both borrow it through this state.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::persistence::PersistencePort;
use crate::scout::ScoutEngine;
use crate::trade_controller::TradeController;
use crate::types::TradingMode;

pub struct AppState {
    pub trade_controller: Arc<Mutex<TradeController>>,
    pub scout: Arc<ScoutEngine>,
    pub persistence: Arc<dyn PersistencePort>,
    pub settings: Settings,
    pub trading_mode: RwLock<TradingMode>,
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        trade_controller: Arc<Mutex<TradeController>>,
        scout: Arc<ScoutEngine>,
        persistence: Arc<dyn PersistencePort>,
        settings: Settings,
    ) -> Self {
        Self {
            trade_controller,
            scout,
            persistence,
            settings,
            trading_mode: RwLock::new(TradingMode::Paused),
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn trading_mode(&self) -> TradingMode {
        *self.trading_mode.read()
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        *self.trading_mode.write() = mode;
        self.increment_version();
    }

    /// Build a read-only snapshot of the engine's current position, suitable
    /// for the `GET /api/v1/state` endpoint.
    pub async fn build_snapshot(&self) -> StateSnapshot {
        let current_coin = self.persistence.current_coin_get().await.ok().flatten();
        let controller = self.trade_controller.lock().await;

        let mut balances = Vec::new();
        for stub in controller.registry().all() {
            if let Ok(free) = controller.executor().currency_balance(&stub.symbol, false).await {
                if free > 0.0 {
                    balances.push(crate::types::BalanceInfo {
                        asset: stub.symbol.clone(),
                        free,
                    });
                }
            }
        }
        if let Ok(bridge_free) = controller
            .executor()
            .currency_balance(controller.bridge_symbol(), false)
            .await
        {
            if bridge_free > 0.0 {
                balances.push(crate::types::BalanceInfo {
                    asset: controller.bridge_symbol().to_string(),
                    free: bridge_free,
                });
            }
        }

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            trading_mode: self.trading_mode().to_string(),
            bridge_symbol: controller.bridge_symbol().to_string(),
            watchlist: controller.registry().all().iter().map(|s| s.symbol.clone()).collect(),
            current_coin,
            balances,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub trading_mode: String,
    pub bridge_symbol: String,
    pub watchlist: Vec<String>,
    pub current_coin: Option<String>,
    pub balances: Vec<crate::types::BalanceInfo>,
}
