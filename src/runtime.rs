// =============================================================================
// Runtime — process lifecycle: startup, scheduler wiring, graceful shutdown
// =============================================================================
//
// Mirrors a classic bot entrypoint: verify exchange credentials, warm up the
// coin registry, start the market-data plane, then hand control to a
// cooperative scheduler until SIGINT/SIGTERM arrives. Shutdown gives
// in-flight work a bounded window to finish before the process exits.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::binance::client::BinanceClient;
use crate::config::Settings;
use crate::execution::live::LiveExecutor;
use crate::execution::paper::PaperExecutor;
use crate::execution::OrderExecutor;
use crate::fees::{BinanceFeeProvider, FeeProvider, FixedFeeProvider};
use crate::market_data::{stream_plane, BalanceCache, StreamPlane, TickerCache};
use crate::persistence::json_store::JsonStore;
use crate::persistence::PersistencePort;
use crate::registry::{set_coins, CoinRegistry};
use crate::scheduler::Scheduler;
use crate::scout::ScoutEngine;
use crate::strategy::lookup_strategy;
use crate::trade_controller::TradeController;

/// Close timeout mirroring the original bot's `TIMEOUT` constant: how long
/// shutdown waits for the scheduler loop and in-flight jumps to settle.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const MINITICKER_RESTART_EVERY: Duration = Duration::from_secs(23 * 3600);
const DEPTH_RESTART_EVERY: Duration = Duration::from_secs(23 * 3600);
const LISTEN_KEY_KEEPALIVE_EVERY: Duration = Duration::from_secs(30 * 60);
const WARMUP_SLEEP: Duration = Duration::from_secs(10);

pub async fn run() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;

    let client = Arc::new(BinanceClient::new(
        settings.binance_api_key.clone(),
        settings.binance_api_secret_key.clone(),
    ));

    if !settings.enable_paper_trading {
        client
            .get_account()
            .await
            .context("Binance API key verification failed — refusing to start")?;
        info!("Binance API key verified");
    }

    let strategy = lookup_strategy(&settings.strategy)
        .with_context(|| format!("unknown strategy '{}'", settings.strategy))?;
    info!(strategy = %settings.strategy, "strategy loaded");

    let persistence: Arc<dyn PersistencePort> =
        Arc::new(JsonStore::open("state.json").context("failed to open state store")?);

    let mut registry = CoinRegistry::new();
    let ratio_matrix = set_coins(persistence.as_ref(), &mut registry, &settings.watchlist)
        .await
        .context("failed to warm up coin registry")?;
    info!(coins = registry.count(), "coin registry warmed up");

    // Give the exchange a moment before the first scout tick, matching the
    // original bot's fixed warmup sleep after `set_coins`.
    tokio::time::sleep(WARMUP_SLEEP).await;

    let ticker_cache = Arc::new(TickerCache::new());
    let balance_cache = Arc::new(BalanceCache::new());
    let symbols = registry.all().iter().map(|s| s.symbol.clone()).collect::<Vec<_>>();
    let plane = Arc::new(StreamPlane::new(&symbols, ticker_cache.clone(), balance_cache.clone()));

    let executor: Arc<dyn OrderExecutor> = if settings.enable_paper_trading {
        let mut initial = HashMap::new();
        initial.insert(settings.bridge_symbol.clone(), settings.paper_wallet_balance);
        Arc::new(PaperExecutor::new(settings.bridge_symbol.clone(), "paper_wallet.json", initial))
    } else {
        Arc::new(LiveExecutor::new(client.clone(), balance_cache.clone(), persistence.clone()))
    };

    let fees: Arc<dyn FeeProvider> = if settings.enable_paper_trading {
        Arc::new(FixedFeeProvider::default())
    } else {
        Arc::new(BinanceFeeProvider::new(client.clone()))
    };

    spawn_market_data_tasks(&plane, &symbols, client.clone(), settings.enable_paper_trading);

    let trade_controller = Arc::new(Mutex::new(TradeController::new(
        registry,
        ratio_matrix,
        executor,
        persistence.clone(),
        ticker_cache.clone(),
        settings.bridge_symbol.clone(),
    )));

    let scout = Arc::new(ScoutEngine::new(
        ticker_cache.clone(),
        client.clone(),
        plane.clone(),
        persistence.clone(),
        fees,
        strategy,
        settings.bridge_symbol.clone(),
        settings.scout_margin,
        settings.use_margin,
    ));

    let state = Arc::new(AppState::new(
        trade_controller.clone(),
        scout.clone(),
        persistence.clone(),
        settings.clone(),
    ));

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let api_state = state.clone();
    tokio::spawn(async move {
        let router = crate::api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(%bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, router).await {
                    error!(error = %e, "API server exited");
                }
            }
            Err(e) => error!(%bind_addr, error = %e, "failed to bind API server"),
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = build_scheduler(&settings, trade_controller.clone(), scout.clone(), persistence.clone());

    let scheduler_handle = tokio::spawn(run_scheduler(scheduler, shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, closing out within {:?}", SHUTDOWN_TIMEOUT);
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped cleanly"),
        Ok(Err(e)) => warn!(error = %e, "scheduler task panicked"),
        Err(_) => warn!("scheduler did not stop within the shutdown timeout, exiting anyway"),
    }

    Ok(())
}

async fn run_scheduler(mut scheduler: Scheduler, shutdown_rx: watch::Receiver<bool>) {
    scheduler.run(shutdown_rx).await;
}

fn build_scheduler(
    settings: &Settings,
    trade_controller: Arc<Mutex<TradeController>>,
    scout: Arc<ScoutEngine>,
    persistence: Arc<dyn PersistencePort>,
) -> Scheduler {
    let mut scheduler = Scheduler::new();

    {
        let trade_controller = trade_controller.clone();
        let scout = scout.clone();
        scheduler.every(
            "scout",
            Duration::from_secs(settings.scout_sleep_time.max(1)),
            true,
            move || {
                let trade_controller = trade_controller.clone();
                let scout = scout.clone();
                Box::pin(async move {
                    let mut controller = trade_controller.lock().await;
                    scout.tick(&mut controller).await?;
                    Ok(())
                })
            },
        );
    }

    {
        let trade_controller = trade_controller.clone();
        let persistence = persistence.clone();
        scheduler.every("update_values", Duration::from_secs(60), false, move || {
            let trade_controller = trade_controller.clone();
            let persistence = persistence.clone();
            Box::pin(async move { update_values(&trade_controller, persistence.as_ref()).await })
        });
    }

    {
        let persistence = persistence.clone();
        let prune_after = chrono::Duration::seconds((settings.scout_history_prune_time * 3600.0) as i64);
        scheduler.every("prune_scout_history", Duration::from_secs(60), false, move || {
            let persistence = persistence.clone();
            Box::pin(async move {
                let before = chrono::Utc::now() - prune_after;
                persistence.prune_scout_history(before).await
            })
        });
    }

    {
        let persistence = persistence.clone();
        scheduler.every("prune_value_history", Duration::from_secs(3600), false, move || {
            let persistence = persistence.clone();
            Box::pin(async move {
                persistence
                    .prune_value_history(crate::persistence::ValueHistoryPolicy::default())
                    .await
            })
        });
    }

    scheduler
}

/// Derives a coin's BTC-denominated price from its bridge-denominated price
/// and BTC's own bridge price, e.g. `price(ETHUSDT) / price(BTCUSDT)`. `BTC`
/// itself is always worth exactly 1 BTC; any other coin is left absent if
/// either leg is unknown rather than aliased to its bridge price.
fn coin_price_in_btc(symbol: &str, bridge_price: Option<f64>, btc_bridge_price: Option<f64>) -> Option<f64> {
    if symbol == "BTC" {
        return Some(1.0);
    }
    Some(bridge_price? / btc_bridge_price?)
}

/// Records the bridge-priced value of every coin with a positive balance,
/// for historical charting. The bridge itself is recorded as a 1:1 row.
async fn update_values(trade_controller: &Mutex<TradeController>, persistence: &dyn PersistencePort) -> Result<()> {
    let controller = trade_controller.lock().await;
    let mut rows = Vec::new();
    let now = chrono::Utc::now();

    let btc_bridge_price = controller.ticker_cache().price(&format!("BTC{}", controller.bridge_symbol()));

    for stub in controller.registry().all() {
        let free = controller.executor().currency_balance(&stub.symbol, false).await?;
        if free <= 0.0 {
            continue;
        }
        let bridge_price = controller.ticker_cache().price(&format!("{}{}", stub.symbol, controller.bridge_symbol()));
        let btc_price = coin_price_in_btc(&stub.symbol, bridge_price, btc_bridge_price);
        rows.push(crate::types::CoinValue {
            coin: stub.symbol.clone(),
            balance: free,
            usd_price: bridge_price.unwrap_or(0.0),
            btc_price: btc_price.unwrap_or(0.0),
            interval: crate::types::Interval::Minutely,
            datetime: now,
        });
    }

    let bridge_free = controller.executor().currency_balance(controller.bridge_symbol(), false).await?;
    if bridge_free > 0.0 {
        let bridge_btc_price = if controller.bridge_symbol() == "BTC" {
            Some(1.0)
        } else {
            btc_bridge_price.map(|p| 1.0 / p)
        };
        rows.push(crate::types::CoinValue {
            coin: controller.bridge_symbol().to_string(),
            balance: bridge_free,
            usd_price: 1.0,
            btc_price: bridge_btc_price.unwrap_or(0.0),
            interval: crate::types::Interval::Minutely,
            datetime: now,
        });
    }

    if !rows.is_empty() {
        persistence.coin_value_append_batch(&rows).await?;
    }
    Ok(())
}

fn spawn_market_data_tasks(plane: &Arc<StreamPlane>, symbols: &[String], client: Arc<BinanceClient>, paper: bool) {
    {
        let plane = plane.clone();
        tokio::spawn(async move { plane.run_ticker_listener().await });
    }
    {
        let plane = plane.clone();
        tokio::spawn(async move { plane.run_userdata_listener().await });
    }
    {
        let plane = plane.clone();
        let fetcher: Arc<dyn crate::market_data::depth_cache::SnapshotFetcher> = client.clone();
        tokio::spawn(async move { plane.run_depth_listener(fetcher).await });
    }

    {
        let plane = plane.clone();
        tokio::spawn(stream_plane::run_auto_replacing_stream(
            plane,
            MINITICKER_RESTART_EVERY,
            |plane, id| Box::pin(async move { stream_plane::run_miniticker_connection(&plane, id).await }),
        ));
    }

    {
        let plane = plane.clone();
        let symbols = symbols.to_vec();
        tokio::spawn(stream_plane::run_auto_replacing_stream(
            plane,
            DEPTH_RESTART_EVERY,
            move |plane, id| {
                let symbols = symbols.clone();
                Box::pin(async move { stream_plane::run_depth_connection(&plane, &symbols, id).await })
            },
        ));
    }

    if !paper {
        let plane = plane.clone();
        tokio::spawn(run_user_data_stream(plane, client));
    }
}

/// Owns the listen key's lifecycle: acquires it, reconnects the WebSocket
/// under it, and refreshes it on a timer so it never expires mid-session.
async fn run_user_data_stream(plane: Arc<StreamPlane>, client: Arc<BinanceClient>) {
    loop {
        let listen_key = match client.start_user_data_stream().await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "failed to obtain user-data listen key, retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let id = uuid::Uuid::new_v4();
        let conn_plane = plane.clone();
        let conn_key = listen_key.clone();
        let handle = tokio::spawn(async move { stream_plane::run_userdata_connection(&conn_plane, &conn_key, id).await });

        let keepalive_client = client.clone();
        let keepalive_key = listen_key.clone();
        let keepalive = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LISTEN_KEY_KEEPALIVE_EVERY).await;
                if let Err(e) = keepalive_client.keepalive_user_data_stream(&keepalive_key).await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
        });

        let _ = handle.await;
        keepalive.abort();
        warn!("user-data stream connection ended, reconnecting");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
