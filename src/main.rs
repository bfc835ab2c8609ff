// =============================================================================
// ratio-trader — Main Entry Point
// =============================================================================
//
// Thin composition root: load env/logging, then hand off to `runtime::run`,
// which owns the actual startup sequence and lifecycle.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backtest;
mod binance;
mod config;
mod error;
mod execution;
mod fees;
mod market_data;
mod persistence;
mod postpone;
mod ratio_matrix;
mod registry;
mod runtime;
mod scheduler;
mod scout;
mod strategy;
mod trade_controller;
mod trade_log;
mod types;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = runtime::run().await {
        tracing::error!(error = %e, "fatal error, shutting down");
        std::process::exit(1);
    }

    Ok(())
}
