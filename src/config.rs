// =============================================================================
// Settings — environment-driven startup configuration
// =============================================================================
//
// Loaded once at process start from `.env` (via `dotenv`) plus the process
// environment, with an optional `config/watchlist.txt` fallback for the coin
// list. Unlike `RuntimeConfig`-style hot-reloadable state, these values are
// fixed for the lifetime of the process: changing the watchlist or bridge
// symbol requires a restart.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const WATCHLIST_PATH: &str = "config/watchlist.txt";

#[derive(Debug, Clone)]
pub struct Settings {
    pub bridge_symbol: String,
    pub watchlist: Vec<String>,
    pub strategy: String,
    pub scout_margin: f64,
    pub scout_sleep_time: u64,
    pub scout_history_prune_time: f64,
    /// Legacy knob, unused by the current strategy but still accepted so an
    /// existing `.env` doesn't need editing.
    pub scout_multiplier: f64,
    pub use_margin: bool,
    pub binance_api_key: String,
    pub binance_api_secret_key: String,
    pub enable_paper_trading: bool,
    pub paper_wallet_balance: f64,
    pub tld: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let bridge_symbol = require_env("BRIDGE_SYMBOL")?;
        let binance_api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        let binance_api_secret_key = std::env::var("BINANCE_API_SECRET_KEY").unwrap_or_default();
        let enable_paper_trading = parse_env("ENABLE_PAPER_TRADING", false)?;

        if !enable_paper_trading && (binance_api_key.is_empty() || binance_api_secret_key.is_empty()) {
            anyhow::bail!("BINANCE_API_KEY/BINANCE_API_SECRET_KEY are required unless ENABLE_PAPER_TRADING=true");
        }

        let watchlist = load_watchlist(Path::new(WATCHLIST_PATH))?;
        if watchlist.is_empty() {
            anyhow::bail!("watchlist is empty: set WATCHLIST or populate {WATCHLIST_PATH}");
        }

        Ok(Self {
            bridge_symbol,
            watchlist,
            strategy: std::env::var("STRATEGY").unwrap_or_else(|_| "default".to_string()),
            scout_margin: parse_env("SCOUT_MARGIN", 0.8)?,
            scout_sleep_time: parse_env("SCOUT_SLEEP_TIME", 1)?,
            scout_history_prune_time: parse_env("SCOUT_HISTORY_PRUNE_TIME", 1.0)?,
            scout_multiplier: parse_env("SCOUT_MULTIPLIER", 5.0)?,
            use_margin: parse_env("USE_MARGIN", true)?,
            binance_api_key,
            binance_api_secret_key,
            enable_paper_trading,
            paper_wallet_balance: parse_env("PAPER_WALLET_BALANCE", 10_000.0)?,
            tld: std::env::var("TLD").unwrap_or_else(|_| "com".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

/// `WATCHLIST` env var takes precedence (space-separated symbols); otherwise
/// fall back to a newline-delimited file, skipping blanks, `#` comments, and
/// duplicates while preserving first-seen order.
fn load_watchlist(path: &Path) -> Result<Vec<String>> {
    if let Ok(raw) = std::env::var("WATCHLIST") {
        let coins: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if !coins.is_empty() {
            return Ok(coins);
        }
    }

    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read watchlist from {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    let mut coins = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if seen.insert(line.to_string()) {
            coins.push(line.to_string());
        }
    }
    Ok(coins)
}

pub fn watchlist_path() -> PathBuf {
    PathBuf::from(WATCHLIST_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchlist_file_strips_comments_blanks_and_dupes() {
        let dir = std::env::temp_dir().join(format!("ratio-trader-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("watchlist.txt");
        std::fs::write(&path, "BTC\n# comment\n\nETH\nBTC\nBNB\n").unwrap();

        let coins = load_watchlist(&path).unwrap();
        assert_eq!(coins, vec!["BTC".to_string(), "ETH".to_string(), "BNB".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_watchlist_file_yields_empty_list() {
        let coins = load_watchlist(Path::new("/nonexistent/path/watchlist.txt")).unwrap();
        assert!(coins.is_empty());
    }
}
