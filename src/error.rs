// =============================================================================
// Domain error kinds — distinguishes the error *kinds* the core must branch on
// =============================================================================
//
// Ambient glue (REST calls, file I/O, JSON parsing) still uses `anyhow`
// throughout the crate; this enum exists only where callers need to match on
// the kind of failure: retry, memoize, or abort.
// =============================================================================

use thiserror::Error;

/// A classified trading-engine error, used where callers branch on error kind.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Network error, rate limit, HTTP 5xx, or a transient exchange order
    /// error. Retried with backoff inside the executor; surfaced only after
    /// retries are exhausted.
    #[error("transient exchange fault: {0}")]
    Transient(String),

    /// The exchange does not recognize the symbol. Memoized by the caller so
    /// it is never retried.
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    /// The persistent store failed to read or write. The enclosing job
    /// continues; the caller decides whether to skip this tick's commit.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Missing credentials, unknown strategy name, or an empty watchlist.
    /// Fatal at startup.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),
}

impl TradingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TradingError::Transient(_))
    }
}
