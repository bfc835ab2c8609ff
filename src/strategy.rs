// =============================================================================
// StrategyPort — pluggable scout-margin strategies, looked up by name
// =============================================================================
//
// The original bot discovers strategies by scanning a directory and exec'ing
// whatever module it finds there. Runtime plugin discovery isn't a
// requirement here, so strategies are registered at build time and resolved
// by name instead.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};

/// Computes the margin a candidate ratio must clear before a coin-jump is
/// considered profitable.
pub trait StrategyPort: Send + Sync {
    fn name(&self) -> &'static str;

    /// `scout_margin` is the configured threshold fraction (e.g. 0.8);
    /// `fees_factor` is 1.0 when margin-adjustment is disabled, else the
    /// combined round-trip fee multiplier for the candidate pair.
    fn scout_margin_factor(&self, scout_margin: f64, fees_factor: f64) -> f64;
}

/// The only strategy a complete implementation requires: greedy pairwise
/// ratio jumps with a fee-adjusted margin.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRatioJumpStrategy;

impl StrategyPort for DefaultRatioJumpStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn scout_margin_factor(&self, scout_margin: f64, fees_factor: f64) -> f64 {
        1.0 - scout_margin * fees_factor / 100.0
    }
}

/// Resolve a strategy by its configured name. An unknown name is a
/// misconfiguration, fatal at startup.
pub fn lookup_strategy(name: &str) -> Result<Arc<dyn StrategyPort>> {
    match name {
        "default" => Ok(Arc::new(DefaultRatioJumpStrategy)),
        other => bail!("unknown strategy: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_margin_factor_matches_formula() {
        let s = DefaultRatioJumpStrategy;
        assert_eq!(s.scout_margin_factor(0.8, 1.0), 1.0 - 0.8 / 100.0);
    }

    #[test]
    fn lookup_rejects_unknown_strategy_name() {
        assert!(lookup_strategy("made-up-strategy").is_err());
    }

    #[test]
    fn lookup_resolves_default_by_name() {
        let s = lookup_strategy("default").unwrap();
        assert_eq!(s.name(), "default");
    }
}
