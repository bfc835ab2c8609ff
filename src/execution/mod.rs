// =============================================================================
// Execution — order placement, quantity rounding, and fee estimation
// =============================================================================
//
// `OrderExecutor` is the seam between the decision core and an exchange: a
// live implementation places real orders, a paper implementation simulates
// fills against a JSON-persisted wallet. Both share the quantity-rounding
// and fee-estimation helpers below.
// =============================================================================

pub mod binance_client;
pub mod live;
pub mod paper;

pub use live::LiveExecutor;
pub use paper::PaperExecutor;

use anyhow::Result;

use crate::types::{OrderReport, OrderSide};

/// Places market orders and reports balances. Implemented once against the
/// real exchange and once against a simulated paper wallet.
#[async_trait::async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Spend `target_balance` of `target_symbol` buying `origin_symbol`.
    async fn buy_alt(
        &self,
        origin_symbol: &str,
        target_symbol: &str,
        buy_price: f64,
    ) -> Result<OrderReport>;

    /// Sell the full `origin_symbol` balance into `target_symbol`.
    async fn sell_alt(
        &self,
        origin_symbol: &str,
        target_symbol: &str,
        sell_price: f64,
    ) -> Result<OrderReport>;

    async fn currency_balance(&self, symbol: &str, force: bool) -> Result<f64>;
}

/// Round `amount` down to the tick granularity `10^-tick_exponent` allows.
/// A `tick_exponent` of 3 means the smallest representable step is 0.001.
pub fn round_to_tick(amount: f64, tick_exponent: i32) -> f64 {
    let scale = 10f64.powi(tick_exponent);
    (amount * scale).floor() / scale
}

/// Quantity of `origin_symbol` a market buy of `target_balance` quote funds
/// would obtain at `from_coin_price`, rounded down to `tick_exponent`.
pub fn buy_quantity(target_balance: f64, from_coin_price: f64, tick_exponent: i32) -> f64 {
    round_to_tick(target_balance / from_coin_price, tick_exponent)
}

/// Quantity of `origin_symbol` a market sell would offer, rounded down to
/// `tick_exponent`.
pub fn sell_quantity(origin_balance: f64, tick_exponent: i32) -> f64 {
    round_to_tick(origin_balance, tick_exponent)
}

/// Estimate the effective taker fee rate, applying the 25% BNB-fee-burn
/// discount when the account holds enough BNB to cover the fee.
pub fn estimate_fee_rate(
    base_fee: f64,
    uses_bnb_for_fees: bool,
    amount_trading: f64,
    origin_symbol: &str,
    origin_price_in_bnb: Option<f64>,
    bnb_balance: f64,
) -> f64 {
    if !uses_bnb_for_fees {
        return base_fee;
    }
    let fee_amount = amount_trading * base_fee * 0.75;
    let fee_amount_bnb = if origin_symbol == "BNB" {
        fee_amount
    } else {
        match origin_price_in_bnb {
            Some(price) => fee_amount * price,
            None => return base_fee,
        }
    };
    if bnb_balance >= fee_amount_bnb {
        base_fee * 0.75
    } else {
        base_fee
    }
}

pub fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_tick_truncates_toward_zero_decimals() {
        assert_eq!(round_to_tick(1.23456, 3), 1.234);
        assert_eq!(round_to_tick(1.999, 0), 1.0);
    }

    #[test]
    fn buy_quantity_divides_then_rounds() {
        let q = buy_quantity(100.0, 33.33, 2);
        assert_eq!(q, 3.0);
    }

    #[test]
    fn bnb_discount_applies_only_with_sufficient_balance() {
        let with_enough = estimate_fee_rate(0.001, true, 10.0, "ETH", Some(0.01), 10.0);
        assert_eq!(with_enough, 0.00075);

        let without_enough = estimate_fee_rate(0.001, true, 10.0, "ETH", Some(0.01), 0.0);
        assert_eq!(without_enough, 0.001);

        let not_using_bnb = estimate_fee_rate(0.001, false, 10.0, "ETH", Some(0.01), 100.0);
        assert_eq!(not_using_bnb, 0.001);
    }
}
