// src/execution/mod.rs
//
// Execution contract shared by the paper and live engines, plus the pure
// two-leg reconciliation logic: matched fills become a trade, asymmetric
// fills leave naked exposure that must be flattened with a counter-order,
// and the loss rules feed the circuit breaker.

pub mod live;
pub mod paper;

pub use live::LiveExecutor;
pub use paper::PaperExecutor;

use rust_decimal::Decimal;

use crate::connectors::BoxFuture;
use crate::types::{
    ExecutionMode, Fill, Order, Side, Signal, SignalStatus, TimestampMs,
};

/// One executed (or attempted) leg, fills folded in.
#[derive(Debug, Clone)]
pub struct LegExecution {
    pub order: Order,
    pub fills: Vec<Fill>,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee_usd: Decimal,
    pub latency_ms: i64,
    /// Set on the counter-order that flattened naked exposure.
    pub is_hedge: bool,
}

impl LegExecution {
    pub fn quote_flow(&self) -> Decimal {
        let notional = self.filled_qty * self.avg_price;
        match self.order.side {
            Side::Buy => -notional,
            Side::Sell => notional,
        }
    }
}

/// Terminal result of one signal through the execution engine.
#[derive(Debug, Clone)]
pub struct SignalOutcome {
    pub signal_id: u64,
    pub status: SignalStatus,
    pub legs: Vec<LegExecution>,
    pub realized_pnl_usd: Decimal,
    pub counts_as_loss: bool,
    pub submitted_ts: TimestampMs,
    pub completed_ts: TimestampMs,
    /// Auth or invariant failure that must trigger an emergency stop in
    /// live mode.
    pub fatal_error: Option<String>,
}

/// Execution engine contract. Reconciliation of one signal is serialized
/// inside `execute`; only the two leg submissions run in parallel.
pub trait Executor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Submit both legs of an approved signal at the granted notional and
    /// reconcile the outcome, hedging any imbalance.
    fn execute(&self, signal: Signal, notional_usd: Decimal) -> BoxFuture<'_, SignalOutcome>;

    /// Cancel every open order on every connected exchange. Returns the
    /// number of cancellations that were confirmed.
    fn cancel_open_orders(&self) -> BoxFuture<'_, usize>;
}

/// How a two-leg execution resolved, before any hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoLegResolution {
    BothFailed,
    Matched,
    /// One leg filled more than the other; the excess must be flattened on
    /// the indicated leg (index into the [buy, sell] pair).
    Imbalanced { overfilled_leg: usize },
    /// Exactly one leg filled at zero on the other side.
    OneLegged { filled_leg: usize },
}

/// Classify buy/sell filled quantities per the reconciliation table.
pub fn classify_two_legs(buy_filled: Decimal, sell_filled: Decimal) -> TwoLegResolution {
    let buy_zero = buy_filled.is_zero();
    let sell_zero = sell_filled.is_zero();
    match (buy_zero, sell_zero) {
        (true, true) => TwoLegResolution::BothFailed,
        (false, true) => TwoLegResolution::OneLegged { filled_leg: 0 },
        (true, false) => TwoLegResolution::OneLegged { filled_leg: 1 },
        (false, false) => {
            if buy_filled == sell_filled {
                TwoLegResolution::Matched
            } else if buy_filled > sell_filled {
                TwoLegResolution::Imbalanced { overfilled_leg: 0 }
            } else {
                TwoLegResolution::Imbalanced { overfilled_leg: 1 }
            }
        }
    }
}

/// Net realized PnL over a flat set of legs: quote received minus quote
/// spent minus fees. Valid once the base position is flat (hedge included).
pub fn realized_pnl_usd(legs: &[LegExecution]) -> Decimal {
    let flow: Decimal = legs.iter().map(|l| l.quote_flow()).sum();
    let fees: Decimal = legs.iter().map(|l| l.fee_usd).sum();
    flow - fees
}

/// Loss attribution for the consecutive-loss counter.
pub fn counts_as_loss(status: SignalStatus, pnl: Decimal, hedged: bool) -> bool {
    match status {
        SignalStatus::Executed => pnl < Decimal::ZERO,
        // Missed-plus-hedge counts as a loss unless it net made money.
        SignalStatus::Missed => hedged && pnl <= Decimal::ZERO,
        SignalStatus::Detected | SignalStatus::Rejected => false,
    }
}

/// Fee expressed in quote USD terms: quote-denominated fees pass through,
/// base-denominated fees are valued at the fill price.
pub fn fee_to_usd(fee: Decimal, fee_asset: &str, symbol: &str, price: Decimal) -> Decimal {
    match crate::types::split_symbol(symbol) {
        Some((base, _)) if base == fee_asset => fee * price,
        _ => fee,
    }
}

/// Fold raw fills into (filled_qty, vwap, fee_usd).
pub fn summarize_fills(fills: &[Fill], symbol: &str) -> (Decimal, Decimal, Decimal) {
    let mut qty = Decimal::ZERO;
    let mut cost = Decimal::ZERO;
    let mut fee_usd = Decimal::ZERO;
    for fill in fills {
        qty += fill.qty;
        cost += fill.qty * fill.price;
        fee_usd += fee_to_usd(fill.fee, &fill.fee_asset, symbol, fill.price);
    }
    let vwap = if qty > Decimal::ZERO {
        cost / qty
    } else {
        Decimal::ZERO
    };
    (qty, vwap, fee_usd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn leg(side: Side, qty: Decimal, price: Decimal, fee_usd: Decimal) -> LegExecution {
        LegExecution {
            order: Order {
                id: "ord".to_string(),
                signal_id: 1,
                exchange: "binance".to_string(),
                symbol: "BTC/USDT".to_string(),
                side,
                order_type: OrderType::Ioc,
                requested_qty: qty,
                requested_price: Some(price),
                filled_qty: qty,
                state: OrderStatus::Filled,
                created_ts: 0,
                updated_ts: 0,
            },
            fills: Vec::new(),
            filled_qty: qty,
            avg_price: price,
            fee_usd,
            latency_ms: 1,
            is_hedge: false,
        }
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify_two_legs(dec!(0), dec!(0)), TwoLegResolution::BothFailed);
        assert_eq!(classify_two_legs(dec!(1), dec!(1)), TwoLegResolution::Matched);
        assert_eq!(
            classify_two_legs(dec!(1), dec!(0.4)),
            TwoLegResolution::Imbalanced { overfilled_leg: 0 }
        );
        assert_eq!(
            classify_two_legs(dec!(0.4), dec!(1)),
            TwoLegResolution::Imbalanced { overfilled_leg: 1 }
        );
        assert_eq!(
            classify_two_legs(dec!(1), dec!(0)),
            TwoLegResolution::OneLegged { filled_leg: 0 }
        );
    }

    #[test]
    fn pnl_is_quote_flow_minus_fees() {
        let legs = vec![
            leg(Side::Buy, dec!(10), dec!(100.0), dec!(1.0)),
            leg(Side::Sell, dec!(10), dec!(100.5), dec!(1.0)),
        ];
        // 1005 - 1000 - 2 = 3
        assert_eq!(realized_pnl_usd(&legs), dec!(3.0));
    }

    #[test]
    fn loss_rules() {
        assert!(counts_as_loss(SignalStatus::Executed, dec!(-0.5), false));
        assert!(!counts_as_loss(SignalStatus::Executed, dec!(0.5), false));
        // Missed with a hedge: break-even still counts as a loss.
        assert!(counts_as_loss(SignalStatus::Missed, dec!(0), true));
        assert!(!counts_as_loss(SignalStatus::Missed, dec!(0.2), true));
        // Plain miss, no position change: never a loss.
        assert!(!counts_as_loss(SignalStatus::Missed, dec!(0), false));
    }

    #[test]
    fn fee_conversion_handles_base_denominated_fees() {
        assert_eq!(fee_to_usd(dec!(0.001), "BTC", "BTC/USDT", dec!(100)), dec!(0.1));
        assert_eq!(fee_to_usd(dec!(0.5), "USDT", "BTC/USDT", dec!(100)), dec!(0.5));
    }
}
