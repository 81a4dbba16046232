// src/types.rs
//
// Shared types for the arbot engine: sides, order lifecycle, signals,
// fills, and balances.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Millisecond timestamp since Unix epoch.
pub type TimestampMs = i64;

/// Wall-clock milliseconds since Unix epoch.
pub fn wall_clock_ms() -> TimestampMs {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type submitted to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Ioc,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Ioc => "IOC",
            OrderType::Market => "MARKET",
        }
    }
}

/// Order lifecycle state. `Filled`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

/// Execution mode selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Backtest,
    Paper,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Backtest => "backtest",
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backtest" => Some(ExecutionMode::Backtest),
            "paper" => Some(ExecutionMode::Paper),
            "live" => Some(ExecutionMode::Live),
            _ => None,
        }
    }
}

/// Detection strategy that produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    Spatial,
    Triangular,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Spatial => "SPATIAL",
            Strategy::Triangular => "TRIANGULAR",
        }
    }
}

/// Lifecycle status of a detected signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Detected,
    Executed,
    Missed,
    Rejected,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Detected => "DETECTED",
            SignalStatus::Executed => "EXECUTED",
            SignalStatus::Missed => "MISSED",
            SignalStatus::Rejected => "REJECTED",
        }
    }
}

/// One leg of an arbitrage signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLeg {
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub target_price: Decimal,
    pub max_qty: Decimal,
}

/// A detected arbitrage opportunity, consumed once by the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: u64,
    pub strategy: Strategy,
    pub symbol: String,
    pub legs: Vec<SignalLeg>,
    pub gross_spread_pct: Decimal,
    pub net_spread_pct: Decimal,
    pub estimated_pnl_usd: Decimal,
    pub notional_usd: Decimal,
    /// Blend of spread margin and depth cover, in [0, 1].
    pub confidence: f64,
    pub detected_ts: TimestampMs,
}

impl Signal {
    /// First leg with the given side, if any.
    pub fn leg(&self, side: Side) -> Option<&SignalLeg> {
        self.legs.iter().find(|l| l.side == side)
    }

    pub fn buy_exchange(&self) -> &str {
        self.leg(Side::Buy).map(|l| l.exchange.as_str()).unwrap_or("")
    }

    pub fn sell_exchange(&self) -> &str {
        self.leg(Side::Sell).map(|l| l.exchange.as_str()).unwrap_or("")
    }
}

/// Outcome of the risk gate for one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub approved: bool,
    pub reason: &'static str,
    pub detail: Option<String>,
    /// Set when the gate shrank the trade to fit inside a limit.
    pub adjusted_notional_usd: Option<Decimal>,
}

impl RiskDecision {
    pub fn approve(adjusted_notional_usd: Option<Decimal>) -> Self {
        Self {
            approved: true,
            reason: "approved",
            detail: None,
            adjusted_notional_usd,
        }
    }

    pub fn reject(reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason,
            detail: Some(detail.into()),
            adjusted_notional_usd: None,
        }
    }
}

/// Parameters for a single order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    /// Limit price; ignored for market orders.
    pub price: Option<Decimal>,
}

/// An order as tracked by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub signal_id: u64,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_qty: Decimal,
    pub requested_price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub state: OrderStatus,
    pub created_ts: TimestampMs,
    pub updated_ts: TimestampMs,
}

/// A single fill event, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    /// Exchange-assigned fill id used for deduplication, when available.
    pub exchange_fill_id: Option<String>,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub ts: TimestampMs,
}

/// Free/locked balance of one asset on one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            free: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }
}

/// A public trade print from an exchange feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePrint {
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub event_ts: TimestampMs,
    pub ingress_ts: TimestampMs,
}

/// Split "BASE/QUOTE" into its two assets.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let mut parts = symbol.splitn(2, '/');
    let base = parts.next()?;
    let quote = parts.next()?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_symbol_parses_pair() {
        assert_eq!(split_symbol("BTC/USDT"), Some(("BTC", "USDT")));
        assert_eq!(split_symbol("ETHBTC"), None);
        assert_eq!(split_symbol("/USDT"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
