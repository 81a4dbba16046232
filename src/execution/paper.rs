// src/execution/paper.rs
//
// Paper executor: simulates taker execution by walking the current book on
// each leg, applying the exchange taker fee, and settling into the virtual
// ledger. Latency is a fixed delay plus seeded jitter, so a replay of the
// same tick stream produces the same fills.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::config::Config;
use crate::connectors::BoxFuture;
use crate::ledger::Ledger;
use crate::market_state::MarketState;
use crate::orderbook::{BookSide, OrderBook};
use crate::types::{
    split_symbol, wall_clock_ms, ExecutionMode, Fill, Order, OrderStatus, OrderType, Side,
    Signal, SignalLeg, SignalStatus,
};

use super::{
    classify_two_legs, counts_as_loss, realized_pnl_usd, Executor, LegExecution, SignalOutcome,
    TwoLegResolution,
};

pub struct PaperExecutor {
    market: Arc<MarketState>,
    ledger: Arc<Mutex<Ledger>>,
    taker_fees: HashMap<String, Decimal>,
    latency_ms: u64,
    jitter_ms: u64,
    rng: Mutex<StdRng>,
    order_seq: AtomicU64,
    fill_seq: AtomicU64,
}

impl PaperExecutor {
    pub fn new(cfg: &Config, market: Arc<MarketState>, ledger: Arc<Mutex<Ledger>>) -> Self {
        let taker_fees = cfg
            .exchanges
            .iter()
            .map(|e| (e.name.clone(), e.taker_fee_pct))
            .collect();
        Self {
            market,
            ledger,
            taker_fees,
            latency_ms: cfg.execution.paper_latency_ms,
            jitter_ms: cfg.execution.paper_latency_jitter_ms,
            rng: Mutex::new(StdRng::seed_from_u64(cfg.execution.paper_seed)),
            order_seq: AtomicU64::new(0),
            fill_seq: AtomicU64::new(0),
        }
    }

    fn taker_fee_pct(&self, exchange: &str) -> Decimal {
        self.taker_fees
            .get(exchange)
            .copied()
            .unwrap_or_else(|| Decimal::new(10, 2))
    }

    fn model_latency(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            self.rng
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.latency_ms + jitter)
    }

    fn next_order_id(&self, signal_id: u64, exchange: &str) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("paper_{signal_id}_{exchange}_{seq}")
    }

    fn book(&self, exchange: &str, symbol: &str) -> Option<Arc<OrderBook>> {
        self.market.snapshot(exchange, symbol).map(|(book, _)| book)
    }

    /// Check the funding side of a leg against the virtual balances.
    fn has_balance(&self, leg_exchange: &str, symbol: &str, side: Side, qty: Decimal, price: Decimal) -> bool {
        let Some((base, quote)) = split_symbol(symbol) else {
            return false;
        };
        let ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        match side {
            Side::Buy => ledger.balance(leg_exchange, quote).free >= qty * price,
            Side::Sell => ledger.balance(leg_exchange, base).free >= qty,
        }
    }

    /// Simulate one taker leg: walk the book at the limit, apply the fee,
    /// settle into the ledger. A missing book or missing balance fails the
    /// leg at zero fill.
    fn fill_leg(
        &self,
        signal_id: u64,
        exchange: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        limit: Option<Decimal>,
        order_type: OrderType,
        is_hedge: bool,
    ) -> LegExecution {
        let created_ts = wall_clock_ms();
        let order_id = self.next_order_id(signal_id, exchange);
        let mut order = Order {
            id: order_id.clone(),
            signal_id,
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            requested_qty: qty,
            requested_price: limit,
            filled_qty: Decimal::ZERO,
            state: OrderStatus::Pending,
            created_ts,
            updated_ts: created_ts,
        };

        let book_side = match side {
            Side::Buy => BookSide::Ask,
            Side::Sell => BookSide::Bid,
        };
        let (filled_qty, vwap) = match self.book(exchange, symbol) {
            Some(book) => book.walk_qty(book_side, qty, limit),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        let funded = filled_qty > Decimal::ZERO
            && self.has_balance(exchange, symbol, side, filled_qty, vwap);

        let mut fills = Vec::new();
        let mut fee_usd = Decimal::ZERO;
        if funded {
            let fee_pct = self.taker_fee_pct(exchange);
            let fee = filled_qty * vwap * fee_pct / Decimal::ONE_HUNDRED;
            let quote_asset = split_symbol(symbol)
                .map(|(_, quote)| quote.to_string())
                .unwrap_or_default();
            let fill_id = self.fill_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let fill = Fill {
                order_id: order_id.clone(),
                exchange_fill_id: Some(format!("paper-{exchange}-{fill_id}")),
                qty: filled_qty,
                price: vwap,
                fee,
                fee_asset: quote_asset,
                ts: wall_clock_ms(),
            };
            {
                let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
                ledger.apply_fill(exchange, symbol, side, &fill);
                if let Some((base, quote)) = split_symbol(symbol) {
                    if crate::ledger::is_quote_stable(quote) {
                        ledger.set_mark(base, vwap);
                    }
                }
            }
            fee_usd = fee;
            fills.push(fill);
            order.filled_qty = filled_qty;
            order.state = if filled_qty < qty {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            };
        } else {
            order.state = if filled_qty.is_zero() {
                OrderStatus::Cancelled
            } else {
                OrderStatus::Failed
            };
        }
        order.updated_ts = wall_clock_ms();

        LegExecution {
            order,
            filled_qty: if funded { filled_qty } else { Decimal::ZERO },
            avg_price: if funded { vwap } else { Decimal::ZERO },
            fee_usd,
            fills,
            latency_ms: self.latency_ms as i64,
            is_hedge,
        }
    }

    fn execute_spatial(&self, signal: &Signal, notional_usd: Decimal) -> SignalOutcome {
        let submitted_ts = wall_clock_ms();
        let scale = if signal.notional_usd > Decimal::ZERO {
            notional_usd / signal.notional_usd
        } else {
            Decimal::ONE
        };

        let buy_leg = signal.leg(Side::Buy).cloned();
        let sell_leg = signal.leg(Side::Sell).cloned();
        let (Some(buy_leg), Some(sell_leg)) = (buy_leg, sell_leg) else {
            return SignalOutcome {
                signal_id: signal.id,
                status: SignalStatus::Missed,
                legs: Vec::new(),
                realized_pnl_usd: Decimal::ZERO,
                counts_as_loss: false,
                submitted_ts,
                completed_ts: wall_clock_ms(),
                fatal_error: None,
            };
        };

        // Trade the matched base quantity both sides can carry.
        let qty = buy_leg.max_qty.min(sell_leg.max_qty) * scale;
        let run_leg = |leg: &SignalLeg| {
            self.fill_leg(
                signal.id,
                &leg.exchange,
                &leg.symbol,
                leg.side,
                qty,
                Some(leg.target_price),
                OrderType::Ioc,
                false,
            )
        };
        let mut legs = vec![run_leg(&buy_leg), run_leg(&sell_leg)];
        let resolution = classify_two_legs(legs[0].filled_qty, legs[1].filled_qty);

        let (status, hedged) = match resolution {
            TwoLegResolution::BothFailed => (SignalStatus::Missed, false),
            TwoLegResolution::Matched => (SignalStatus::Executed, false),
            TwoLegResolution::Imbalanced { overfilled_leg } => {
                let excess = (legs[0].filled_qty - legs[1].filled_qty).abs();
                let (exchange, symbol, hedge_side) = {
                    let over = &legs[overfilled_leg].order;
                    (over.exchange.clone(), over.symbol.clone(), over.side.opposite())
                };
                let hedge = self.fill_leg(
                    signal.id,
                    &exchange,
                    &symbol,
                    hedge_side,
                    excess,
                    None,
                    OrderType::Market,
                    true,
                );
                legs.push(hedge);
                (SignalStatus::Executed, true)
            }
            TwoLegResolution::OneLegged { filled_leg } => {
                let flatten_qty = legs[filled_leg].filled_qty;
                let (exchange, symbol, hedge_side) = {
                    let filled = &legs[filled_leg].order;
                    (filled.exchange.clone(), filled.symbol.clone(), filled.side.opposite())
                };
                let hedge = self.fill_leg(
                    signal.id,
                    &exchange,
                    &symbol,
                    hedge_side,
                    flatten_qty,
                    None,
                    OrderType::Market,
                    true,
                );
                legs.push(hedge);
                (SignalStatus::Missed, true)
            }
        };

        let pnl = match status {
            SignalStatus::Missed if !hedged => Decimal::ZERO,
            _ => realized_pnl_usd(&legs),
        };
        let loss = counts_as_loss(status, pnl, hedged);
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
            ledger.record_realized(pnl, wall_clock_ms());
        }

        SignalOutcome {
            signal_id: signal.id,
            status,
            legs,
            realized_pnl_usd: pnl,
            counts_as_loss: loss,
            submitted_ts,
            completed_ts: wall_clock_ms(),
            fatal_error: None,
        }
    }

    fn execute_triangular(&self, signal: &Signal, notional_usd: Decimal) -> SignalOutcome {
        let submitted_ts = wall_clock_ms();
        let mut legs = Vec::with_capacity(signal.legs.len());
        let mut all_filled = true;
        // Walk the hops in order; a failed hop abandons the remainder of
        // the cycle (nothing to hedge on a single-exchange loop beyond the
        // already-converted inventory).
        //
        // `carry` is the amount of the next hop's input asset: quote ahead
        // of a buy, base ahead of a sell. The first hop spends the granted
        // notional.
        let mut carry = notional_usd;
        for leg in &signal.legs {
            if leg.target_price <= Decimal::ZERO {
                all_filled = false;
                break;
            }
            let qty = match leg.side {
                Side::Buy => carry / leg.target_price,
                Side::Sell => carry,
            };
            let executed = self.fill_leg(
                signal.id,
                &leg.exchange,
                &leg.symbol,
                leg.side,
                qty,
                Some(leg.target_price),
                OrderType::Ioc,
                false,
            );
            if executed.filled_qty.is_zero() {
                all_filled = false;
                legs.push(executed);
                break;
            }
            let fee_keep = Decimal::ONE
                - self.taker_fee_pct(&leg.exchange) / Decimal::ONE_HUNDRED;
            carry = match leg.side {
                // Bought base, next hop spends it.
                Side::Buy => executed.filled_qty * fee_keep,
                // Sold base into quote for the next hop.
                Side::Sell => executed.filled_qty * executed.avg_price * fee_keep,
            };
            legs.push(executed);
        }

        let status = if all_filled && legs.len() == signal.legs.len() {
            SignalStatus::Executed
        } else {
            SignalStatus::Missed
        };
        let pnl = if status == SignalStatus::Executed {
            carry - notional_usd
        } else {
            Decimal::ZERO
        };
        let loss = counts_as_loss(status, pnl, false);
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
            ledger.record_realized(pnl, wall_clock_ms());
        }

        SignalOutcome {
            signal_id: signal.id,
            status,
            legs,
            realized_pnl_usd: pnl,
            counts_as_loss: loss,
            submitted_ts,
            completed_ts: wall_clock_ms(),
            fatal_error: None,
        }
    }
}

impl Executor for PaperExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Paper
    }

    fn execute(&self, signal: Signal, notional_usd: Decimal) -> BoxFuture<'_, SignalOutcome> {
        Box::pin(async move {
            tokio::time::sleep(self.model_latency()).await;
            if signal.legs.len() == 3 {
                self.execute_triangular(&signal, notional_usd)
            } else {
                self.execute_spatial(&signal, notional_usd)
            }
        })
    }

    fn cancel_open_orders(&self) -> BoxFuture<'_, usize> {
        // Paper fills are immediate IOC; nothing ever rests.
        Box::pin(async { 0 })
    }
}
