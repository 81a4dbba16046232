// src/execution/live.rs
//
// Live executor. Both legs go out concurrently as limit IOC under one
// shared deadline; unacknowledged legs are cancelled at the deadline.
// Order state merges REST polling with whatever the connector reports,
// deduping fills by exchange fill id, and naked exposure left by an
// asymmetric outcome is flattened with a market IOC counter-order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::connectors::{
    call_with_retries, BoxFuture, ConnectorErrorKind, ExchangeClient, OrderUpdate,
};
use crate::ledger::Ledger;
use crate::metrics::EngineMetrics;
use crate::types::{
    wall_clock_ms, ExecutionMode, Order, OrderRequest, OrderStatus, OrderType, Side, Signal,
    SignalLeg, SignalStatus,
};

use super::{
    classify_two_legs, counts_as_loss, realized_pnl_usd, summarize_fills, Executor, LegExecution,
    SignalOutcome, TwoLegResolution,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct LiveExecutor {
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
    ledger: Arc<Mutex<Ledger>>,
    metrics: EngineMetrics,
    submit_deadline: Duration,
    order_timeout: Duration,
    stopped: Arc<AtomicBool>,
    order_seq: AtomicU64,
}

impl LiveExecutor {
    pub fn new(
        cfg: &Config,
        clients: HashMap<String, Arc<dyn ExchangeClient>>,
        ledger: Arc<Mutex<Ledger>>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            clients,
            ledger,
            metrics,
            submit_deadline: Duration::from_millis(cfg.execution.submit_deadline_ms.max(1)),
            order_timeout: Duration::from_secs(cfg.execution.order_timeout_s.max(1)),
            stopped: Arc::new(AtomicBool::new(false)),
            order_seq: AtomicU64::new(0),
        }
    }

    /// Handle used by the emergency stop to fence off new submissions.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    fn next_order_id(&self, signal_id: u64, exchange: &str) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("arbot_{signal_id}_{exchange}_{seq}")
    }

    fn client(&self, exchange: &str) -> Option<Arc<dyn ExchangeClient>> {
        self.clients.get(exchange).cloned()
    }

    /// Submit one leg and follow it to a terminal state. The shared
    /// submission deadline covers the ack; the order timeout covers fills.
    async fn run_leg(
        &self,
        signal_id: u64,
        exchange: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
        is_hedge: bool,
    ) -> (LegExecution, Option<String>) {
        let created_ts = wall_clock_ms();
        let client_order_id = self.next_order_id(signal_id, exchange);
        let mut order = Order {
            id: client_order_id.clone(),
            signal_id,
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            requested_qty: qty,
            requested_price: price,
            filled_qty: Decimal::ZERO,
            state: OrderStatus::Pending,
            created_ts,
            updated_ts: created_ts,
        };
        let empty = |order: Order, latency: i64| LegExecution {
            order,
            fills: Vec::new(),
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fee_usd: Decimal::ZERO,
            latency_ms: latency,
            is_hedge,
        };

        let Some(client) = self.client(exchange) else {
            order.state = OrderStatus::Failed;
            return (
                empty(order, 0),
                Some(format!("no client for exchange {exchange}")),
            );
        };

        let request = OrderRequest {
            client_order_id: client_order_id.clone(),
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            price,
        };

        // Ack within the shared deadline, or cancel and walk away.
        let submit = call_with_retries("place_order", || client.place_order(request.clone()));
        let ack = match tokio::time::timeout(self.submit_deadline, submit).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(err)) => {
                self.metrics.inc_error(err.kind.as_str());
                order.state = OrderStatus::Failed;
                order.updated_ts = wall_clock_ms();
                let fatal = matches!(err.kind, ConnectorErrorKind::Auth)
                    .then(|| format!("auth failure on {exchange}: {err}"));
                eprintln!(
                    "ERROR: signal_id={signal_id} order_id={client_order_id} submit failed: {err}"
                );
                return (empty(order, wall_clock_ms() - created_ts), fatal);
            }
            Err(_) => {
                self.metrics.inc_error("timeout");
                eprintln!(
                    "WARN: signal_id={signal_id} order_id={client_order_id} not acknowledged within {:?}; cancelling",
                    self.submit_deadline
                );
                let _ = client.cancel_order(&client_order_id, symbol).await;
                order.state = OrderStatus::Cancelled;
                order.updated_ts = wall_clock_ms();
                return (empty(order, wall_clock_ms() - created_ts), None);
            }
        };
        order.state = if ack.status == OrderStatus::Pending {
            OrderStatus::Open
        } else {
            ack.status
        };

        // Poll to terminal, dedupe fills into the ledger as they appear.
        let track_deadline = tokio::time::Instant::now() + self.order_timeout;
        let mut last_update: Option<OrderUpdate> = None;
        let mut booked_fills = Vec::new();
        loop {
            if order.state.is_terminal() {
                break;
            }
            if tokio::time::Instant::now() >= track_deadline {
                eprintln!(
                    "WARN: signal_id={signal_id} order_id={client_order_id} no terminal state within {:?}; cancelling",
                    self.order_timeout
                );
                let _ = client.cancel_order(&client_order_id, symbol).await;
                order.state = OrderStatus::Cancelled;
                break;
            }
            match client.fetch_order(&client_order_id, symbol).await {
                Ok(update) => {
                    order.filled_qty = update.filled_qty;
                    order.state = update.status;
                    order.updated_ts = update.ts;
                    {
                        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
                        for fill in &update.fills {
                            if ledger.apply_fill(exchange, symbol, side, fill) {
                                booked_fills.push(fill.clone());
                            }
                        }
                    }
                    last_update = Some(update);
                }
                Err(err) => {
                    self.metrics.inc_error(err.kind.as_str());
                    if !err.is_retryable() {
                        order.state = OrderStatus::Failed;
                        break;
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let filled_qty = last_update
            .as_ref()
            .map(|u| u.filled_qty)
            .unwrap_or(order.filled_qty);
        order.filled_qty = filled_qty;
        let (_, vwap, fee_usd) = summarize_fills(&booked_fills, symbol);
        let latency = wall_clock_ms() - created_ts;
        self.metrics.order_latency_ms.observe(latency as f64);

        (
            LegExecution {
                order,
                fills: booked_fills,
                filled_qty,
                avg_price: vwap,
                fee_usd,
                latency_ms: latency,
                is_hedge,
            },
            None,
        )
    }

    async fn execute_inner(&self, signal: Signal, notional_usd: Decimal) -> SignalOutcome {
        let submitted_ts = wall_clock_ms();
        if self.stopped.load(Ordering::Acquire) {
            return SignalOutcome {
                signal_id: signal.id,
                status: SignalStatus::Rejected,
                legs: Vec::new(),
                realized_pnl_usd: Decimal::ZERO,
                counts_as_loss: false,
                submitted_ts,
                completed_ts: wall_clock_ms(),
                fatal_error: None,
            };
        }

        let scale = if signal.notional_usd > Decimal::ZERO {
            notional_usd / signal.notional_usd
        } else {
            Decimal::ONE
        };
        let buy = signal.leg(Side::Buy).cloned();
        let sell = signal.leg(Side::Sell).cloned();
        let (Some(buy), Some(sell)) = (buy, sell) else {
            return SignalOutcome {
                signal_id: signal.id,
                status: SignalStatus::Missed,
                legs: Vec::new(),
                realized_pnl_usd: Decimal::ZERO,
                counts_as_loss: false,
                submitted_ts,
                completed_ts: wall_clock_ms(),
                fatal_error: Some(format!(
                    "signal {} lacks a buy/sell leg pair",
                    signal.id
                )),
            };
        };

        // Trade the matched base quantity both sides can carry.
        let qty = buy.max_qty.min(sell.max_qty) * scale;
        let run = |leg: SignalLeg| async move {
            self.run_leg(
                signal.id,
                &leg.exchange,
                &leg.symbol,
                leg.side,
                qty,
                Some(leg.target_price),
                OrderType::Ioc,
                false,
            )
            .await
        };
        // The two legs submit in parallel; reconciliation below is serial.
        let ((buy_leg, buy_fatal), (sell_leg, sell_fatal)) =
            tokio::join!(run(buy), run(sell));
        let mut fatal_error = buy_fatal.or(sell_fatal);
        let mut legs = vec![buy_leg, sell_leg];

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
                let (hedge, hedge_fatal) = self
                    .run_leg(
                        signal.id,
                        &exchange,
                        &symbol,
                        hedge_side,
                        excess,
                        None,
                        OrderType::Market,
                        true,
                    )
                    .await;
                fatal_error = fatal_error.or(hedge_fatal);
                legs.push(hedge);
                (SignalStatus::Executed, true)
            }
            TwoLegResolution::OneLegged { filled_leg } => {
                let flatten_qty = legs[filled_leg].filled_qty;
                let (exchange, symbol, hedge_side) = {
                    let filled = &legs[filled_leg].order;
                    (filled.exchange.clone(), filled.symbol.clone(), filled.side.opposite())
                };
                let (hedge, hedge_fatal) = self
                    .run_leg(
                        signal.id,
                        &exchange,
                        &symbol,
                        hedge_side,
                        flatten_qty,
                        None,
                        OrderType::Market,
                        true,
                    )
                    .await;
                fatal_error = fatal_error.or(hedge_fatal);
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
            fatal_error,
        }
    }
}

impl Executor for LiveExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Live
    }

    fn execute(&self, signal: Signal, notional_usd: Decimal) -> BoxFuture<'_, SignalOutcome> {
        Box::pin(self.execute_inner(signal, notional_usd))
    }

    /// Cancel everything open everywhere. Used by graceful shutdown and the
    /// emergency stop (the caller applies the 10-second budget).
    fn cancel_open_orders(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            self.stopped.store(true, Ordering::Release);
            let mut cancelled = 0usize;
            for (exchange, client) in &self.clients {
                let open = match client.open_orders().await {
                    Ok(open) => open,
                    Err(err) => {
                        eprintln!("ERROR: open-order query failed on {exchange}: {err}");
                        self.metrics.inc_error(err.kind.as_str());
                        continue;
                    }
                };
                for (order_id, symbol) in open {
                    match client.cancel_order(&order_id, &symbol).await {
                        Ok(true) => cancelled += 1,
                        Ok(false) => {}
                        Err(err) => {
                            eprintln!(
                                "ERROR: cancellation failed exchange={exchange} order_id={order_id}: {err}"
                            );
                            self.metrics.inc_error(err.kind.as_str());
                        }
                    }
                }
            }
            cancelled
        })
    }
}
