// src/connectors/mock.rs
//
// Scripted in-process connector for tests and demos. Feeds are driven by
// the test (publish snapshots/trades directly); execution fills against the
// last published book, with optional fill-ratio caps and injected errors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;

use crate::market_state::MarketState;
use crate::orderbook::{BookLevel, BookSide, OrderBook};
use crate::types::{
    wall_clock_ms, Balance, Fill, OrderRequest, OrderStatus, OrderType, Side, TimestampMs,
    TradePrint,
};

use super::{
    BoxFuture, ConnState, ConnectorError, ConnectorResult, ConnectorStatus, ExchangeClient,
    OrderAck, OrderUpdate,
};

#[derive(Debug, Clone)]
struct PlannedResponse {
    /// Cap on the filled fraction of the requested quantity.
    fill_ratio: Decimal,
    error: Option<ConnectorError>,
}

pub struct MockConnector {
    name: String,
    pub status: Arc<ConnectorStatus>,
    market: Arc<MarketState>,
    taker_fee_pct: Decimal,
    books: Mutex<HashMap<String, OrderBook>>,
    seq: AtomicU64,
    fill_seq: AtomicU64,
    planned: Mutex<VecDeque<PlannedResponse>>,
    orders: Mutex<HashMap<String, OrderUpdate>>,
    order_symbols: Mutex<HashMap<String, String>>,
    balances: Mutex<HashMap<String, Balance>>,
}

impl MockConnector {
    pub fn new(name: &str, market: Arc<MarketState>, taker_fee_pct: Decimal) -> Arc<Self> {
        let status = ConnectorStatus::new(name);
        status.set(ConnState::Streaming);
        Arc::new(Self {
            name: name.to_string(),
            status,
            market,
            taker_fee_pct,
            books: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            fill_seq: AtomicU64::new(0),
            planned: Mutex::new(VecDeque::new()),
            orders: Mutex::new(HashMap::new()),
            order_symbols: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
        })
    }

    /// Publish a book snapshot as if it had arrived over the feed.
    pub fn publish_snapshot(
        &self,
        symbol: &str,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        event_ts: TimestampMs,
        ingress_ts: TimestampMs,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let bids: Vec<BookLevel> = bids
            .iter()
            .map(|&(price, qty)| BookLevel { price, qty })
            .collect();
        let asks: Vec<BookLevel> = asks
            .iter()
            .map(|&(price, qty)| BookLevel { price, qty })
            .collect();
        let mut books = self.books.lock().unwrap_or_else(|p| p.into_inner());
        let book = books
            .entry(symbol.to_string())
            .or_insert_with(|| OrderBook::new(self.name.clone(), symbol.to_string()));
        if let Err(err) = book.apply_snapshot(&bids, &asks, seq, event_ts, ingress_ts) {
            eprintln!("WARN: mock snapshot rejected symbol={symbol} err={err}");
            return;
        }
        self.market.publish_book(Arc::new(book.clone()));
    }

    pub fn publish_trade(&self, symbol: &str, side: Side, price: Decimal, qty: Decimal, ts: TimestampMs) {
        self.market.publish_trade(TradePrint {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            side,
            price,
            qty,
            event_ts: ts,
            ingress_ts: ts,
        });
    }

    /// Cap the next order's fill at a fraction of its quantity.
    pub fn plan_fill_ratio(&self, ratio: Decimal) {
        self.planned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(PlannedResponse {
                fill_ratio: ratio,
                error: None,
            });
    }

    /// Fail the next order submission with the given error.
    pub fn plan_error(&self, error: ConnectorError) {
        self.planned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(PlannedResponse {
                fill_ratio: Decimal::ZERO,
                error: Some(error),
            });
    }

    pub fn set_balance(&self, asset: &str, balance: Balance) {
        self.balances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(asset.to_string(), balance);
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Seed a resting open order, for cancel-all and emergency-stop tests.
    pub fn inject_open_order(&self, client_order_id: &str, symbol: &str) {
        self.orders.lock().unwrap_or_else(|p| p.into_inner()).insert(
            client_order_id.to_string(),
            OrderUpdate {
                exchange_order_id: Some(format!("{}-{client_order_id}", self.name)),
                client_order_id: client_order_id.to_string(),
                status: OrderStatus::Open,
                filled_qty: Decimal::ZERO,
                fills: Vec::new(),
                ts: wall_clock_ms(),
            },
        );
        self.order_symbols
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(client_order_id.to_string(), symbol.to_string());
    }

    fn next_planned(&self) -> Option<PlannedResponse> {
        self.planned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn fill_against_book(&self, req: &OrderRequest, ratio: Decimal) -> (Decimal, Decimal) {
        let books = self.books.lock().unwrap_or_else(|p| p.into_inner());
        let Some(book) = books.get(&req.symbol) else {
            return (Decimal::ZERO, Decimal::ZERO);
        };
        let book_side = match req.side {
            Side::Buy => BookSide::Ask,
            Side::Sell => BookSide::Bid,
        };
        let limit = match req.order_type {
            OrderType::Market => None,
            _ => req.price,
        };
        let capped_qty = req.qty * ratio;
        book.walk_qty(book_side, capped_qty, limit)
    }
}

impl ExchangeClient for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn place_order(&self, req: OrderRequest) -> BoxFuture<'_, ConnectorResult<OrderAck>> {
        Box::pin(async move {
            let planned = self.next_planned().unwrap_or(PlannedResponse {
                fill_ratio: Decimal::ONE,
                error: None,
            });
            if let Some(error) = planned.error {
                return Err(error);
            }
            let (filled_qty, vwap) = self.fill_against_book(&req, planned.fill_ratio);
            let status = if filled_qty.is_zero() {
                OrderStatus::Cancelled
            } else if filled_qty < req.qty {
                // IOC semantics: the remainder is cancelled, the fill stands.
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            };
            let mut fills = Vec::new();
            if filled_qty > Decimal::ZERO {
                let fill_id = self.fill_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let fee = filled_qty * vwap * self.taker_fee_pct / Decimal::ONE_HUNDRED;
                let quote = crate::types::split_symbol(&req.symbol)
                    .map(|(_, quote)| quote.to_string())
                    .unwrap_or_else(|| "USDT".to_string());
                fills.push(Fill {
                    order_id: req.client_order_id.clone(),
                    exchange_fill_id: Some(format!("{}-fill-{fill_id}", self.name)),
                    qty: filled_qty,
                    price: vwap,
                    fee,
                    fee_asset: quote,
                    ts: wall_clock_ms(),
                });
            }
            let update = OrderUpdate {
                exchange_order_id: Some(format!("{}-{}", self.name, req.client_order_id)),
                client_order_id: req.client_order_id.clone(),
                status,
                filled_qty,
                fills,
                ts: wall_clock_ms(),
            };
            self.orders
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(req.client_order_id.clone(), update.clone());
            self.order_symbols
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(req.client_order_id.clone(), req.symbol.clone());
            Ok(OrderAck {
                exchange_order_id: update.exchange_order_id.clone(),
                status,
            })
        })
    }

    fn cancel_order(
        &self,
        client_order_id: &str,
        _symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<bool>> {
        let client_order_id = client_order_id.to_string();
        Box::pin(async move {
            let mut orders = self.orders.lock().unwrap_or_else(|p| p.into_inner());
            match orders.get_mut(&client_order_id) {
                Some(update) if !update.status.is_terminal() => {
                    update.status = OrderStatus::Cancelled;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn fetch_order(
        &self,
        client_order_id: &str,
        _symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<OrderUpdate>> {
        let client_order_id = client_order_id.to_string();
        Box::pin(async move {
            self.orders
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(&client_order_id)
                .cloned()
                .ok_or_else(|| ConnectorError::business(format!("unknown order {client_order_id}")))
        })
    }

    fn get_balances(&self) -> BoxFuture<'_, ConnectorResult<HashMap<String, Balance>>> {
        Box::pin(async move {
            Ok(self
                .balances
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone())
        })
    }

    fn open_orders(&self) -> BoxFuture<'_, ConnectorResult<Vec<(String, String)>>> {
        Box::pin(async move {
            let orders = self.orders.lock().unwrap_or_else(|p| p.into_inner());
            let symbols = self.order_symbols.lock().unwrap_or_else(|p| p.into_inner());
            Ok(orders
                .values()
                .filter(|update| !update.status.is_terminal())
                .map(|update| {
                    let symbol = symbols
                        .get(&update.client_order_id)
                        .cloned()
                        .unwrap_or_default();
                    (update.client_order_id.clone(), symbol)
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: Side, qty: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: format!("mock-{}-{qty}", side.as_str()),
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            order_type: OrderType::Ioc,
            qty,
            price: Some(price),
        }
    }

    #[tokio::test]
    async fn fills_against_published_book() {
        let market = Arc::new(MarketState::new(16));
        let mock = MockConnector::new("mock", market, dec!(0.10));
        mock.publish_snapshot(
            "BTC/USDT",
            &[(dec!(99.5), dec!(5))],
            &[(dec!(100.0), dec!(5))],
            1_000,
            1_000,
        );
        let ack = mock
            .place_order(request(Side::Buy, dec!(2), dec!(100.0)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        let update = mock.fetch_order("mock-BUY-2", "BTC/USDT").await.unwrap();
        assert_eq!(update.filled_qty, dec!(2));
        assert_eq!(update.fills[0].price, dec!(100.0));
        assert_eq!(update.fills[0].fee, dec!(0.2));
    }

    #[tokio::test]
    async fn planned_ratio_caps_fill() {
        let market = Arc::new(MarketState::new(16));
        let mock = MockConnector::new("mock", market, dec!(0));
        mock.publish_snapshot(
            "BTC/USDT",
            &[(dec!(99.5), dec!(5))],
            &[(dec!(100.0), dec!(5))],
            1_000,
            1_000,
        );
        mock.plan_fill_ratio(dec!(0.4));
        let ack = mock
            .place_order(request(Side::Buy, dec!(1), dec!(100.0)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::PartiallyFilled);
        let update = mock.fetch_order("mock-BUY-1", "BTC/USDT").await.unwrap();
        assert_eq!(update.filled_qty, dec!(0.4));
    }

    #[tokio::test]
    async fn planned_error_surfaces() {
        let market = Arc::new(MarketState::new(16));
        let mock = MockConnector::new("mock", market, dec!(0));
        mock.plan_error(ConnectorError::business("insufficient balance"));
        let err = mock
            .place_order(request(Side::Sell, dec!(1), dec!(100.0)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::ConnectorErrorKind::Business);
    }
}
