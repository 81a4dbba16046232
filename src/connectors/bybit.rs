// src/connectors/bybit.rs
//
// Bybit connector. The book stream is the incremental shape: one snapshot
// per topic then seq-checked deltas; a gap tears the topic down and
// resubscribes, which re-delivers a snapshot. REST uses the v5 signed
// header scheme.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::ExchangeConfig;
use crate::market_state::MarketState;
use crate::metrics::EngineMetrics;
use crate::ops::SecretProvider;
use crate::orderbook::{BookDelta, BookError, BookLevel, BookSide, OrderBook};
use crate::rate_limit::RateLimiter;
use crate::types::{
    wall_clock_ms, Balance, Fill, OrderRequest, OrderStatus, OrderType, Side, TimestampMs,
    TradePrint,
};

use super::{
    run_supervised_feed, BoxFuture, ConnState, ConnectorError, ConnectorErrorKind,
    ConnectorResult, ConnectorStatus, ExchangeClient, OrderAck, OrderUpdate,
};

const WS_URL_DEFAULT: &str = "wss://stream.bybit.com/v5/public/spot";
const REST_URL_DEFAULT: &str = "https://api.bybit.com";
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

pub struct BybitConnector {
    cfg: ExchangeConfig,
    symbols: Vec<String>,
    ws_url: String,
    rest_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    pub status: Arc<ConnectorStatus>,
    market: Arc<MarketState>,
    limiter: Arc<RateLimiter>,
    metrics: EngineMetrics,
    http: reqwest::Client,
}

impl BybitConnector {
    pub fn new(
        cfg: ExchangeConfig,
        symbols: Vec<String>,
        market: Arc<MarketState>,
        metrics: EngineMetrics,
        secrets: &dyn SecretProvider,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&cfg.rate_limit));
        Self {
            symbols,
            ws_url: secrets
                .get("ARBOT_BYBIT_WS_URL")
                .unwrap_or_else(|| WS_URL_DEFAULT.to_string()),
            rest_url: secrets
                .get("ARBOT_BYBIT_REST_URL")
                .unwrap_or_else(|| REST_URL_DEFAULT.to_string()),
            api_key: secrets.get("ARBOT_BYBIT_API_KEY"),
            api_secret: secrets.get("ARBOT_BYBIT_API_SECRET"),
            status: ConnectorStatus::new(&cfg.name),
            market,
            limiter,
            metrics,
            http: reqwest::Client::new(),
            cfg,
        }
    }

    pub async fn run_feeds(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let status = self.status.clone();
        let ws_cfg = self.cfg.websocket.clone();
        run_supervised_feed(status, ws_cfg, move || {
            let connector = self.clone();
            let mut shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    result = connector.feed_session() => result,
                    _ = shutdown.changed() => Ok(()),
                }
            }
        })
        .await;
    }

    fn book_topic(&self, symbol: &str) -> String {
        format!(
            "orderbook.{}.{}",
            self.cfg.websocket.orderbook_depth.max(1),
            to_exchange_symbol(symbol)
        )
    }

    async fn feed_session(&self) -> anyhow::Result<()> {
        self.status.set(ConnState::Connecting);
        let (ws, _) = tokio::time::timeout(WS_CONNECT_TIMEOUT, connect_async(self.ws_url.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("bybit ws connect timed out"))??;
        let (mut write, mut read) = ws.split();

        let mut topics: Vec<String> = Vec::new();
        for symbol in &self.symbols {
            topics.push(self.book_topic(symbol));
            topics.push(format!("publicTrade.{}", to_exchange_symbol(symbol)));
        }
        write
            .send(Message::Text(
                json!({"op": "subscribe", "args": topics}).to_string(),
            ))
            .await?;

        let symbol_map: HashMap<String, String> = self
            .symbols
            .iter()
            .map(|s| (to_exchange_symbol(s), s.clone()))
            .collect();
        let mut books: HashMap<String, OrderBook> = HashMap::new();
        let heartbeat = Duration::from_secs(self.cfg.websocket.heartbeat_interval_s.max(1));
        let read_timeout = heartbeat * 2;
        let mut ping_timer = tokio::time::interval(heartbeat);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await;
        let mut subscribed_ack = false;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Text(json!({"op": "ping"}).to_string()))
                        .await?;
                }
                frame = tokio::time::timeout(read_timeout, read.next()) => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame?,
                        Ok(None) => anyhow::bail!("bybit ws closed by server"),
                        Err(_) => anyhow::bail!("bybit ws heartbeat missed ({read_timeout:?})"),
                    };
                    self.metrics
                        .ws_messages
                        .with_label_values(&[&self.cfg.name])
                        .inc();
                    let payload = match frame {
                        Message::Text(text) => text,
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Message::Close(_) => anyhow::bail!("bybit ws server close"),
                        _ => continue,
                    };
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            self.metrics.inc_error("protocol");
                            eprintln!("WARN: bybit ws parse error: {err}");
                            continue;
                        }
                    };
                    if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
                        if op == "subscribe"
                            && value.get("success").and_then(|v| v.as_bool()) == Some(true)
                            && !subscribed_ack
                        {
                            // All subscriptions acknowledged.
                            self.status.set(ConnState::Subscribed);
                            subscribed_ack = true;
                        }
                        continue;
                    }
                    let ingress_ts = wall_clock_ms();
                    let Some(topic) = value.get("topic").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if topic.starts_with("orderbook.") {
                        if let Some(resub) =
                            self.handle_book(&value, &symbol_map, &mut books, ingress_ts)
                        {
                            // Sequence gap: resubscribe the topic to force a
                            // fresh snapshot.
                            let args = json!({"op": "unsubscribe", "args": [resub.clone()]});
                            write.send(Message::Text(args.to_string())).await?;
                            let args = json!({"op": "subscribe", "args": [resub]});
                            write.send(Message::Text(args.to_string())).await?;
                        }
                        self.status.set(ConnState::Streaming);
                    } else if topic.starts_with("publicTrade.") {
                        self.handle_trades(&value, &symbol_map, ingress_ts);
                    }
                }
            }
        }
    }

    /// Apply one orderbook frame. Returns the topic to resubscribe when a
    /// sequence gap invalidated the local book.
    fn handle_book(
        &self,
        value: &Value,
        symbol_map: &HashMap<String, String>,
        books: &mut HashMap<String, OrderBook>,
        ingress_ts: TimestampMs,
    ) -> Option<String> {
        let data = value.get("data")?;
        let raw_symbol = data.get("s").and_then(|v| v.as_str())?;
        let symbol = symbol_map.get(raw_symbol)?;
        let seq = data.get("u").and_then(|v| v.as_u64())?;
        let event_ts = value.get("ts").and_then(|v| v.as_i64()).unwrap_or(ingress_ts);
        self.metrics
            .feed_latency_ms
            .observe(ingress_ts.saturating_sub(event_ts).max(0) as f64);
        let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

        let book = books
            .entry(symbol.clone())
            .or_insert_with(|| OrderBook::new(self.cfg.name.clone(), symbol.clone()));

        let result = if kind == "snapshot" {
            let bids = parse_levels(data.get("b"))?;
            let asks = parse_levels(data.get("a"))?;
            // A resubscribed snapshot restarts the sequence domain.
            book.invalidate();
            book.apply_snapshot(&bids, &asks, seq, event_ts, ingress_ts)
        } else {
            let mut deltas = parse_deltas(data.get("b"), BookSide::Bid)?;
            deltas.extend(parse_deltas(data.get("a"), BookSide::Ask)?);
            book.apply_delta(&deltas, seq, event_ts, ingress_ts)
        };

        match result {
            Ok(()) => {
                self.market.publish_book(Arc::new(book.clone()));
                None
            }
            Err(BookError::SeqGap { last_seq, incoming_seq }) => {
                self.metrics.inc_error("protocol");
                eprintln!(
                    "WARN: bybit seq gap symbol={symbol} last={last_seq} incoming={incoming_seq}; resyncing"
                );
                book.invalidate();
                Some(self.book_topic(symbol))
            }
            Err(err) => {
                self.metrics.inc_error("protocol");
                eprintln!("WARN: bybit book rejected symbol={symbol} err={err}");
                book.invalidate();
                Some(self.book_topic(symbol))
            }
        }
    }

    fn handle_trades(
        &self,
        value: &Value,
        symbol_map: &HashMap<String, String>,
        ingress_ts: TimestampMs,
    ) {
        let Some(rows) = value.get("data").and_then(|v| v.as_array()) else {
            return;
        };
        for row in rows {
            let Some(raw_symbol) = row.get("s").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(symbol) = symbol_map.get(raw_symbol) else {
                continue;
            };
            let (Some(price), Some(qty)) = (
                parse_decimal_field(row.get("p")),
                parse_decimal_field(row.get("v")),
            ) else {
                self.metrics.inc_error("protocol");
                continue;
            };
            let side = match row.get("S").and_then(|v| v.as_str()) {
                Some("Sell") => Side::Sell,
                _ => Side::Buy,
            };
            self.market.publish_trade(TradePrint {
                exchange: self.cfg.name.clone(),
                symbol: symbol.clone(),
                side,
                price,
                qty,
                event_ts: row.get("T").and_then(|v| v.as_i64()).unwrap_or(ingress_ts),
                ingress_ts,
            });
        }
    }

    fn credentials(&self) -> ConnectorResult<(&str, &str)> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => Err(ConnectorError::auth(
                "bybit credentials missing (ARBOT_BYBIT_API_KEY/SECRET)",
            )),
        }
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<Value>,
        weight: u32,
    ) -> ConnectorResult<Value> {
        let (key, secret) = self.credentials()?;
        let waited = self.limiter.acquire(weight).await;
        if !waited.is_zero() {
            self.metrics
                .rate_limit_wait_ms
                .with_label_values(&[&self.cfg.name])
                .inc_by(waited.as_millis() as u64);
        }
        let timestamp = wall_clock_ms().to_string();
        let payload = match &body {
            Some(body) => body.to_string(),
            None => query.to_string(),
        };
        let to_sign = format!("{timestamp}{key}{RECV_WINDOW_MS}{payload}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ConnectorError::auth("bybit secret unusable for HMAC"))?;
        mac.update(to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let url = if query.is_empty() {
            format!("{}{path}", self.rest_url)
        } else {
            format!("{}{path}?{query}", self.rest_url)
        };
        let mut request = self
            .http
            .request(method, url)
            .header("X-BAPI-API-KEY", key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature)
            .timeout(Duration::from_secs(10));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ConnectorError::timeout(format!("bybit {path}: {err}"))
            } else {
                ConnectorError::transient(format!("bybit {path}: {err}"))
            }
        })?;
        classify_response(path, response).await
    }
}

async fn classify_response(path: &str, response: reqwest::Response) -> ConnectorResult<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
        return Err(ConnectorError::rate_limited(format!("bybit {path} http={status}")));
    }
    if status.is_server_error() {
        return Err(ConnectorError::transient(format!("bybit {path} http={status}")));
    }
    let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
    if ret_code == 0 {
        return Ok(body);
    }
    let msg = body
        .get("retMsg")
        .and_then(|v| v.as_str())
        .unwrap_or("no message");
    let detail = format!("bybit {path} retCode={ret_code} retMsg={msg}");
    match ret_code {
        10006 => Err(ConnectorError::rate_limited(detail)),
        10003 | 10004 | 10005 | 33004 => Err(ConnectorError::auth(detail)),
        _ => Err(ConnectorError::business(detail)),
    }
}

impl ExchangeClient for BybitConnector {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn place_order(&self, req: OrderRequest) -> BoxFuture<'_, ConnectorResult<OrderAck>> {
        Box::pin(async move {
            let mut body = json!({
                "category": "spot",
                "symbol": to_exchange_symbol(&req.symbol),
                "side": match req.side { Side::Buy => "Buy", Side::Sell => "Sell" },
                "qty": req.qty.normalize().to_string(),
                "orderLinkId": req.client_order_id,
            });
            match req.order_type {
                OrderType::Market => {
                    body["orderType"] = json!("Market");
                }
                OrderType::Limit | OrderType::Ioc => {
                    let price = req.price.ok_or_else(|| {
                        ConnectorError::business("limit order without a price")
                    })?;
                    body["orderType"] = json!("Limit");
                    body["price"] = json!(price.normalize().to_string());
                    body["timeInForce"] =
                        json!(if req.order_type == OrderType::Ioc { "IOC" } else { "GTC" });
                }
            }
            let response = self
                .signed_request(reqwest::Method::POST, "/v5/order/create", "", Some(body), 1)
                .await?;
            Ok(OrderAck {
                exchange_order_id: response
                    .pointer("/result/orderId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                status: OrderStatus::Open,
            })
        })
    }

    fn cancel_order(
        &self,
        client_order_id: &str,
        symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<bool>> {
        let client_order_id = client_order_id.to_string();
        let symbol = symbol.to_string();
        Box::pin(async move {
            let body = json!({
                "category": "spot",
                "symbol": to_exchange_symbol(&symbol),
                "orderLinkId": client_order_id,
            });
            match self
                .signed_request(reqwest::Method::POST, "/v5/order/cancel", "", Some(body), 1)
                .await
            {
                Ok(_) => Ok(true),
                Err(err) if err.kind == ConnectorErrorKind::Business => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn fetch_order(
        &self,
        client_order_id: &str,
        symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<OrderUpdate>> {
        let client_order_id = client_order_id.to_string();
        let symbol = symbol.to_string();
        Box::pin(async move {
            let query = format!(
                "category=spot&symbol={}&orderLinkId={}",
                to_exchange_symbol(&symbol),
                client_order_id
            );
            let body = self
                .signed_request(reqwest::Method::GET, "/v5/order/realtime", &query, None, 1)
                .await?;
            let row = body
                .pointer("/result/list/0")
                .cloned()
                .unwrap_or(Value::Null);
            let status = parse_order_status(row.get("orderStatus").and_then(|v| v.as_str()));
            let filled_qty =
                parse_decimal_field(row.get("cumExecQty")).unwrap_or(Decimal::ZERO);

            let mut fills = Vec::new();
            if filled_qty > Decimal::ZERO {
                let query = format!(
                    "category=spot&symbol={}&orderLinkId={}",
                    to_exchange_symbol(&symbol),
                    client_order_id
                );
                let execs = self
                    .signed_request(reqwest::Method::GET, "/v5/execution/list", &query, None, 1)
                    .await?;
                if let Some(rows) = execs.pointer("/result/list").and_then(|v| v.as_array()) {
                    for exec_row in rows {
                        let (Some(price), Some(qty)) = (
                            parse_decimal_field(exec_row.get("execPrice")),
                            parse_decimal_field(exec_row.get("execQty")),
                        ) else {
                            continue;
                        };
                        fills.push(Fill {
                            order_id: client_order_id.clone(),
                            exchange_fill_id: exec_row
                                .get("execId")
                                .and_then(|v| v.as_str())
                                .map(|id| format!("bybit-{id}")),
                            qty,
                            price,
                            fee: parse_decimal_field(exec_row.get("execFee"))
                                .unwrap_or(Decimal::ZERO),
                            fee_asset: exec_row
                                .get("feeCurrency")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            ts: exec_row
                                .get("execTime")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse::<i64>().ok())
                                .unwrap_or(0),
                        });
                    }
                }
            }

            Ok(OrderUpdate {
                exchange_order_id: row
                    .get("orderId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                client_order_id,
                status,
                filled_qty,
                fills,
                ts: wall_clock_ms(),
            })
        })
    }

    fn get_balances(&self) -> BoxFuture<'_, ConnectorResult<HashMap<String, Balance>>> {
        Box::pin(async move {
            let body = self
                .signed_request(
                    reqwest::Method::GET,
                    "/v5/account/wallet-balance",
                    "accountType=UNIFIED",
                    None,
                    1,
                )
                .await?;
            let mut balances = HashMap::new();
            if let Some(rows) = body.pointer("/result/list/0/coin").and_then(|v| v.as_array()) {
                for row in rows {
                    let Some(asset) = row.get("coin").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let total =
                        parse_decimal_field(row.get("walletBalance")).unwrap_or(Decimal::ZERO);
                    let locked = parse_decimal_field(row.get("locked")).unwrap_or(Decimal::ZERO);
                    if total.is_zero() {
                        continue;
                    }
                    balances.insert(
                        asset.to_string(),
                        Balance {
                            free: total - locked,
                            locked,
                        },
                    );
                }
            }
            Ok(balances)
        })
    }

    fn open_orders(&self) -> BoxFuture<'_, ConnectorResult<Vec<(String, String)>>> {
        Box::pin(async move {
            let mut out = Vec::new();
            for symbol in &self.symbols {
                let query = format!(
                    "category=spot&symbol={}&openOnly=0",
                    to_exchange_symbol(symbol)
                );
                let body = self
                    .signed_request(reqwest::Method::GET, "/v5/order/realtime", &query, None, 1)
                    .await?;
                if let Some(rows) = body.pointer("/result/list").and_then(|v| v.as_array()) {
                    for row in rows {
                        let status =
                            parse_order_status(row.get("orderStatus").and_then(|v| v.as_str()));
                        if status.is_terminal() {
                            continue;
                        }
                        if let Some(id) = row.get("orderLinkId").and_then(|v| v.as_str()) {
                            out.push((id.to_string(), symbol.clone()));
                        }
                    }
                }
            }
            Ok(out)
        })
    }
}

fn to_exchange_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

fn parse_order_status(raw: Option<&str>) -> OrderStatus {
    match raw.unwrap_or("") {
        "New" => OrderStatus::Open,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Failed,
        _ => OrderStatus::Pending,
    }
}

fn parse_decimal_field(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn parse_levels(value: Option<&Value>) -> Option<Vec<BookLevel>> {
    let rows = value?.as_array()?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row.as_array()?;
        let price = parse_decimal_field(pair.first())?;
        let qty = parse_decimal_field(pair.get(1))?;
        levels.push(BookLevel { price, qty });
    }
    Some(levels)
}

fn parse_deltas(value: Option<&Value>, side: BookSide) -> Option<Vec<BookDelta>> {
    let rows = value?.as_array()?;
    let mut deltas = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row.as_array()?;
        let price = parse_decimal_field(pair.first())?;
        let qty = parse_decimal_field(pair.get(1))?;
        deltas.push(BookDelta { side, price, qty });
    }
    Some(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn delta_rows_parse_with_zero_removal() {
        let data: Value = serde_json::json!([["100.5", "1.0"], ["100.4", "0"]]);
        let deltas = parse_deltas(Some(&data), BookSide::Bid).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].qty, Decimal::ZERO);
        assert_eq!(deltas[0].price, dec!(100.5));
    }

    #[test]
    fn order_status_mapping() {
        assert_eq!(parse_order_status(Some("New")), OrderStatus::Open);
        assert_eq!(
            parse_order_status(Some("PartiallyFilledCanceled")),
            OrderStatus::Cancelled
        );
        assert_eq!(parse_order_status(Some("Rejected")), OrderStatus::Failed);
    }
}
