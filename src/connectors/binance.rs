// src/connectors/binance.rs
//
// Binance connector: combined-stream websocket for partial-depth snapshots
// and trade prints, plus HMAC-SHA256-signed REST for orders and balances.
// Partial depth frames carry lastUpdateId as the sequence; a regression
// invalidates the local book and the next snapshot resyncs it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::ExchangeConfig;
use crate::market_state::MarketState;
use crate::metrics::EngineMetrics;
use crate::ops::SecretProvider;
use crate::orderbook::{BookLevel, OrderBook};
use crate::rate_limit::RateLimiter;
use crate::types::{
    wall_clock_ms, Balance, Fill, OrderRequest, OrderStatus, OrderType, Side, TimestampMs,
    TradePrint,
};

use super::{
    run_supervised_feed, BoxFuture, ConnState, ConnectorError, ConnectorResult, ConnectorStatus,
    ExchangeClient, OrderAck, OrderUpdate,
};

const WS_URL_DEFAULT: &str = "wss://stream.binance.com:9443/stream";
const REST_URL_DEFAULT: &str = "https://api.binance.com";
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceConnector {
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

impl BinanceConnector {
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
                .get("ARBOT_BINANCE_WS_URL")
                .unwrap_or_else(|| WS_URL_DEFAULT.to_string()),
            rest_url: secrets
                .get("ARBOT_BINANCE_REST_URL")
                .unwrap_or_else(|| REST_URL_DEFAULT.to_string()),
            api_key: secrets.get("ARBOT_BINANCE_API_KEY"),
            api_secret: secrets.get("ARBOT_BINANCE_API_SECRET"),
            status: ConnectorStatus::new(&cfg.name),
            market,
            limiter,
            metrics,
            http: reqwest::Client::new(),
            cfg,
        }
    }

    /// Run the market-data feed until shutdown. Supervised: reconnects with
    /// backoff and goes Degraded after too many consecutive failures.
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

    async fn feed_session(&self) -> anyhow::Result<()> {
        self.status.set(ConnState::Connecting);
        let streams: Vec<String> = self
            .symbols
            .iter()
            .flat_map(|symbol| {
                let raw = to_exchange_symbol(symbol).to_lowercase();
                let depth = self.cfg.websocket.orderbook_depth.clamp(5, 20);
                [
                    format!("{raw}@depth{depth}@100ms"),
                    format!("{raw}@trade"),
                ]
            })
            .collect();
        let url = format!("{}?streams={}", self.ws_url, streams.join("/"));
        let (ws, _) = tokio::time::timeout(WS_CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("binance ws connect timed out"))??;
        // Combined streams start flowing without an explicit subscribe ack.
        self.status.set(ConnState::Subscribed);
        let (mut write, mut read) = ws.split();

        let symbol_map: HashMap<String, String> = self
            .symbols
            .iter()
            .map(|s| (to_exchange_symbol(s), s.clone()))
            .collect();
        let mut books: HashMap<String, OrderBook> = HashMap::new();
        let read_timeout =
            Duration::from_secs(self.cfg.websocket.heartbeat_interval_s.max(1) * 2);
        let mut first_message = true;

        loop {
            let frame = match tokio::time::timeout(read_timeout, read.next()).await {
                Ok(Some(frame)) => frame?,
                Ok(None) => anyhow::bail!("binance ws closed by server"),
                // Missed heartbeat: over 2x the expected interval with no
                // frame at all.
                Err(_) => anyhow::bail!("binance ws heartbeat missed ({read_timeout:?})"),
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
                Message::Close(_) => anyhow::bail!("binance ws server close"),
                _ => continue,
            };
            if first_message {
                self.status.set(ConnState::Streaming);
                first_message = false;
            }
            let value: Value = match serde_json::from_str(&payload) {
                Ok(value) => value,
                Err(err) => {
                    self.metrics.inc_error("protocol");
                    let snippet: String = payload.chars().take(120).collect();
                    eprintln!("WARN: binance ws parse error: {err} snippet={snippet}");
                    continue;
                }
            };
            let Some(stream) = value.get("stream").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(data) = value.get("data") else {
                continue;
            };
            let ingress_ts = wall_clock_ms();
            if stream.contains("@depth") {
                self.handle_depth(stream, data, &symbol_map, &mut books, ingress_ts);
            } else if stream.ends_with("@trade") {
                self.handle_trade(data, &symbol_map, ingress_ts);
            }
        }
    }

    fn handle_depth(
        &self,
        stream: &str,
        data: &Value,
        symbol_map: &HashMap<String, String>,
        books: &mut HashMap<String, OrderBook>,
        ingress_ts: TimestampMs,
    ) {
        let raw_symbol = stream.split('@').next().unwrap_or("").to_uppercase();
        let Some(symbol) = symbol_map.get(&raw_symbol) else {
            return;
        };
        let seq = data.get("lastUpdateId").and_then(|v| v.as_u64()).unwrap_or(0);
        let Some(bids) = parse_levels(data.get("bids")) else {
            self.metrics.inc_error("protocol");
            return;
        };
        let Some(asks) = parse_levels(data.get("asks")) else {
            self.metrics.inc_error("protocol");
            return;
        };
        // Partial-depth frames have no exchange event time.
        let event_ts = ingress_ts;
        let book = books
            .entry(symbol.clone())
            .or_insert_with(|| OrderBook::new(self.cfg.name.clone(), symbol.clone()));
        match book.apply_snapshot(&bids, &asks, seq, event_ts, ingress_ts) {
            Ok(()) => {
                self.market.publish_book(Arc::new(book.clone()));
            }
            Err(err) => {
                // Sequence regression after a stream restart: drop local
                // state and let the next snapshot rebuild it.
                self.metrics.inc_error("protocol");
                eprintln!(
                    "WARN: binance depth rejected symbol={symbol} err={err}; resyncing"
                );
                book.invalidate();
            }
        }
    }

    fn handle_trade(
        &self,
        data: &Value,
        symbol_map: &HashMap<String, String>,
        ingress_ts: TimestampMs,
    ) {
        let raw_symbol = data.get("s").and_then(|v| v.as_str()).unwrap_or("");
        let Some(symbol) = symbol_map.get(raw_symbol) else {
            return;
        };
        let (Some(price), Some(qty)) = (
            parse_decimal_field(data.get("p")),
            parse_decimal_field(data.get("q")),
        ) else {
            self.metrics.inc_error("protocol");
            return;
        };
        let event_ts = data
            .get("T")
            .and_then(|v| v.as_i64())
            .unwrap_or(ingress_ts);
        self.metrics
            .feed_latency_ms
            .observe(ingress_ts.saturating_sub(event_ts).max(0) as f64);
        // m=true means the buyer was the maker, so the aggressor sold.
        let side = if data.get("m").and_then(|v| v.as_bool()).unwrap_or(false) {
            Side::Sell
        } else {
            Side::Buy
        };
        self.market.publish_trade(TradePrint {
            exchange: self.cfg.name.clone(),
            symbol: symbol.clone(),
            side,
            price,
            qty,
            event_ts,
            ingress_ts,
        });
    }

    fn credentials(&self) -> ConnectorResult<(&str, &str)> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => Err(ConnectorError::auth(
                "binance credentials missing (ARBOT_BINANCE_API_KEY/SECRET)",
            )),
        }
    }

    fn sign(&self, query: &str) -> ConnectorResult<String> {
        let (_, secret) = self.credentials()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ConnectorError::auth("binance secret unusable for HMAC"))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
        weight: u32,
    ) -> ConnectorResult<Value> {
        let (key, _) = self.credentials()?;
        let waited = self.limiter.acquire(weight).await;
        if !waited.is_zero() {
            self.metrics
                .rate_limit_wait_ms
                .with_label_values(&[&self.cfg.name])
                .inc_by(waited.as_millis() as u64);
        }
        params.push(("timestamp".to_string(), wall_clock_ms().to_string()));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        let url = format!("{}{path}?{query}&signature={signature}", self.rest_url);
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ConnectorError::timeout(format!("binance {path}: {err}"))
                } else {
                    ConnectorError::transient(format!("binance {path}: {err}"))
                }
            })?;
        classify_response(path, response).await
    }
}

async fn classify_response(path: &str, response: reqwest::Response) -> ConnectorResult<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }
    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    let msg = body
        .get("msg")
        .and_then(|v| v.as_str())
        .unwrap_or("no message");
    let detail = format!("binance {path} http={status} code={code} msg={msg}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(ConnectorError::rate_limited(detail)),
        StatusCode::IM_A_TEAPOT => Err(ConnectorError::rate_limited(detail)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ConnectorError::auth(detail)),
        status if status.is_server_error() => Err(ConnectorError::transient(detail)),
        _ => {
            // -1022 signature and -2014/-2015 key errors are auth-fatal;
            // the remaining 4xx rejections are business outcomes.
            if matches!(code, -1022 | -2014 | -2015) {
                Err(ConnectorError::auth(detail))
            } else {
                Err(ConnectorError::business(detail))
            }
        }
    }
}

impl ExchangeClient for BinanceConnector {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn place_order(&self, req: OrderRequest) -> BoxFuture<'_, ConnectorResult<OrderAck>> {
        Box::pin(async move {
            let mut params = vec![
                ("symbol".to_string(), to_exchange_symbol(&req.symbol)),
                ("side".to_string(), req.side.as_str().to_string()),
                ("newClientOrderId".to_string(), req.client_order_id.clone()),
                ("quantity".to_string(), req.qty.normalize().to_string()),
            ];
            match req.order_type {
                OrderType::Market => {
                    params.push(("type".to_string(), "MARKET".to_string()));
                }
                OrderType::Limit | OrderType::Ioc => {
                    let price = req.price.ok_or_else(|| {
                        ConnectorError::business("limit order without a price")
                    })?;
                    params.push(("type".to_string(), "LIMIT".to_string()));
                    params.push((
                        "timeInForce".to_string(),
                        if req.order_type == OrderType::Ioc { "IOC" } else { "GTC" }.to_string(),
                    ));
                    params.push(("price".to_string(), price.normalize().to_string()));
                }
            }
            let body = self
                .signed_request(reqwest::Method::POST, "/api/v3/order", params, 1)
                .await?;
            Ok(OrderAck {
                exchange_order_id: body
                    .get("orderId")
                    .and_then(|v| v.as_i64())
                    .map(|id| id.to_string()),
                status: parse_order_status(body.get("status").and_then(|v| v.as_str())),
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
            let params = vec![
                ("symbol".to_string(), to_exchange_symbol(&symbol)),
                ("origClientOrderId".to_string(), client_order_id),
            ];
            match self
                .signed_request(reqwest::Method::DELETE, "/api/v3/order", params, 1)
                .await
            {
                Ok(_) => Ok(true),
                // Already terminal on the exchange counts as not-cancelled.
                Err(err) if err.kind == super::ConnectorErrorKind::Business => Ok(false),
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
            let params = vec![
                ("symbol".to_string(), to_exchange_symbol(&symbol)),
                ("origClientOrderId".to_string(), client_order_id.clone()),
            ];
            let body = self
                .signed_request(reqwest::Method::GET, "/api/v3/order", params, 4)
                .await?;
            let exchange_order_id = body.get("orderId").and_then(|v| v.as_i64());
            let status = parse_order_status(body.get("status").and_then(|v| v.as_str()));
            let filled_qty =
                parse_decimal_field(body.get("executedQty")).unwrap_or(Decimal::ZERO);

            let mut fills = Vec::new();
            if let Some(order_id) = exchange_order_id {
                if filled_qty > Decimal::ZERO {
                    let trade_params = vec![
                        ("symbol".to_string(), to_exchange_symbol(&symbol)),
                        ("orderId".to_string(), order_id.to_string()),
                    ];
                    let trades = self
                        .signed_request(reqwest::Method::GET, "/api/v3/myTrades", trade_params, 10)
                        .await?;
                    if let Some(rows) = trades.as_array() {
                        for row in rows {
                            let (Some(price), Some(qty)) = (
                                parse_decimal_field(row.get("price")),
                                parse_decimal_field(row.get("qty")),
                            ) else {
                                continue;
                            };
                            fills.push(Fill {
                                order_id: client_order_id.clone(),
                                exchange_fill_id: row
                                    .get("id")
                                    .and_then(|v| v.as_i64())
                                    .map(|id| format!("binance-{raw}-{id}", raw = to_exchange_symbol(&symbol))),
                                qty,
                                price,
                                fee: parse_decimal_field(row.get("commission"))
                                    .unwrap_or(Decimal::ZERO),
                                fee_asset: row
                                    .get("commissionAsset")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                ts: row.get("time").and_then(|v| v.as_i64()).unwrap_or(0),
                            });
                        }
                    }
                }
            }

            Ok(OrderUpdate {
                exchange_order_id: exchange_order_id.map(|id| id.to_string()),
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
                .signed_request(reqwest::Method::GET, "/api/v3/account", Vec::new(), 10)
                .await?;
            let mut balances = HashMap::new();
            if let Some(rows) = body.get("balances").and_then(|v| v.as_array()) {
                for row in rows {
                    let Some(asset) = row.get("asset").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let free = parse_decimal_field(row.get("free")).unwrap_or(Decimal::ZERO);
                    let locked = parse_decimal_field(row.get("locked")).unwrap_or(Decimal::ZERO);
                    if free.is_zero() && locked.is_zero() {
                        continue;
                    }
                    balances.insert(asset.to_string(), Balance { free, locked });
                }
            }
            Ok(balances)
        })
    }

    fn open_orders(&self) -> BoxFuture<'_, ConnectorResult<Vec<(String, String)>>> {
        Box::pin(async move {
            let body = self
                .signed_request(reqwest::Method::GET, "/api/v3/openOrders", Vec::new(), 40)
                .await?;
            let mut out = Vec::new();
            if let Some(rows) = body.as_array() {
                for row in rows {
                    let (Some(id), Some(raw_symbol)) = (
                        row.get("clientOrderId").and_then(|v| v.as_str()),
                        row.get("symbol").and_then(|v| v.as_str()),
                    ) else {
                        continue;
                    };
                    out.push((id.to_string(), from_exchange_symbol(raw_symbol)));
                }
            }
            Ok(out)
        })
    }
}

/// "BTC/USDT" -> "BTCUSDT".
pub fn to_exchange_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// "BTCUSDT" -> "BTC/USDT", splitting on known quote assets.
pub fn from_exchange_symbol(raw: &str) -> String {
    const QUOTES: [&str; 6] = ["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];
    let upper = raw.to_uppercase();
    for quote in QUOTES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    upper
}

fn parse_order_status(raw: Option<&str>) -> OrderStatus {
    match raw.unwrap_or("") {
        "NEW" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Failed,
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_round_trip() {
        assert_eq!(to_exchange_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(from_exchange_symbol("BTCUSDT"), "BTC/USDT");
        assert_eq!(from_exchange_symbol("ETHBTC"), "ETH/BTC");
    }

    #[test]
    fn depth_levels_parse_string_pairs() {
        let data: Value = serde_json::json!([["100.50", "1.2"], ["100.40", "0.5"]]);
        let levels = parse_levels(Some(&data)).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, dec!(100.50));
        assert_eq!(levels[1].qty, dec!(0.5));
        assert!(parse_levels(Some(&serde_json::json!([["bad"]]))).is_none());
    }

    #[test]
    fn order_status_mapping() {
        assert_eq!(parse_order_status(Some("NEW")), OrderStatus::Open);
        assert_eq!(parse_order_status(Some("FILLED")), OrderStatus::Filled);
        assert_eq!(parse_order_status(Some("EXPIRED")), OrderStatus::Cancelled);
        assert_eq!(parse_order_status(Some("REJECTED")), OrderStatus::Failed);
    }
}
