// src/connectors/mod.rs
//
// Connector contract and shared plumbing: the error taxonomy, the
// connection state machine, the REST retry ladder, and the supervised
// feed-loop runner with exponential backoff, jitter, and the Degraded
// terminal state after too many consecutive failures.

pub mod binance;
pub mod bybit;
pub mod mock;

pub use binance::BinanceConnector;
pub use bybit::BybitConnector;
pub use mock::MockConnector;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::config::WebsocketConfig;
use crate::types::{Balance, Fill, OrderRequest, OrderStatus, TimestampMs};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error taxonomy for connector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorErrorKind {
    /// Socket close, read timeout, HTTP 5xx: retry locally.
    Transient,
    /// HTTP 429/418: queue and back off.
    RateLimited,
    /// 401/403, signature mismatch, unknown symbol: fatal to the operation.
    Auth,
    /// Malformed payload, sequence gap: resync or drop.
    Protocol,
    /// Exchange rejected the order (balance, tolerance, halted symbol).
    Business,
    /// Deadline fired before the call completed.
    Timeout,
}

impl ConnectorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorErrorKind::Transient => "transient",
            ConnectorErrorKind::RateLimited => "rate_limited",
            ConnectorErrorKind::Auth => "auth",
            ConnectorErrorKind::Protocol => "protocol",
            ConnectorErrorKind::Business => "business",
            ConnectorErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
}

impl ConnectorError {
    pub fn new(kind: ConnectorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::RateLimited, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Auth, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Protocol, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Business, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Timeout, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ConnectorErrorKind::Transient
                | ConnectorErrorKind::RateLimited
                | ConnectorErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ConnectorError {}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Connector session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Subscribed = 2,
    Streaming = 3,
    Reconnecting = 4,
    Closing = 5,
    /// Too many consecutive failures; symbols will go stale.
    Degraded = 6,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Subscribed => "subscribed",
            ConnState::Streaming => "streaming",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Closing => "closing",
            ConnState::Degraded => "degraded",
        }
    }

    fn from_u8(v: u8) -> ConnState {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Subscribed,
            3 => ConnState::Streaming,
            4 => ConnState::Reconnecting,
            5 => ConnState::Closing,
            6 => ConnState::Degraded,
            _ => ConnState::Disconnected,
        }
    }
}

/// Shared per-connector status: state machine position and reconnect count.
#[derive(Debug)]
pub struct ConnectorStatus {
    name: String,
    state: AtomicU8,
    reconnects: AtomicU64,
}

impl ConnectorStatus {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, state: ConnState) {
        let old = self.state.swap(state as u8, Ordering::Release);
        if old != state as u8 {
            eprintln!(
                "INFO: connector={} state {} -> {}",
                self.name,
                ConnState::from_u8(old).as_str(),
                state.as_str()
            );
        }
        if state == ConnState::Reconnecting {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnState::Streaming
    }
}

/// Acknowledgement of an order submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
}

/// Point-in-time order state from polling or a user stream.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_order_id: Option<String>,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub fills: Vec<Fill>,
    pub ts: TimestampMs,
}

/// REST side of the connector contract. Feed loops are spawned separately
/// by each concrete connector (`run_feeds`).
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    fn place_order(&self, req: OrderRequest) -> BoxFuture<'_, ConnectorResult<OrderAck>>;

    fn cancel_order(
        &self,
        client_order_id: &str,
        symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<bool>>;

    fn fetch_order(
        &self,
        client_order_id: &str,
        symbol: &str,
    ) -> BoxFuture<'_, ConnectorResult<OrderUpdate>>;

    fn get_balances(&self) -> BoxFuture<'_, ConnectorResult<HashMap<String, Balance>>>;

    /// Client order ids of all open orders, for emergency cancellation.
    fn open_orders(&self) -> BoxFuture<'_, ConnectorResult<Vec<(String, String)>>>;
}

/// Capability row for one registered connector implementation.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorSpec {
    pub name: &'static str,
    pub supports_market_data: bool,
    pub supports_trades: bool,
    pub supports_execution: bool,
    pub supports_balances: bool,
    pub notes: &'static str,
}

pub const CONNECTOR_SPECS: [ConnectorSpec; 3] = [
    ConnectorSpec {
        name: "binance",
        supports_market_data: true,
        supports_trades: true,
        supports_execution: true,
        supports_balances: true,
        notes: "Partial-depth snapshots; weight-limited REST.",
    },
    ConnectorSpec {
        name: "bybit",
        supports_market_data: true,
        supports_trades: true,
        supports_execution: true,
        supports_balances: true,
        notes: "Snapshot+delta book with sequence numbers.",
    },
    ConnectorSpec {
        name: "mock",
        supports_market_data: true,
        supports_trades: true,
        supports_execution: true,
        supports_balances: true,
        notes: "Scripted in-process feed for tests and demos.",
    },
];

pub fn connector_spec(name: &str) -> Option<&'static ConnectorSpec> {
    CONNECTOR_SPECS.iter().find(|s| s.name == name)
}

/// Run one REST call with the standard retry ladder: rate-limit and
/// transient errors retry up to 3 times with exponential delay; auth,
/// protocol, and business errors surface immediately.
pub async fn call_with_retries<T, F, Fut>(label: &str, mut call: F) -> ConnectorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ConnectorResult<T>>,
{
    const MAX_RETRIES: u32 = 3;
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                eprintln!(
                    "WARN: {label} failed ({err}); retry {attempt}/{MAX_RETRIES} in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Drive a feed session loop under supervision. `session` runs one
/// connect-subscribe-stream pass and returns `Ok(())` only on a requested
/// shutdown. Failures reconnect with exponential backoff and jitter; after
/// `max_reconnect_attempts` consecutive failures the connector goes
/// Degraded and the loop ends, letting staleness retire its symbols.
pub async fn run_supervised_feed<F, Fut>(
    status: Arc<ConnectorStatus>,
    ws_cfg: WebsocketConfig,
    mut session: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    use rand::Rng;

    const HEALTHY_SESSION: Duration = Duration::from_secs(60);
    let base = Duration::from_secs(ws_cfg.reconnect_delay_s.max(1));
    let max_backoff = Duration::from_secs(60);
    let mut backoff = base;
    let mut consecutive_failures: u32 = 0;

    loop {
        let started = tokio::time::Instant::now();
        match session().await {
            Ok(()) => {
                status.set(ConnState::Closing);
                return;
            }
            Err(err) => {
                eprintln!(
                    "WARN: connector={} feed session error (consecutive_failures={}): {err}",
                    status.name(),
                    consecutive_failures + 1
                );
            }
        }
        if started.elapsed() >= HEALTHY_SESSION {
            consecutive_failures = 0;
            backoff = base;
        }
        consecutive_failures += 1;
        if consecutive_failures >= ws_cfg.max_reconnect_attempts {
            status.set(ConnState::Degraded);
            eprintln!(
                "ERROR: connector={} degraded after {consecutive_failures} consecutive failures",
                status.name(),
            );
            return;
        }
        status.set(ConnState::Reconnecting);
        let jitter = Duration::from_millis(
            rand::thread_rng().gen_range(0..=(backoff.as_millis().max(4) as u64) / 4),
        );
        tokio::time::sleep(backoff + jitter).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}
