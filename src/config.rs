// src/config.rs
//
// Central configuration for the arbot engine. The `Default` impl is the
// single source of truth for documented defaults; `apply_env_overrides`
// layers ARBOT_* environment variables on top (environment wins), and
// secrets never live here at all -- they come from the environment via
// `ops::SecretProvider` only.

use std::env;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::types::ExecutionMode;

/// Top-level system settings.
#[derive(Debug, Clone, Serialize)]
pub struct SystemConfig {
    pub execution_mode: ExecutionMode,
    pub log_level: String,
    pub timezone: String,
}

/// Spatial detector settings.
#[derive(Debug, Clone, Serialize)]
pub struct SpatialConfig {
    pub enabled: bool,
    /// Minimum net spread percentage to emit a signal.
    pub min_spread_pct: Decimal,
    /// Minimum USD depth required at or better than the target price.
    pub min_depth_usd: Decimal,
    /// Snapshots with higher ingress latency are treated as absent.
    pub max_latency_ms: i64,
    /// Per-(buy, sell) exchange pair cooldown after an emission.
    pub pair_cooldown_ms: i64,
}

/// Triangular detector settings.
#[derive(Debug, Clone, Serialize)]
pub struct TriangularConfig {
    pub enabled: bool,
    /// Minimum net cycle return percentage.
    pub min_profit_pct: Decimal,
    /// Declared 3-leg cycles, e.g. ["BTC/USDT", "ETH/BTC", "ETH/USDT"].
    pub paths: Vec<[String; 3]>,
}

/// Risk gate parameters.
#[derive(Debug, Clone, Serialize)]
pub struct RiskConfig {
    pub max_position_per_coin_usd: Decimal,
    pub max_position_per_exchange_usd: Decimal,
    pub max_total_exposure_usd: Decimal,
    pub max_daily_loss_usd: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub price_deviation_threshold_pct: Decimal,
    pub max_spread_pct: Decimal,
    pub consecutive_loss_limit: u32,
    pub cooldown_minutes: i64,
    pub flash_crash_pct: Decimal,
    pub spread_std_threshold: f64,
    pub stale_threshold_seconds: i64,
    /// Limit fraction (percent) at which a warning event is emitted.
    pub warning_threshold_pct: Decimal,
    /// Economic minimum: the gate rejects rather than shrink below this.
    pub min_notional_usd: Decimal,
}

/// Rate limiter policy for outbound REST calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateLimitKind {
    Weight,
    Count,
    TokenBucket,
}

impl RateLimitKind {
    pub fn parse(s: &str) -> Option<RateLimitKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weight" => Some(RateLimitKind::Weight),
            "count" => Some(RateLimitKind::Count),
            "token_bucket" => Some(RateLimitKind::TokenBucket),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    pub kind: RateLimitKind,
    /// Window budget for Weight/Count policies.
    pub limit: u32,
    pub window_secs: f64,
    /// Token bucket parameters.
    pub capacity: u32,
    pub refill_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebsocketConfig {
    pub orderbook_depth: usize,
    pub reconnect_delay_s: u64,
    pub max_reconnect_attempts: u32,
    /// Expected heartbeat interval; 2x missed triggers a reconnect.
    pub heartbeat_interval_s: u64,
}

/// Per-exchange static configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub tier: u8,
    pub maker_fee_pct: Decimal,
    pub taker_fee_pct: Decimal,
    pub rate_limit: RateLimitConfig,
    pub websocket: WebsocketConfig,
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionConfig {
    /// Shared deadline for both legs of a live submission.
    pub submit_deadline_ms: u64,
    /// Give up on an order with no terminal state after this long.
    pub order_timeout_s: u64,
    /// Paper fill latency model: fixed delay plus jitter.
    pub paper_latency_ms: u64,
    pub paper_latency_jitter_ms: u64,
    /// Seed for the paper latency model; replays are deterministic.
    pub paper_seed: u64,
    /// Starting quote balance per exchange in paper mode.
    pub paper_initial_quote_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub version: &'static str,
    pub system: SystemConfig,
    pub exchanges_enabled: Vec<String>,
    pub symbols: Vec<String>,
    pub spatial: SpatialConfig,
    pub triangular: TriangularConfig,
    pub risk: RiskConfig,
    pub exchanges: Vec<ExchangeConfig>,
    pub execution: ExecutionConfig,
    /// Bounded signal queue capacity (drop-oldest-per-key overflow).
    pub signal_queue_capacity: usize,
    pub metrics_addr: String,
    pub run_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "0.4.0",
            system: SystemConfig {
                execution_mode: ExecutionMode::Paper,
                log_level: "info".to_string(),
                timezone: "UTC".to_string(),
            },
            exchanges_enabled: vec!["binance".to_string(), "bybit".to_string()],
            symbols: vec![
                "BTC/USDT".to_string(),
                "ETH/USDT".to_string(),
                "SOL/USDT".to_string(),
            ],
            spatial: SpatialConfig {
                enabled: true,
                min_spread_pct: dec!(0.25),
                min_depth_usd: dec!(1000),
                max_latency_ms: 500,
                pair_cooldown_ms: 5_000,
            },
            triangular: TriangularConfig {
                enabled: false,
                min_profit_pct: dec!(0.15),
                paths: Vec::new(),
            },
            risk: RiskConfig {
                max_position_per_coin_usd: dec!(10000),
                max_position_per_exchange_usd: dec!(50000),
                max_total_exposure_usd: dec!(100000),
                max_daily_loss_usd: dec!(500),
                max_daily_loss_pct: dec!(1.0),
                max_drawdown_pct: dec!(5.0),
                price_deviation_threshold_pct: dec!(10.0),
                max_spread_pct: dec!(5.0),
                consecutive_loss_limit: 10,
                cooldown_minutes: 30,
                flash_crash_pct: dec!(10.0),
                spread_std_threshold: 3.0,
                stale_threshold_seconds: 30,
                warning_threshold_pct: dec!(70),
                min_notional_usd: dec!(10),
            },
            exchanges: vec![
                ExchangeConfig {
                    name: "binance".to_string(),
                    tier: 1,
                    maker_fee_pct: dec!(0.10),
                    taker_fee_pct: dec!(0.10),
                    rate_limit: RateLimitConfig {
                        kind: RateLimitKind::Weight,
                        limit: 1200,
                        window_secs: 60.0,
                        capacity: 0,
                        refill_rate: 0.0,
                    },
                    websocket: WebsocketConfig {
                        orderbook_depth: 10,
                        reconnect_delay_s: 5,
                        max_reconnect_attempts: 10,
                        heartbeat_interval_s: 30,
                    },
                },
                ExchangeConfig {
                    name: "bybit".to_string(),
                    tier: 1,
                    maker_fee_pct: dec!(0.10),
                    taker_fee_pct: dec!(0.10),
                    rate_limit: RateLimitConfig {
                        kind: RateLimitKind::Count,
                        limit: 600,
                        window_secs: 5.0,
                        capacity: 0,
                        refill_rate: 0.0,
                    },
                    websocket: WebsocketConfig {
                        orderbook_depth: 50,
                        reconnect_delay_s: 5,
                        max_reconnect_attempts: 10,
                        heartbeat_interval_s: 20,
                    },
                },
            ],
            execution: ExecutionConfig {
                submit_deadline_ms: 100,
                order_timeout_s: 30,
                paper_latency_ms: 5,
                paper_latency_jitter_ms: 3,
                paper_seed: 7,
                paper_initial_quote_usd: dec!(10000),
            },
            signal_queue_capacity: 64,
            metrics_addr: "127.0.0.1:9464".to_string(),
            run_dir: "./arbot_run".to_string(),
        }
    }
}

impl Config {
    /// Defaults with ARBOT_* environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn taker_fee_pct(&self, exchange: &str) -> Decimal {
        self.exchange(exchange)
            .map(|e| e.taker_fee_pct)
            .unwrap_or(dec!(0.10))
    }

    /// Layer environment variables over the current values.
    /// Environment always wins.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("ARBOT_EXECUTION_MODE") {
            if let Some(mode) = ExecutionMode::parse(&raw) {
                self.system.execution_mode = mode;
            } else {
                eprintln!("WARN: ARBOT_EXECUTION_MODE unrecognized value={raw}");
            }
        }
        if let Ok(raw) = env::var("ARBOT_LOG_LEVEL") {
            self.system.log_level = raw;
        }
        if let Ok(raw) = env::var("ARBOT_EXCHANGES") {
            let list = parse_csv(&raw);
            if !list.is_empty() {
                self.exchanges_enabled = list;
            }
        }
        if let Ok(raw) = env::var("ARBOT_SYMBOLS") {
            let list = parse_csv(&raw);
            if !list.is_empty() {
                self.symbols = list;
            }
        }
        override_decimal("ARBOT_SPATIAL_MIN_SPREAD_PCT", &mut self.spatial.min_spread_pct);
        override_decimal("ARBOT_SPATIAL_MIN_DEPTH_USD", &mut self.spatial.min_depth_usd);
        override_i64("ARBOT_SPATIAL_MAX_LATENCY_MS", &mut self.spatial.max_latency_ms);
        override_bool("ARBOT_SPATIAL_ENABLED", &mut self.spatial.enabled);
        override_bool("ARBOT_TRIANGULAR_ENABLED", &mut self.triangular.enabled);
        override_decimal(
            "ARBOT_TRIANGULAR_MIN_PROFIT_PCT",
            &mut self.triangular.min_profit_pct,
        );
        if let Ok(raw) = env::var("ARBOT_TRIANGULAR_PATHS") {
            // Semicolon-separated cycles of comma-separated pairs:
            // "BTC/USDT,ETH/BTC,ETH/USDT;..."
            let mut paths = Vec::new();
            for cycle in raw.split(';') {
                let pairs = parse_csv(cycle);
                if let [a, b, c] = pairs.as_slice() {
                    paths.push([a.clone(), b.clone(), c.clone()]);
                } else if !cycle.trim().is_empty() {
                    eprintln!("WARN: ARBOT_TRIANGULAR_PATHS cycle needs 3 pairs, got {cycle}");
                }
            }
            self.triangular.paths = paths;
        }
        override_decimal(
            "ARBOT_RISK_MAX_POSITION_PER_COIN_USD",
            &mut self.risk.max_position_per_coin_usd,
        );
        override_decimal(
            "ARBOT_RISK_MAX_POSITION_PER_EXCHANGE_USD",
            &mut self.risk.max_position_per_exchange_usd,
        );
        override_decimal(
            "ARBOT_RISK_MAX_TOTAL_EXPOSURE_USD",
            &mut self.risk.max_total_exposure_usd,
        );
        override_decimal("ARBOT_RISK_MAX_DAILY_LOSS_USD", &mut self.risk.max_daily_loss_usd);
        override_decimal("ARBOT_RISK_MAX_DAILY_LOSS_PCT", &mut self.risk.max_daily_loss_pct);
        override_decimal("ARBOT_RISK_MAX_DRAWDOWN_PCT", &mut self.risk.max_drawdown_pct);
        override_decimal("ARBOT_RISK_MAX_SPREAD_PCT", &mut self.risk.max_spread_pct);
        override_decimal("ARBOT_RISK_FLASH_CRASH_PCT", &mut self.risk.flash_crash_pct);
        override_u32(
            "ARBOT_RISK_CONSECUTIVE_LOSS_LIMIT",
            &mut self.risk.consecutive_loss_limit,
        );
        override_i64("ARBOT_RISK_COOLDOWN_MINUTES", &mut self.risk.cooldown_minutes);
        override_i64(
            "ARBOT_RISK_STALE_THRESHOLD_SECONDS",
            &mut self.risk.stale_threshold_seconds,
        );
        if let Ok(raw) = env::var("ARBOT_METRICS_ADDR") {
            self.metrics_addr = raw;
        }
        if let Ok(raw) = env::var("ARBOT_RUN_DIR") {
            self.run_dir = raw;
        }
        override_u64(
            "ARBOT_EXECUTION_SUBMIT_DEADLINE_MS",
            &mut self.execution.submit_deadline_ms,
        );
        override_u64("ARBOT_EXECUTION_ORDER_TIMEOUT_S", &mut self.execution.order_timeout_s);
        override_u64("ARBOT_PAPER_SEED", &mut self.execution.paper_seed);
        override_decimal(
            "ARBOT_PAPER_INITIAL_QUOTE_USD",
            &mut self.execution.paper_initial_quote_usd,
        );
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn override_decimal(key: &str, slot: &mut Decimal) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse::<Decimal>() {
            Ok(v) => *slot = v,
            Err(_) => eprintln!("WARN: {key} unparsable value={raw}"),
        }
    }
}

fn override_i64(key: &str, slot: &mut i64) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse::<i64>() {
            Ok(v) => *slot = v,
            Err(_) => eprintln!("WARN: {key} unparsable value={raw}"),
        }
    }
}

fn override_u32(key: &str, slot: &mut u32) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse::<u32>() {
            Ok(v) => *slot = v,
            Err(_) => eprintln!("WARN: {key} unparsable value={raw}"),
        }
    }
}

fn override_u64(key: &str, slot: &mut u64) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse::<u64>() {
            Ok(v) => *slot = v,
            Err(_) => eprintln!("WARN: {key} unparsable value={raw}"),
        }
    }
}

fn override_bool(key: &str, slot: &mut bool) {
    if let Ok(raw) = env::var(key) {
        *slot = raw == "1" || raw.eq_ignore_ascii_case("true");
    }
}

/// Shared handle to the active config. Reload swaps the `Arc` so components
/// observe the change between signals, never mid-signal.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Apply only the non-disruptive keys of `incoming`: fee tables,
    /// detector/risk thresholds, and symbol additions. Mode, exchange set,
    /// and wiring-level settings require a restart and are ignored.
    pub fn reload_non_disruptive(&self, incoming: &Config) {
        let current = self.load();
        let mut next = (*current).clone();
        for exchange in &mut next.exchanges {
            if let Some(inc) = incoming.exchange(&exchange.name) {
                exchange.maker_fee_pct = inc.maker_fee_pct;
                exchange.taker_fee_pct = inc.taker_fee_pct;
            }
        }
        next.spatial = incoming.spatial.clone();
        next.triangular = incoming.triangular.clone();
        next.risk = incoming.risk.clone();
        for symbol in &incoming.symbols {
            if !next.symbols.contains(symbol) {
                next.symbols.push(symbol.clone());
            }
        }
        if let Ok(mut guard) = self.inner.write() {
            *guard = Arc::new(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.spatial.min_spread_pct, dec!(0.25));
        assert_eq!(cfg.spatial.min_depth_usd, dec!(1000));
        assert_eq!(cfg.risk.max_drawdown_pct, dec!(5.0));
        assert_eq!(cfg.risk.consecutive_loss_limit, 10);
        assert_eq!(cfg.risk.stale_threshold_seconds, 30);
        let binance = cfg.exchange("binance").unwrap();
        assert_eq!(binance.rate_limit.kind, RateLimitKind::Weight);
        assert_eq!(binance.rate_limit.limit, 1200);
        assert_eq!(binance.websocket.reconnect_delay_s, 5);
        assert_eq!(binance.websocket.max_reconnect_attempts, 10);
    }

    #[test]
    fn reload_keeps_disruptive_keys() {
        let handle = ConfigHandle::new(Config::default());
        let mut incoming = Config::default();
        incoming.system.execution_mode = ExecutionMode::Live;
        incoming.risk.max_drawdown_pct = dec!(2.5);
        incoming.symbols.push("XRP/USDT".to_string());
        if let Some(e) = incoming.exchanges.iter_mut().find(|e| e.name == "binance") {
            e.taker_fee_pct = dec!(0.075);
        }
        handle.reload_non_disruptive(&incoming);
        let active = handle.load();
        // Mode change requires restart; thresholds and fees swap in place.
        assert_eq!(active.system.execution_mode, ExecutionMode::Paper);
        assert_eq!(active.risk.max_drawdown_pct, dec!(2.5));
        assert_eq!(active.exchange("binance").unwrap().taker_fee_pct, dec!(0.075));
        assert!(active.symbols.iter().any(|s| s == "XRP/USDT"));
    }
}
