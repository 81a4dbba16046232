// src/engine.rs
//
// Stage wiring. Connector feed tasks fan into the market state; the
// detector task turns change events into signals; the risk/execution task
// consumes signals serially (risk gate, then the executor, then outcome
// bookkeeping). Shutdown propagates leaves-to-root: sockets close, open
// orders are cancelled, queues drain, the ledger flushes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alerts::AlertManager;
use crate::config::{Config, ConfigHandle};
use crate::connectors::{
    BinanceConnector, BybitConnector, ConnectorStatus, ExchangeClient, MockConnector,
};
use crate::detector::{SignalQueue, SpatialDetector, TriangularDetector};
use crate::execution::{Executor, LiveExecutor, PaperExecutor, SignalOutcome};
use crate::ledger::{is_quote_stable, Ledger};
use crate::market_state::MarketState;
use crate::metrics::{start_metrics_server, EngineMetrics};
use crate::ops::{
    format_startup_log, write_resolved_config, write_shutdown_marker, EnvSecretProvider,
    HealthState,
};
use crate::records::{DailyPerformance, RecordSink};
use crate::risk::{ClosedTrade, RiskManager};
use crate::types::{split_symbol, wall_clock_ms, ExecutionMode, Signal, SignalStatus};

const EMERGENCY_STOP_BUDGET: Duration = Duration::from_secs(10);
const PORTFOLIO_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

enum ConnectorHandle {
    Binance(Arc<BinanceConnector>),
    Bybit(Arc<BybitConnector>),
    Mock(Arc<MockConnector>),
}

impl ConnectorHandle {
    fn status(&self) -> Arc<ConnectorStatus> {
        match self {
            ConnectorHandle::Binance(c) => c.status.clone(),
            ConnectorHandle::Bybit(c) => c.status.clone(),
            ConnectorHandle::Mock(c) => c.status.clone(),
        }
    }

    fn client(&self) -> Arc<dyn ExchangeClient> {
        match self {
            ConnectorHandle::Binance(c) => c.clone(),
            ConnectorHandle::Bybit(c) => c.clone(),
            ConnectorHandle::Mock(c) => c.clone(),
        }
    }
}

pub struct Engine {
    cfg_handle: ConfigHandle,
    market: Arc<MarketState>,
    metrics: EngineMetrics,
    health: HealthState,
    ledger: Arc<Mutex<Ledger>>,
    signal_queue: Arc<SignalQueue>,
    executor: Arc<dyn Executor>,
    risk: Arc<Mutex<RiskManager>>,
    alerts: Arc<Mutex<AlertManager>>,
    records: Arc<RecordSink>,
    connectors: HashMap<String, ConnectorHandle>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    run_dir: PathBuf,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, String> {
        if cfg.system.execution_mode == ExecutionMode::Backtest {
            return Err(
                "backtest mode needs the historical tick driver; run paper or live".to_string(),
            );
        }
        // Fail fast on malformed triangular paths.
        crate::detector::validate_paths(&cfg.triangular.paths)?;

        let run_dir = PathBuf::from(&cfg.run_dir);
        let market = Arc::new(MarketState::new(1024));
        let metrics = EngineMetrics::new();
        let health = HealthState::new();
        let secrets = EnvSecretProvider;

        let mut ledger = Ledger::new(Some(run_dir.join("ledger.jsonl")));
        if cfg.system.execution_mode == ExecutionMode::Paper {
            ledger.seed_quote_balances(
                &cfg.exchanges_enabled,
                "USDT",
                cfg.execution.paper_initial_quote_usd,
            );
        }
        let ledger = Arc::new(Mutex::new(ledger));

        let mut connectors = HashMap::new();
        for name in &cfg.exchanges_enabled {
            let Some(exchange_cfg) = cfg.exchange(name).cloned() else {
                return Err(format!("exchange {name} enabled but not configured"));
            };
            let handle = match name.as_str() {
                "binance" => ConnectorHandle::Binance(Arc::new(BinanceConnector::new(
                    exchange_cfg,
                    cfg.symbols.clone(),
                    market.clone(),
                    metrics.clone(),
                    &secrets,
                ))),
                "bybit" => ConnectorHandle::Bybit(Arc::new(BybitConnector::new(
                    exchange_cfg,
                    cfg.symbols.clone(),
                    market.clone(),
                    metrics.clone(),
                    &secrets,
                ))),
                other => {
                    eprintln!("INFO: exchange {other} has no native connector; using mock");
                    ConnectorHandle::Mock(MockConnector::new(
                        other,
                        market.clone(),
                        exchange_cfg.taker_fee_pct,
                    ))
                }
            };
            connectors.insert(name.clone(), handle);
        }

        let executor: Arc<dyn Executor> = match cfg.system.execution_mode {
            ExecutionMode::Paper => Arc::new(PaperExecutor::new(
                &cfg,
                market.clone(),
                ledger.clone(),
            )),
            ExecutionMode::Live => {
                let clients: HashMap<String, Arc<dyn ExchangeClient>> = connectors
                    .iter()
                    .map(|(name, handle)| (name.clone(), handle.client()))
                    .collect();
                Arc::new(LiveExecutor::new(&cfg, clients, ledger.clone(), metrics.clone()))
            }
            ExecutionMode::Backtest => unreachable!("rejected above"),
        };

        let now = wall_clock_ms();
        let initial_equity = ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .equity_usd();
        let risk = Arc::new(Mutex::new(RiskManager::new(
            &cfg.risk,
            cfg.system.execution_mode,
            initial_equity,
            now,
        )));

        let signal_queue = Arc::new(SignalQueue::new(cfg.signal_queue_capacity));
        let records = Arc::new(RecordSink::new(&run_dir));
        let alerts = Arc::new(Mutex::new(AlertManager::new(60_000)));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            cfg_handle: ConfigHandle::new(cfg),
            market,
            metrics,
            health,
            ledger,
            signal_queue,
            executor,
            risk,
            alerts,
            records,
            connectors,
            shutdown_tx,
            tasks: Vec::new(),
            run_dir,
        })
    }

    pub fn market(&self) -> Arc<MarketState> {
        self.market.clone()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.clone()
    }

    pub fn ledger(&self) -> Arc<Mutex<Ledger>> {
        self.ledger.clone()
    }

    /// Mock connector handle for scripted feeds (tests, demos).
    pub fn mock_connector(&self, name: &str) -> Option<Arc<MockConnector>> {
        match self.connectors.get(name) {
            Some(ConnectorHandle::Mock(mock)) => Some(mock.clone()),
            _ => None,
        }
    }

    /// Operator control: reset the circuit breaker to Normal.
    pub fn reset_circuit_breaker(&self) {
        self.risk
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .operator_reset_breaker();
        self.metrics.circuit_tripped.set(0);
        eprintln!("INFO: circuit breaker reset by operator");
    }

    /// Operator control: apply the non-disruptive keys of a new config.
    pub fn reload_config(&self, incoming: &Config) {
        self.cfg_handle.reload_non_disruptive(incoming);
        let active = self.cfg_handle.load();
        self.risk
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .update_config(&active.risk);
        eprintln!("INFO: config reloaded (non-disruptive keys)");
    }

    /// Launch all stages. Returns once tasks are spawned.
    pub fn start(&mut self) {
        let cfg = self.cfg_handle.load();
        eprintln!("{}", format_startup_log(&cfg, &cfg.metrics_addr));
        if let Err(err) = write_resolved_config(&self.run_dir, &cfg) {
            eprintln!("WARN: resolved-config dump failed: {err}");
        }
        start_metrics_server(&cfg.metrics_addr, self.metrics.clone(), self.health.clone());

        for handle in self.connectors.values() {
            let shutdown = self.shutdown_tx.subscribe();
            match handle {
                ConnectorHandle::Binance(connector) => {
                    let connector = connector.clone();
                    self.tasks.push(tokio::spawn(connector.run_feeds(shutdown)));
                }
                ConnectorHandle::Bybit(connector) => {
                    let connector = connector.clone();
                    self.tasks.push(tokio::spawn(connector.run_feeds(shutdown)));
                }
                ConnectorHandle::Mock(_) => {}
            }
        }

        self.tasks.push(self.spawn_detector_task());
        self.tasks.push(self.spawn_pipeline_task());
        self.tasks.push(self.spawn_observer_task());
        self.tasks.push(self.spawn_housekeeping_task());
        self.health.set_ready(true);
    }

    /// Detector task: change events -> signals -> bounded queue.
    fn spawn_detector_task(&self) -> JoinHandle<()> {
        let market = self.market.clone();
        let cfg_handle = self.cfg_handle.clone();
        let queue = self.signal_queue.clone();
        let metrics = self.metrics.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut change_rx = self.market.subscribe();
        let signal_ids = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            let cfg = cfg_handle.load();
            let mut spatial = SpatialDetector::new(signal_ids.clone());
            let mut triangular = match TriangularDetector::new(signal_ids, &cfg) {
                Ok(triangular) => triangular,
                Err(err) => {
                    // Paths were validated at construction; this is unreachable
                    // in practice but never worth a panic.
                    eprintln!("ERROR: triangular detector disabled: {err}");
                    return;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = change_rx.recv() => event,
                };
                let mut symbols = HashSet::new();
                let mut exchanges = HashSet::new();
                match event {
                    Ok(event) => {
                        symbols.insert(event.symbol);
                        exchanges.insert(event.exchange);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        metrics.inc_error("detector_lagged");
                        eprintln!("WARN: detector lagged {n} change events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
                // One detection cycle covers everything that changed since
                // the last pass.
                while let Ok(event) = change_rx.try_recv() {
                    symbols.insert(event.symbol);
                    exchanges.insert(event.exchange);
                }
                let cfg = cfg_handle.load();
                let now = wall_clock_ms();
                for symbol in &symbols {
                    if let Some(signal) = spatial.detect(&cfg, &market, symbol, now) {
                        metrics
                            .signals_detected
                            .with_label_values(&[signal.strategy.as_str()])
                            .inc();
                        queue.push(signal);
                    }
                }
                if cfg.triangular.enabled {
                    for exchange in &exchanges {
                        for signal in triangular.detect(&cfg, &market, exchange, now) {
                            metrics
                                .signals_detected
                                .with_label_values(&[signal.strategy.as_str()])
                                .inc();
                            queue.push(signal);
                        }
                    }
                }
            }
        })
    }

    /// Risk + execution task. Signals are consumed in emission order; the
    /// risk gate runs serially and every approved signal goes through the
    /// executor before the next signal is looked at.
    fn spawn_pipeline_task(&self) -> JoinHandle<()> {
        let queue = self.signal_queue.clone();
        let market = self.market.clone();
        let ledger = self.ledger.clone();
        let risk = self.risk.clone();
        let executor = self.executor.clone();
        let metrics = self.metrics.clone();
        let alerts = self.alerts.clone();
        let records = self.records.clone();
        let health = self.health.clone();

        tokio::spawn(async move {
            let mode = executor.mode();
            let mut daily = DailyPerformance::new(mode, wall_clock_ms());
            while let Some(signal) = queue.pop().await {
                let now = wall_clock_ms();
                daily.note_signal();
                if daily.day_rolled(now) {
                    let record = daily.roll(now);
                    records.record_daily(&record);
                }

                let decision = {
                    let portfolio = ledger
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .portfolio_view();
                    let mut risk = risk.lock().unwrap_or_else(|p| p.into_inner());
                    let decision = risk.check_signal(&signal, &portfolio, &market, now);
                    for warning in risk.take_warnings() {
                        let mut alerts = alerts.lock().unwrap_or_else(|p| p.into_inner());
                        alerts.raise(
                            warning.limit,
                            format!(
                                "signal_id={} {} at {}/{} USD",
                                signal.id, warning.limit, warning.used_usd, warning.limit_usd
                            ),
                            now,
                        );
                    }
                    decision
                };

                if !decision.approved {
                    metrics
                        .signals_rejected
                        .with_label_values(&[signal.strategy.as_str(), decision.reason])
                        .inc();
                    eprintln!(
                        "INFO: signal_id={} rejected reason={} detail={}",
                        signal.id,
                        decision.reason,
                        decision.detail.as_deref().unwrap_or("")
                    );
                    records.record_signal(
                        &signal,
                        SignalStatus::Rejected,
                        None,
                        None,
                        Some(decision.reason.to_string()),
                    );
                    continue;
                }

                let notional = decision
                    .adjusted_notional_usd
                    .unwrap_or(signal.notional_usd);
                let outcome = executor.execute(signal.clone(), notional).await;
                Self::settle_outcome(
                    &signal, &outcome, mode, &ledger, &risk, &metrics, &alerts, &records,
                    &mut daily,
                );

                if let Some(fatal) = &outcome.fatal_error {
                    metrics.inc_error("fatal");
                    eprintln!("ERROR: signal_id={} fatal execution error: {fatal}", signal.id);
                    if mode == ExecutionMode::Live {
                        health.set_healthy(false);
                        // The run loop owning this engine watches health and
                        // invokes the emergency stop.
                    }
                }
            }
            // Shutdown drain: whatever is left never reached risk.
            while let Some(signal) = queue.try_pop() {
                records.record_signal(&signal, SignalStatus::Detected, None, None, None);
            }
            let record = daily.summary();
            records.record_daily(&record);
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_outcome(
        signal: &Signal,
        outcome: &SignalOutcome,
        mode: ExecutionMode,
        ledger: &Arc<Mutex<Ledger>>,
        risk: &Arc<Mutex<RiskManager>>,
        metrics: &EngineMetrics,
        alerts: &Arc<Mutex<AlertManager>>,
        records: &Arc<RecordSink>,
        daily: &mut DailyPerformance,
    ) {
        let now = wall_clock_ms();
        let equity = {
            let ledger = ledger.lock().unwrap_or_else(|p| p.into_inner());
            metrics
                .realized_pnl_usd
                .set(ledger.cumulative_realized_usd().to_f64().unwrap_or(0.0));
            metrics
                .daily_pnl_usd
                .set(ledger.daily_realized_usd().to_f64().unwrap_or(0.0));
            ledger.equity_usd()
        };

        let tripped = {
            let mut risk = risk.lock().unwrap_or_else(|p| p.into_inner());
            let tripped = risk.record_outcome(
                ClosedTrade {
                    pnl_usd: outcome.realized_pnl_usd,
                    counts_as_loss: outcome.counts_as_loss,
                    submitted_ts: outcome.submitted_ts,
                },
                equity,
                now,
            );
            metrics
                .drawdown_pct
                .set(risk.drawdown.current_drawdown_pct().to_f64().unwrap_or(0.0));
            metrics
                .consecutive_losses
                .set(risk.breaker.consecutive_losses() as i64);
            tripped
        };
        if tripped {
            metrics.circuit_tripped.set(1);
            let mut alerts = alerts.lock().unwrap_or_else(|p| p.into_inner());
            alerts.raise(
                "circuit_breaker",
                format!("tripped after signal_id={}", signal.id),
                now,
            );
        }

        match outcome.status {
            SignalStatus::Executed => {
                metrics
                    .signals_executed
                    .with_label_values(&[signal.strategy.as_str()])
                    .inc();
            }
            SignalStatus::Missed => {
                metrics.inc_error("missed");
            }
            _ => {}
        }
        eprintln!(
            "INFO: signal_id={} outcome={} pnl_usd={} legs={} loss={}",
            signal.id,
            outcome.status.as_str(),
            outcome.realized_pnl_usd,
            outcome.legs.len(),
            outcome.counts_as_loss,
        );

        daily.note_outcome(outcome);
        daily.note_equity(equity);
        records.record_signal(
            signal,
            outcome.status,
            Some(outcome.realized_pnl_usd),
            Some(outcome.completed_ts),
            None,
        );
        records.record_trades(mode, &outcome.legs);
    }

    /// Observer task: keeps anomaly history and USD marks current.
    fn spawn_observer_task(&self) -> JoinHandle<()> {
        let market = self.market.clone();
        let risk = self.risk.clone();
        let ledger = self.ledger.clone();
        let mut change_rx = self.market.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = change_rx.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some((book, _)) = market.snapshot(&event.exchange, &event.symbol) else {
                    continue;
                };
                let Some(top) = book.top_of_book() else {
                    continue;
                };
                {
                    let mut risk = risk.lock().unwrap_or_else(|p| p.into_inner());
                    risk.anomaly.observe_top(&top);
                }
                if let Some((base, quote)) = split_symbol(&event.symbol) {
                    if is_quote_stable(quote) {
                        let mut ledger = ledger.lock().unwrap_or_else(|p| p.into_inner());
                        ledger.set_mark(base, top.mid());
                    }
                }
            }
        })
    }

    /// Periodic gauge refresh and portfolio snapshots.
    fn spawn_housekeeping_task(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let statuses: Vec<Arc<ConnectorStatus>> =
            self.connectors.values().map(|h| h.status()).collect();
        let ledger = self.ledger.clone();
        let records = self.records.clone();
        let queue = self.signal_queue.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut reconnects_seen: HashMap<String, u64> = HashMap::new();
            let mut dropped_seen: u64 = 0;
            let mut gauge_tick = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
            let mut snapshot_tick = tokio::time::interval(PORTFOLIO_SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = gauge_tick.tick() => {
                        for status in &statuses {
                            let connected = i64::from(status.is_connected());
                            metrics
                                .connection_state
                                .with_label_values(&[status.name()])
                                .set(connected);
                            let total = status.reconnect_count();
                            let seen = reconnects_seen
                                .entry(status.name().to_string())
                                .or_insert(0);
                            if total > *seen {
                                metrics
                                    .reconnects
                                    .with_label_values(&[status.name()])
                                    .inc_by(total - *seen);
                                *seen = total;
                            }
                        }
                        let dropped = queue.dropped_count();
                        if dropped > dropped_seen {
                            metrics.signals_dropped.inc_by(dropped - dropped_seen);
                            dropped_seen = dropped;
                        }
                    }
                    _ = snapshot_tick.tick() => {
                        let rows = ledger
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .snapshot_rows();
                        records.record_portfolio(wall_clock_ms(), &rows);
                    }
                }
            }
        })
    }

    /// Graceful stop: close sockets, stop accepting signals, drain, cancel
    /// whatever is still open, flush, and write the shutdown marker.
    pub async fn stop(&mut self, reason: &str) {
        eprintln!("INFO: engine stopping reason={reason}");
        self.health.set_ready(false);
        let _ = self.shutdown_tx.send(true);
        self.signal_queue.close();
        let cancelled = self.executor.cancel_open_orders().await;
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                eprintln!("WARN: a stage task did not stop within 5s; aborting it");
                abort.abort();
            }
        }
        let rows = self
            .ledger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .snapshot_rows();
        self.records.record_portfolio(wall_clock_ms(), &rows);
        if let Err(err) = write_shutdown_marker(&self.run_dir, wall_clock_ms(), reason, cancelled, 0)
        {
            eprintln!("WARN: shutdown marker write failed: {err}");
        }
    }

    /// Emergency stop: fence new signals, cancel all open orders within the
    /// 10-second budget, and persist the marker. Cancellations that did not
    /// complete inside the budget are logged as failed.
    pub async fn emergency_stop(&mut self) {
        eprintln!("ERROR: emergency stop invoked");
        self.health.set_healthy(false);
        self.signal_queue.close();
        let _ = self.shutdown_tx.send(true);
        let (cancelled, failed) = match tokio::time::timeout(
            EMERGENCY_STOP_BUDGET,
            self.executor.cancel_open_orders(),
        )
        .await
        {
            Ok(cancelled) => (cancelled, 0),
            Err(_) => {
                eprintln!(
                    "ERROR: emergency stop exceeded {EMERGENCY_STOP_BUDGET:?}; some cancellations did not complete"
                );
                (0, 1)
            }
        };
        if let Err(err) = write_shutdown_marker(
            &self.run_dir,
            wall_clock_ms(),
            "emergency_stop",
            cancelled,
            failed,
        ) {
            eprintln!("WARN: shutdown marker write failed: {err}");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }
}

/// Convenience for the binary: build, start, and run until ctrl-c or a
/// fatal health flip.
pub async fn run_until_shutdown(cfg: Config, max_runtime: Option<Duration>) -> Result<(), String> {
    let mut engine = Engine::new(cfg)?;
    engine.start();
    let health = engine.health();
    let deadline = max_runtime.map(|d| tokio::time::Instant::now() + d);
    loop {
        let poll = tokio::time::sleep(Duration::from_millis(200));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.stop("operator_signal").await;
                return Ok(());
            }
            _ = poll => {
                if !health.is_healthy() {
                    engine.emergency_stop().await;
                    return Err("emergency stop triggered".to_string());
                }
                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        engine.stop("max_runtime").await;
                        return Ok(());
                    }
                }
            }
        }
    }
}
