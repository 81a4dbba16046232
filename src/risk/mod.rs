// src/risk/mod.rs
//
// The risk gate. Every signal passes four stages serially, short-circuiting
// on the first rejection: position limits, drawdown, anomaly, circuit
// breaker. Approved signals may carry a reduced notional. The gate is the
// single consumer of closed-trade results and can never be bypassed: the
// engine only hands the executor signals that came out of `check_signal`.

pub mod anomaly;
pub mod circuit_breaker;
pub mod drawdown;

pub use anomaly::{AnomalyConfig, AnomalyDetector};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use drawdown::DrawdownMonitor;

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::market_state::MarketState;
use crate::types::{ExecutionMode, RiskDecision, Signal, TimestampMs};

/// Read-only portfolio view the gate checks limits against; produced by
/// the ledger as a consistent per-call snapshot.
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    /// Absolute USD position value per base asset.
    pub position_usd_by_asset: HashMap<String, Decimal>,
    /// Absolute USD exposure per exchange.
    pub exposure_usd_by_exchange: HashMap<String, Decimal>,
    pub total_exposure_usd: Decimal,
    pub equity_usd: Decimal,
}

/// Warning emitted when a limit crosses its warning fraction but the
/// signal still proceeds.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitWarning {
    pub limit: &'static str,
    pub used_usd: Decimal,
    pub limit_usd: Decimal,
}

/// Result of one closed signal, as seen by risk.
#[derive(Debug, Clone, Copy)]
pub struct ClosedTrade {
    pub pnl_usd: Decimal,
    pub counts_as_loss: bool,
    pub submitted_ts: TimestampMs,
}

pub struct RiskManager {
    cfg: RiskConfig,
    mode: ExecutionMode,
    pub drawdown: DrawdownMonitor,
    pub anomaly: AnomalyDetector,
    pub breaker: CircuitBreaker,
    warnings: Vec<LimitWarning>,
}

impl RiskManager {
    pub fn new(
        cfg: &RiskConfig,
        mode: ExecutionMode,
        initial_equity: Decimal,
        now_ms: TimestampMs,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            mode,
            drawdown: DrawdownMonitor::new(
                cfg.max_drawdown_pct,
                cfg.max_daily_loss_usd,
                cfg.max_daily_loss_pct,
                initial_equity,
                now_ms,
            ),
            anomaly: AnomalyDetector::new(AnomalyConfig {
                price_deviation_threshold_pct: cfg.price_deviation_threshold_pct,
                max_spread_pct: cfg.max_spread_pct,
                spread_std_threshold: cfg.spread_std_threshold,
                flash_crash_pct: cfg.flash_crash_pct,
                flash_lookback_ms: 60_000,
            }),
            breaker: CircuitBreaker::new(cfg.consecutive_loss_limit, cfg.cooldown_minutes),
            warnings: Vec::new(),
        }
    }

    /// Replace thresholds after a config reload. Rolling state survives.
    pub fn update_config(&mut self, cfg: &RiskConfig) {
        self.cfg = cfg.clone();
    }

    /// Drain limit warnings produced since the last call.
    pub fn take_warnings(&mut self) -> Vec<LimitWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Gate one signal. Stages run serially and the first rejection wins.
    pub fn check_signal(
        &mut self,
        signal: &Signal,
        portfolio: &PortfolioView,
        state: &MarketState,
        now_ms: TimestampMs,
    ) -> RiskDecision {
        let adjusted = match self.check_position_limits(signal, portfolio) {
            Ok(adjusted) => adjusted,
            Err(decision) => return decision,
        };

        if let Err((reason, detail)) = self.drawdown.check(now_ms) {
            return RiskDecision::reject(reason, detail);
        }

        if let Err((reason, detail)) = self.anomaly.check_signal(signal, state, now_ms) {
            return RiskDecision::reject(reason, detail);
        }

        if self.breaker.is_tripped(now_ms) {
            match self.mode {
                ExecutionMode::Live => {
                    return RiskDecision::reject(
                        "circuit_breaker_tripped",
                        format!(
                            "cooldown until {:?}",
                            self.breaker.cooldown_until()
                        ),
                    );
                }
                ExecutionMode::Paper | ExecutionMode::Backtest => {
                    // Paper keeps trading through a tripped breaker but the
                    // would-be rejection is recorded for parity with live.
                    eprintln!(
                        "WARN: signal_id={} circuit breaker tripped; paper mode proceeding",
                        signal.id
                    );
                }
            }
        }

        RiskDecision::approve(adjusted)
    }

    /// Returns the adjusted notional (`None` when unchanged), or a
    /// rejection when even the economic minimum does not fit.
    fn check_position_limits(
        &mut self,
        signal: &Signal,
        portfolio: &PortfolioView,
    ) -> Result<Option<Decimal>, RiskDecision> {
        let requested = signal.notional_usd;
        let base_asset = crate::types::split_symbol(&signal.symbol)
            .map(|(base, _)| base.to_string())
            .unwrap_or_else(|| signal.symbol.clone());

        let mut headroom = requested;
        let mut tightest: &'static str = "";

        let coin_used = portfolio
            .position_usd_by_asset
            .get(&base_asset)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let coin_room = self.cfg.max_position_per_coin_usd - coin_used;
        if coin_room < headroom {
            headroom = coin_room;
            tightest = "max_position_per_coin_usd";
        }

        for leg in &signal.legs {
            let used = portfolio
                .exposure_usd_by_exchange
                .get(&leg.exchange)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let room = self.cfg.max_position_per_exchange_usd - used;
            if room < headroom {
                headroom = room;
                tightest = "max_position_per_exchange_usd";
            }
        }

        let total_room = self.cfg.max_total_exposure_usd - portfolio.total_exposure_usd;
        if total_room < headroom {
            headroom = total_room;
            tightest = "max_total_exposure_usd";
        }

        if headroom < self.cfg.min_notional_usd {
            return Err(RiskDecision::reject(
                "position_limit",
                format!(
                    "headroom {headroom} under {tightest} is below economic minimum {}",
                    self.cfg.min_notional_usd
                ),
            ));
        }

        let granted = headroom.min(requested);
        self.note_warnings(signal, portfolio, &base_asset, granted);

        Ok((granted < requested).then_some(granted))
    }

    fn note_warnings(
        &mut self,
        signal: &Signal,
        portfolio: &PortfolioView,
        base_asset: &str,
        granted: Decimal,
    ) {
        let warn_frac = self.cfg.warning_threshold_pct / Decimal::ONE_HUNDRED;
        let coin_used = portfolio
            .position_usd_by_asset
            .get(base_asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
            + granted;
        if coin_used >= self.cfg.max_position_per_coin_usd * warn_frac {
            self.warnings.push(LimitWarning {
                limit: "max_position_per_coin_usd",
                used_usd: coin_used,
                limit_usd: self.cfg.max_position_per_coin_usd,
            });
        }
        for leg in &signal.legs {
            let used = portfolio
                .exposure_usd_by_exchange
                .get(&leg.exchange)
                .copied()
                .unwrap_or(Decimal::ZERO)
                + granted;
            if used >= self.cfg.max_position_per_exchange_usd * warn_frac {
                self.warnings.push(LimitWarning {
                    limit: "max_position_per_exchange_usd",
                    used_usd: used,
                    limit_usd: self.cfg.max_position_per_exchange_usd,
                });
            }
        }
        let total = portfolio.total_exposure_usd + granted;
        if total >= self.cfg.max_total_exposure_usd * warn_frac {
            self.warnings.push(LimitWarning {
                limit: "max_total_exposure_usd",
                used_usd: total,
                limit_usd: self.cfg.max_total_exposure_usd,
            });
        }
    }

    /// Record one closed signal outcome: daily PnL, equity, loss streak.
    /// Returns true when this result trips the breaker.
    pub fn record_outcome(
        &mut self,
        closed: ClosedTrade,
        equity_usd: Decimal,
        now_ms: TimestampMs,
    ) -> bool {
        self.drawdown
            .record_pnl(closed.pnl_usd, closed.submitted_ts, now_ms);
        self.drawdown.update_equity(equity_usd, now_ms);
        self.breaker.record_close(closed.counts_as_loss, now_ms)
    }

    pub fn operator_reset_breaker(&mut self) {
        self.breaker.reset();
    }
}
