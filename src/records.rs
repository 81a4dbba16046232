// src/records.rs
//
// Persisted JSONL records: signals, per-order trades, portfolio snapshots,
// and the daily performance summary. These files are the outward contract
// consumed by the dashboard and trade-log importers.

use std::path::PathBuf;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::execution::{LegExecution, SignalOutcome};
use crate::ledger::append_jsonl;
use crate::types::{ExecutionMode, Signal, SignalStatus, TimestampMs};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Serialize)]
pub struct SignalRecord {
    pub id: u64,
    pub strategy: &'static str,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub symbol: String,
    pub gross_spread: Decimal,
    pub net_spread: Decimal,
    pub estimated_pnl: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_pnl: Option<Decimal>,
    pub status: &'static str,
    pub detected_at: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<TimestampMs>,
    pub metadata: SignalMetadata,
}

#[derive(Debug, Serialize)]
pub struct SignalMetadata {
    pub confidence: f64,
    pub notional_usd: Decimal,
    pub leg_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TradeRecord {
    pub signal_id: u64,
    pub exchange: String,
    pub symbol: String,
    pub side: &'static str,
    pub order_type: &'static str,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_price: Option<Decimal>,
    pub filled_price: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub status: &'static str,
    pub execution_mode: &'static str,
    pub latency_ms: i64,
    pub created_at: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_at: Option<TimestampMs>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioRow {
    pub timestamp: TimestampMs,
    pub exchange: String,
    pub asset: String,
    pub balance: Decimal,
    pub usd_value: Decimal,
}

#[derive(Debug, Serialize)]
pub struct DailyPerformanceRecord {
    pub date: String,
    pub execution_mode: &'static str,
    pub total_signals: u64,
    pub executed_trades: u64,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
}

/// Appends records under the run directory.
pub struct RecordSink {
    signals_path: PathBuf,
    trades_path: PathBuf,
    portfolio_path: PathBuf,
    daily_path: PathBuf,
}

impl RecordSink {
    pub fn new(run_dir: &std::path::Path) -> Self {
        Self {
            signals_path: run_dir.join("signals.jsonl"),
            trades_path: run_dir.join("trades.jsonl"),
            portfolio_path: run_dir.join("portfolio.jsonl"),
            daily_path: run_dir.join("daily_performance.jsonl"),
        }
    }

    pub fn record_signal(
        &self,
        signal: &Signal,
        status: SignalStatus,
        actual_pnl: Option<Decimal>,
        executed_at: Option<TimestampMs>,
        reject_reason: Option<String>,
    ) {
        let record = SignalRecord {
            id: signal.id,
            strategy: signal.strategy.as_str(),
            buy_exchange: signal.buy_exchange().to_string(),
            sell_exchange: signal.sell_exchange().to_string(),
            symbol: signal.symbol.clone(),
            gross_spread: signal.gross_spread_pct,
            net_spread: signal.net_spread_pct,
            estimated_pnl: signal.estimated_pnl_usd,
            actual_pnl,
            status: status.as_str(),
            detected_at: signal.detected_ts,
            executed_at,
            metadata: SignalMetadata {
                confidence: signal.confidence,
                notional_usd: signal.notional_usd,
                leg_count: signal.legs.len(),
                reject_reason,
            },
        };
        self.append(&self.signals_path, &record);
    }

    pub fn record_trades(&self, mode: ExecutionMode, legs: &[LegExecution]) {
        for leg in legs {
            let (fee_asset, filled_at) = leg
                .fills
                .first()
                .map(|f| (f.fee_asset.clone(), Some(f.ts)))
                .unwrap_or_default();
            let record = TradeRecord {
                signal_id: leg.order.signal_id,
                exchange: leg.order.exchange.clone(),
                symbol: leg.order.symbol.clone(),
                side: leg.order.side.as_str(),
                order_type: leg.order.order_type.as_str(),
                requested_qty: leg.order.requested_qty,
                filled_qty: leg.filled_qty,
                requested_price: leg.order.requested_price,
                filled_price: leg.avg_price,
                fee: leg.fee_usd,
                fee_asset,
                status: leg.order.state.as_str(),
                execution_mode: mode.as_str(),
                latency_ms: leg.latency_ms,
                created_at: leg.order.created_ts,
                filled_at,
            };
            self.append(&self.trades_path, &record);
        }
    }

    pub fn record_portfolio(
        &self,
        timestamp: TimestampMs,
        rows: &[(String, String, Decimal, Decimal)],
    ) {
        for (exchange, asset, balance, usd_value) in rows {
            let record = PortfolioRow {
                timestamp,
                exchange: exchange.clone(),
                asset: asset.clone(),
                balance: *balance,
                usd_value: *usd_value,
            };
            self.append(&self.portfolio_path, &record);
        }
    }

    pub fn record_daily(&self, record: &DailyPerformanceRecord) {
        self.append(&self.daily_path, record);
    }

    fn append<T: Serialize>(&self, path: &std::path::Path, record: &T) {
        if let Err(err) = append_jsonl(path, record) {
            eprintln!("WARN: record append failed path={} err={err}", path.display());
        }
    }
}

/// Rolling accumulator for one UTC day of performance.
#[derive(Debug)]
pub struct DailyPerformance {
    mode: ExecutionMode,
    day: i64,
    total_signals: u64,
    executed_trades: u64,
    total_pnl: Decimal,
    total_fees: Decimal,
    wins: u64,
    closed: u64,
    returns: Vec<f64>,
    peak_equity: Decimal,
    max_drawdown_pct: f64,
}

impl DailyPerformance {
    pub fn new(mode: ExecutionMode, now_ms: TimestampMs) -> Self {
        Self {
            mode,
            day: now_ms.div_euclid(DAY_MS),
            total_signals: 0,
            executed_trades: 0,
            total_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            wins: 0,
            closed: 0,
            returns: Vec::new(),
            peak_equity: Decimal::ZERO,
            max_drawdown_pct: 0.0,
        }
    }

    pub fn note_signal(&mut self) {
        self.total_signals += 1;
    }

    pub fn note_outcome(&mut self, outcome: &SignalOutcome) {
        if outcome.status == SignalStatus::Executed {
            self.executed_trades += 1;
        }
        if outcome.status == SignalStatus::Executed || !outcome.legs.is_empty() {
            self.closed += 1;
            if outcome.realized_pnl_usd > Decimal::ZERO {
                self.wins += 1;
            }
            self.returns
                .push(outcome.realized_pnl_usd.to_f64().unwrap_or(0.0));
        }
        self.total_pnl += outcome.realized_pnl_usd;
        self.total_fees += outcome.legs.iter().map(|l| l.fee_usd).sum::<Decimal>();
    }

    pub fn note_equity(&mut self, equity: Decimal) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity > Decimal::ZERO {
            let dd = ((self.peak_equity - equity) / self.peak_equity * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            if dd > self.max_drawdown_pct {
                self.max_drawdown_pct = dd;
            }
        }
    }

    /// True when `now_ms` has crossed into a new UTC day.
    pub fn day_rolled(&self, now_ms: TimestampMs) -> bool {
        now_ms.div_euclid(DAY_MS) > self.day
    }

    /// Close out the day into a record and reset for the next one.
    pub fn roll(&mut self, now_ms: TimestampMs) -> DailyPerformanceRecord {
        let record = self.summary();
        *self = DailyPerformance::new(self.mode, now_ms);
        record
    }

    pub fn summary(&self) -> DailyPerformanceRecord {
        let win_rate = if self.closed > 0 {
            self.wins as f64 / self.closed as f64
        } else {
            0.0
        };
        DailyPerformanceRecord {
            date: format_utc_date(self.day),
            execution_mode: self.mode.as_str(),
            total_signals: self.total_signals,
            executed_trades: self.executed_trades,
            total_pnl: self.total_pnl,
            total_fees: self.total_fees,
            net_pnl: self.total_pnl,
            sharpe_ratio: sharpe(&self.returns),
            max_drawdown: self.max_drawdown_pct,
            win_rate,
        }
    }
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    if std <= 0.0 {
        return 0.0;
    }
    mean / std * n.sqrt()
}

/// Day bucket (days since epoch) to "YYYY-MM-DD".
fn format_utc_date(day_bucket: i64) -> String {
    // Civil-from-days, Hinnant's algorithm.
    let z = day_bucket + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}
