// src/ledger.rs
//
// In-memory ledger of per-exchange balances and realized PnL, with a
// durable JSONL append trail. Single writer (the execution engine);
// readers take consistent snapshots per call. Applying the same
// exchange fill id twice is a no-op.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::risk::PortfolioView;
use crate::types::{split_symbol, Balance, Fill, Side, TimestampMs};

const STABLE_ASSETS: [&str; 5] = ["USDT", "USDC", "BUSD", "USD", "DAI"];

/// Assets treated as 1:1 USD for marks and exposure.
pub fn is_quote_stable(asset: &str) -> bool {
    STABLE_ASSETS.contains(&asset)
}

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Serialize)]
struct LedgerEvent<'a> {
    ts: TimestampMs,
    kind: &'a str,
    exchange: &'a str,
    asset: &'a str,
    delta: Decimal,
    free_after: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    fill_id: Option<&'a str>,
}

pub struct Ledger {
    balances: HashMap<(String, String), Balance>,
    seen_fill_ids: HashSet<String>,
    /// Last USD mark per asset, from mid prices.
    marks: HashMap<String, Decimal>,
    cumulative_realized_usd: Decimal,
    daily_realized_usd: Decimal,
    day: i64,
    journal_path: Option<PathBuf>,
}

impl Ledger {
    pub fn new(journal_path: Option<PathBuf>) -> Self {
        Self {
            balances: HashMap::new(),
            seen_fill_ids: HashSet::new(),
            marks: HashMap::new(),
            cumulative_realized_usd: Decimal::ZERO,
            daily_realized_usd: Decimal::ZERO,
            day: 0,
            journal_path,
        }
    }

    /// Seed identical starting quote balances on each exchange (paper mode).
    pub fn seed_quote_balances(&mut self, exchanges: &[String], asset: &str, amount: Decimal) {
        for exchange in exchanges {
            self.balances.insert(
                (exchange.clone(), asset.to_string()),
                Balance {
                    free: amount,
                    locked: Decimal::ZERO,
                },
            );
        }
    }

    pub fn set_balance(&mut self, exchange: &str, asset: &str, balance: Balance) {
        self.balances
            .insert((exchange.to_string(), asset.to_string()), balance);
    }

    pub fn balance(&self, exchange: &str, asset: &str) -> Balance {
        self.balances
            .get(&(exchange.to_string(), asset.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_mark(&mut self, asset: &str, usd_price: Decimal) {
        self.marks.insert(asset.to_string(), usd_price);
    }

    pub fn mark(&self, asset: &str) -> Decimal {
        if is_quote_stable(asset) {
            return Decimal::ONE;
        }
        self.marks.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Apply a fill to balances. Returns false when the fill id was already
    /// consumed (duplicate delivery across poll + stream sources).
    pub fn apply_fill(&mut self, exchange: &str, symbol: &str, side: Side, fill: &Fill) -> bool {
        if let Some(id) = &fill.exchange_fill_id {
            if !self.seen_fill_ids.insert(id.clone()) {
                return false;
            }
        }
        let Some((base, quote)) = split_symbol(symbol) else {
            return false;
        };
        let notional = fill.qty * fill.price;
        match side {
            Side::Buy => {
                self.adjust(exchange, quote, -notional, fill.ts, "fill", fill.exchange_fill_id.as_deref());
                self.adjust(exchange, base, fill.qty, fill.ts, "fill", fill.exchange_fill_id.as_deref());
            }
            Side::Sell => {
                self.adjust(exchange, base, -fill.qty, fill.ts, "fill", fill.exchange_fill_id.as_deref());
                self.adjust(exchange, quote, notional, fill.ts, "fill", fill.exchange_fill_id.as_deref());
            }
        }
        if fill.fee > Decimal::ZERO {
            self.adjust(exchange, &fill.fee_asset, -fill.fee, fill.ts, "fee", None);
        }
        true
    }

    fn adjust(
        &mut self,
        exchange: &str,
        asset: &str,
        delta: Decimal,
        ts: TimestampMs,
        kind: &str,
        fill_id: Option<&str>,
    ) {
        let entry = self
            .balances
            .entry((exchange.to_string(), asset.to_string()))
            .or_default();
        entry.free += delta;
        if entry.free < Decimal::ZERO {
            // Invariant: balances never go negative. Fatal upstream in live
            // mode; here it is surfaced and clamped so paper runs continue.
            eprintln!(
                "ERROR: negative balance exchange={exchange} asset={asset} free={}",
                entry.free
            );
        }
        let record = LedgerEvent {
            ts,
            kind,
            exchange,
            asset,
            delta,
            free_after: entry.free,
            fill_id,
        };
        if let Some(path) = &self.journal_path {
            if let Err(err) = append_jsonl(path, &record) {
                eprintln!("WARN: ledger journal append failed: {err}");
            }
        }
    }

    pub fn record_realized(&mut self, pnl: Decimal, now_ms: TimestampMs) {
        let bucket = now_ms.div_euclid(DAY_MS);
        if bucket > self.day {
            self.day = bucket;
            self.daily_realized_usd = Decimal::ZERO;
        }
        self.cumulative_realized_usd += pnl;
        self.daily_realized_usd += pnl;
    }

    pub fn cumulative_realized_usd(&self) -> Decimal {
        self.cumulative_realized_usd
    }

    pub fn daily_realized_usd(&self) -> Decimal {
        self.daily_realized_usd
    }

    /// Total equity in USD at current marks.
    pub fn equity_usd(&self) -> Decimal {
        self.balances
            .iter()
            .map(|((_, asset), bal)| bal.total() * self.mark(asset))
            .sum()
    }

    /// Consistent snapshot for the risk gate.
    pub fn portfolio_view(&self) -> PortfolioView {
        let mut view = PortfolioView {
            equity_usd: self.equity_usd(),
            ..Default::default()
        };
        for ((exchange, asset), bal) in &self.balances {
            if is_quote_stable(asset) {
                continue;
            }
            let value = (bal.total() * self.mark(asset)).abs();
            *view
                .position_usd_by_asset
                .entry(asset.clone())
                .or_insert(Decimal::ZERO) += value;
            *view
                .exposure_usd_by_exchange
                .entry(exchange.clone())
                .or_insert(Decimal::ZERO) += value;
            view.total_exposure_usd += value;
        }
        view
    }

    /// (exchange, asset, balance, usd_value) rows for portfolio snapshots.
    pub fn snapshot_rows(&self) -> Vec<(String, String, Decimal, Decimal)> {
        let mut rows: Vec<_> = self
            .balances
            .iter()
            .map(|((exchange, asset), bal)| {
                (
                    exchange.clone(),
                    asset.clone(),
                    bal.total(),
                    bal.total() * self.mark(asset),
                )
            })
            .collect();
        rows.sort();
        rows
    }
}

pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let line = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(id: Option<&str>, qty: Decimal, price: Decimal, fee: Decimal, fee_asset: &str) -> Fill {
        Fill {
            order_id: "ord_1".to_string(),
            exchange_fill_id: id.map(|s| s.to_string()),
            qty,
            price,
            fee,
            fee_asset: fee_asset.to_string(),
            ts: 1_000,
        }
    }

    #[test]
    fn buy_and_sell_move_both_assets() {
        let mut ledger = Ledger::new(None);
        ledger.seed_quote_balances(&["binance".to_string()], "USDT", dec!(10000));
        ledger.apply_fill(
            "binance",
            "BTC/USDT",
            Side::Buy,
            &fill(None, dec!(0.1), dec!(100), dec!(0.0001), "BTC"),
        );
        assert_eq!(ledger.balance("binance", "USDT").free, dec!(9990));
        assert_eq!(ledger.balance("binance", "BTC").free, dec!(0.0999));
        ledger.apply_fill(
            "binance",
            "BTC/USDT",
            Side::Sell,
            &fill(None, dec!(0.0999), dec!(101), dec!(0.01), "USDT"),
        );
        assert_eq!(ledger.balance("binance", "BTC").free, Decimal::ZERO);
        assert!(ledger.balance("binance", "USDT").free > dec!(9990));
    }

    #[test]
    fn duplicate_fill_id_is_noop() {
        let mut ledger = Ledger::new(None);
        ledger.seed_quote_balances(&["binance".to_string()], "USDT", dec!(1000));
        let f = fill(Some("f-1"), dec!(1), dec!(100), Decimal::ZERO, "USDT");
        assert!(ledger.apply_fill("binance", "BTC/USDT", Side::Buy, &f));
        let after_first = ledger.balance("binance", "USDT").free;
        assert!(!ledger.apply_fill("binance", "BTC/USDT", Side::Buy, &f));
        assert_eq!(ledger.balance("binance", "USDT").free, after_first);
    }

    #[test]
    fn portfolio_view_skips_stables_and_uses_marks() {
        let mut ledger = Ledger::new(None);
        ledger.seed_quote_balances(
            &["binance".to_string(), "bybit".to_string()],
            "USDT",
            dec!(5000),
        );
        ledger.set_mark("BTC", dec!(100));
        ledger.set_balance(
            "binance",
            "BTC",
            Balance {
                free: dec!(2),
                locked: Decimal::ZERO,
            },
        );
        let view = ledger.portfolio_view();
        assert_eq!(view.position_usd_by_asset.get("BTC"), Some(&dec!(200)));
        assert_eq!(view.exposure_usd_by_exchange.get("binance"), Some(&dec!(200)));
        assert_eq!(view.total_exposure_usd, dec!(200));
        assert_eq!(view.equity_usd, dec!(10200));
    }

    #[test]
    fn realized_pnl_rolls_daily() {
        let mut ledger = Ledger::new(None);
        ledger.record_realized(dec!(5), 1_000);
        ledger.record_realized(dec!(-2), 2_000);
        assert_eq!(ledger.daily_realized_usd(), dec!(3));
        ledger.record_realized(dec!(1), DAY_MS + 1);
        assert_eq!(ledger.daily_realized_usd(), dec!(1));
        assert_eq!(ledger.cumulative_realized_usd(), dec!(4));
    }

    #[test]
    fn journal_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::new(Some(path.clone()));
        ledger.seed_quote_balances(&["binance".to_string()], "USDT", dec!(1000));
        ledger.apply_fill(
            "binance",
            "BTC/USDT",
            Side::Buy,
            &fill(Some("f-9"), dec!(1), dec!(100), dec!(0.1), "USDT"),
        );
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains("\"fill_id\":\"f-9\""));
    }
}
