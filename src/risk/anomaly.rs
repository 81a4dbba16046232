// src/risk/anomaly.rs
//
// Anomaly gate: flash-crash detection on recent trade prints, per-leg price
// deviation against the cross-exchange rolling median, and gross-spread
// checks (hard cap plus z-score against the pair's recent observations).

use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::market_state::MarketState;
use crate::orderbook::TopOfBook;
use crate::types::{Signal, TimestampMs};

const HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub price_deviation_threshold_pct: Decimal,
    pub max_spread_pct: Decimal,
    pub spread_std_threshold: f64,
    pub flash_crash_pct: Decimal,
    pub flash_lookback_ms: i64,
}

pub struct AnomalyDetector {
    cfg: AnomalyConfig,
    /// Latest mid per (exchange, symbol), for the cross-exchange median.
    mids: HashMap<(String, String), Decimal>,
    /// Gross-spread observations per (symbol, buy_exchange, sell_exchange).
    spread_history: HashMap<(String, String, String), VecDeque<f64>>,
}

impl AnomalyDetector {
    pub fn new(cfg: AnomalyConfig) -> Self {
        Self {
            cfg,
            mids: HashMap::new(),
            spread_history: HashMap::new(),
        }
    }

    /// Feed a top-of-book observation into the rolling state.
    pub fn observe_top(&mut self, top: &TopOfBook) {
        self.mids.insert(
            (top.exchange.clone(), top.symbol.clone()),
            top.mid(),
        );
    }

    fn median_mid(&self, symbol: &str) -> Option<Decimal> {
        let mut mids: Vec<Decimal> = self
            .mids
            .iter()
            .filter(|((_, sym), _)| sym == symbol)
            .map(|(_, mid)| *mid)
            .collect();
        if mids.is_empty() {
            return None;
        }
        mids.sort();
        let n = mids.len();
        if n % 2 == 1 {
            Some(mids[n / 2])
        } else {
            Some((mids[n / 2 - 1] + mids[n / 2]) / Decimal::TWO)
        }
    }

    /// Run all checks against one signal. `Err` carries (reason, detail).
    /// The pair's spread history is updated as a side effect so z-scores
    /// build up over consecutive cycles.
    pub fn check_signal(
        &mut self,
        signal: &Signal,
        state: &MarketState,
        now_ms: TimestampMs,
    ) -> Result<(), (&'static str, String)> {
        self.check_flash_crash(signal, state, now_ms)?;
        self.check_price_deviation(signal)?;
        self.check_spread(signal)?;
        Ok(())
    }

    fn check_flash_crash(
        &self,
        signal: &Signal,
        state: &MarketState,
        now_ms: TimestampMs,
    ) -> Result<(), (&'static str, String)> {
        let since = now_ms - self.cfg.flash_lookback_ms;
        for leg in &signal.legs {
            let trades = state.recent_trades(&leg.exchange, &leg.symbol, since);
            if trades.len() < 2 {
                continue;
            }
            let peak = trades.iter().map(|t| t.price).max().unwrap_or(Decimal::ZERO);
            let trough = trades.iter().map(|t| t.price).min().unwrap_or(Decimal::ZERO);
            if peak <= Decimal::ZERO {
                continue;
            }
            let move_pct = (peak - trough) / peak * Decimal::ONE_HUNDRED;
            if move_pct >= self.cfg.flash_crash_pct {
                return Err((
                    "flash_crash",
                    format!(
                        "{}:{} moved {move_pct:.2}% (peak {peak}, trough {trough}) within {}ms",
                        leg.exchange, leg.symbol, self.cfg.flash_lookback_ms
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_price_deviation(&self, signal: &Signal) -> Result<(), (&'static str, String)> {
        for leg in &signal.legs {
            let Some(median) = self.median_mid(&leg.symbol) else {
                continue;
            };
            if median <= Decimal::ZERO {
                continue;
            }
            let Some(mid) = self
                .mids
                .get(&(leg.exchange.clone(), leg.symbol.clone()))
                .copied()
            else {
                continue;
            };
            let deviation = ((mid - median).abs() / median) * Decimal::ONE_HUNDRED;
            if deviation > self.cfg.price_deviation_threshold_pct {
                return Err((
                    "price_deviation",
                    format!(
                        "{}:{} mid {mid} deviates {deviation:.2}% from median {median}",
                        leg.exchange, leg.symbol
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_spread(&mut self, signal: &Signal) -> Result<(), (&'static str, String)> {
        if signal.gross_spread_pct.abs() > self.cfg.max_spread_pct {
            return Err((
                "max_spread",
                format!(
                    "gross spread {:.4}% exceeds cap {}%",
                    signal.gross_spread_pct, self.cfg.max_spread_pct
                ),
            ));
        }

        let key = (
            signal.symbol.clone(),
            signal.buy_exchange().to_string(),
            signal.sell_exchange().to_string(),
        );
        let current = signal.gross_spread_pct.to_f64().unwrap_or(0.0);
        let history = self.spread_history.entry(key).or_default();
        let verdict = zscore(history, current).and_then(|z| {
            (z >= self.cfg.spread_std_threshold).then(|| {
                (
                    "abnormal_spread",
                    format!(
                        "gross spread {current:.4}% is {z:.2} std devs above the pair mean"
                    ),
                )
            })
        });
        if history.len() >= HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(current);
        match verdict {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn zscore(history: &VecDeque<f64>, current: f64) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std <= 0.0 {
        return None;
    }
    Some((current - mean) / std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, SignalLeg, Strategy};
    use rust_decimal_macros::dec;

    fn cfg() -> AnomalyConfig {
        AnomalyConfig {
            price_deviation_threshold_pct: dec!(10),
            max_spread_pct: dec!(5),
            spread_std_threshold: 3.0,
            flash_crash_pct: dec!(10),
            flash_lookback_ms: 10_000,
        }
    }

    fn top(exchange: &str, bid: Decimal, ask: Decimal) -> TopOfBook {
        TopOfBook {
            exchange: exchange.to_string(),
            symbol: "BTC/USDT".to_string(),
            best_bid: bid,
            best_bid_qty: dec!(1),
            best_ask: ask,
            best_ask_qty: dec!(1),
            event_ts: 0,
            ingress_ts: 0,
        }
    }

    fn signal(gross: Decimal, buy_ex: &str, sell_ex: &str) -> Signal {
        Signal {
            id: 1,
            strategy: Strategy::Spatial,
            symbol: "BTC/USDT".to_string(),
            legs: vec![
                SignalLeg {
                    exchange: buy_ex.to_string(),
                    symbol: "BTC/USDT".to_string(),
                    side: Side::Buy,
                    target_price: dec!(100),
                    max_qty: dec!(1),
                },
                SignalLeg {
                    exchange: sell_ex.to_string(),
                    symbol: "BTC/USDT".to_string(),
                    side: Side::Sell,
                    target_price: dec!(101),
                    max_qty: dec!(1),
                },
            ],
            gross_spread_pct: gross,
            net_spread_pct: gross,
            estimated_pnl_usd: dec!(1),
            notional_usd: dec!(100),
            confidence: 0.5,
            detected_ts: 0,
        }
    }

    #[test]
    fn deviation_from_cross_exchange_median_rejects() {
        let mut det = AnomalyDetector::new(cfg());
        det.observe_top(&top("a", dec!(99.5), dec!(100.5)));
        det.observe_top(&top("b", dec!(99.6), dec!(100.4)));
        det.observe_top(&top("c", dec!(79.5), dec!(80.5)));
        let state = MarketState::new(4);
        let err = det.check_signal(&signal(dec!(1), "c", "a"), &state, 0).unwrap_err();
        assert_eq!(err.0, "price_deviation");
        assert!(det.check_signal(&signal(dec!(1), "a", "b"), &state, 0).is_ok());
    }

    #[test]
    fn gross_spread_cap_rejects() {
        let mut det = AnomalyDetector::new(cfg());
        let state = MarketState::new(4);
        let err = det.check_signal(&signal(dec!(6), "a", "b"), &state, 0).unwrap_err();
        assert_eq!(err.0, "max_spread");
    }

    #[test]
    fn spread_zscore_rejects_outlier() {
        let mut det = AnomalyDetector::new(cfg());
        let state = MarketState::new(4);
        for i in 0..20 {
            let spread = if i % 2 == 0 { dec!(0.3) } else { dec!(0.4) };
            assert!(det.check_signal(&signal(spread, "a", "b"), &state, 0).is_ok());
        }
        // Well above the (tight) historical distribution but under the cap.
        let err = det.check_signal(&signal(dec!(4.5), "a", "b"), &state, 0).unwrap_err();
        assert_eq!(err.0, "abnormal_spread");
    }

    #[test]
    fn flash_crash_on_trade_prints() {
        use crate::orderbook::{BookLevel, OrderBook};
        use crate::types::TradePrint;
        use std::sync::Arc;

        let mut det = AnomalyDetector::new(cfg());
        let state = MarketState::new(4);
        let mut book = OrderBook::new("a", "BTC/USDT");
        book.apply_snapshot(
            &[BookLevel { price: dec!(79), qty: dec!(1) }],
            &[BookLevel { price: dec!(80), qty: dec!(1) }],
            1,
            0,
            0,
        )
        .unwrap();
        state.publish_book(Arc::new(book));
        for (ts, price) in [(1_000, dec!(100)), (1_500, dec!(80))] {
            state.publish_trade(TradePrint {
                exchange: "a".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: Side::Sell,
                price,
                qty: dec!(1),
                event_ts: ts,
                ingress_ts: ts,
            });
        }
        let err = det
            .check_signal(&signal(dec!(1), "a", "b"), &state, 2_000)
            .unwrap_err();
        assert_eq!(err.0, "flash_crash");
    }
}
