// src/risk/drawdown.rs
//
// High-water-mark drawdown and daily loss tracking. The day boundary is
// 00:00 UTC; daily counters reset atomically at rollover, and a PnL event
// is attributed to the day bucket of its submission timestamp.

use rust_decimal::Decimal;

use crate::types::TimestampMs;

const DAY_MS: i64 = 86_400_000;

fn day_bucket(ts: TimestampMs) -> i64 {
    ts.div_euclid(DAY_MS)
}

#[derive(Debug, Clone)]
pub struct DrawdownMonitor {
    max_drawdown_pct: Decimal,
    max_daily_loss_usd: Decimal,
    max_daily_loss_pct: Decimal,
    hwm_equity: Decimal,
    current_equity: Decimal,
    day: i64,
    daily_realized: Decimal,
    day_start_equity: Decimal,
}

impl DrawdownMonitor {
    pub fn new(
        max_drawdown_pct: Decimal,
        max_daily_loss_usd: Decimal,
        max_daily_loss_pct: Decimal,
        initial_equity: Decimal,
        now_ms: TimestampMs,
    ) -> Self {
        Self {
            max_drawdown_pct,
            max_daily_loss_usd,
            max_daily_loss_pct,
            hwm_equity: initial_equity,
            current_equity: initial_equity,
            day: day_bucket(now_ms),
            daily_realized: Decimal::ZERO,
            day_start_equity: initial_equity,
        }
    }

    fn roll_day(&mut self, now_ms: TimestampMs) {
        let bucket = day_bucket(now_ms);
        if bucket > self.day {
            self.day = bucket;
            self.daily_realized = Decimal::ZERO;
            self.day_start_equity = self.current_equity;
        }
    }

    pub fn update_equity(&mut self, equity: Decimal, now_ms: TimestampMs) {
        self.roll_day(now_ms);
        self.current_equity = equity;
        if equity > self.hwm_equity {
            self.hwm_equity = equity;
        }
    }

    /// Book realized PnL into the day bucket of `submitted_ts`. PnL landing
    /// after a rollover but submitted before it stays in its (gone) bucket.
    pub fn record_pnl(&mut self, pnl: Decimal, submitted_ts: TimestampMs, now_ms: TimestampMs) {
        self.roll_day(now_ms);
        if day_bucket(submitted_ts) == self.day {
            self.daily_realized += pnl;
        }
    }

    pub fn current_drawdown_pct(&self) -> Decimal {
        if self.hwm_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.hwm_equity - self.current_equity) / self.hwm_equity * Decimal::ONE_HUNDRED
    }

    pub fn daily_realized(&self) -> Decimal {
        self.daily_realized
    }

    /// Gate check. `Err` carries (reason, detail).
    pub fn check(&mut self, now_ms: TimestampMs) -> Result<(), (&'static str, String)> {
        self.roll_day(now_ms);
        let dd = self.current_drawdown_pct();
        if dd >= self.max_drawdown_pct {
            return Err((
                "max_drawdown",
                format!("drawdown {dd:.2}% >= limit {}%", self.max_drawdown_pct),
            ));
        }
        if self.daily_realized <= -self.max_daily_loss_usd {
            return Err((
                "daily_loss_usd",
                format!(
                    "daily pnl {} <= -{}",
                    self.daily_realized, self.max_daily_loss_usd
                ),
            ));
        }
        if self.day_start_equity > Decimal::ZERO {
            let pct_floor =
                -(self.max_daily_loss_pct / Decimal::ONE_HUNDRED * self.day_start_equity);
            if self.daily_realized <= pct_floor {
                return Err((
                    "daily_loss_pct",
                    format!(
                        "daily pnl {} <= {}% of day-start equity {}",
                        self.daily_realized, -self.max_daily_loss_pct, self.day_start_equity
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn drawdown_blocks_at_threshold() {
        let mut dd = DrawdownMonitor::new(dec!(5), dec!(500), dec!(1.0), dec!(10000), 0);
        dd.update_equity(dec!(10000), 1_000);
        assert!(dd.check(1_001).is_ok());
        // 5% below the HWM: rejected until equity recovers.
        dd.update_equity(dec!(9500), 2_000);
        let (reason, _) = dd.check(2_001).unwrap_err();
        assert_eq!(reason, "max_drawdown");
        dd.update_equity(dec!(9800), 3_000);
        assert!(dd.check(3_001).is_ok());
    }

    #[test]
    fn hwm_ratchets_up() {
        let mut dd = DrawdownMonitor::new(dec!(5), dec!(500), dec!(1.0), dec!(10000), 0);
        dd.update_equity(dec!(12000), 1_000);
        dd.update_equity(dec!(11500), 2_000);
        // 500 off a 12000 peak is ~4.2%, still inside the limit.
        assert!(dd.check(2_001).is_ok());
        assert!(dd.current_drawdown_pct() > dec!(4.1));
    }

    #[test]
    fn daily_loss_usd_floor() {
        let mut dd = DrawdownMonitor::new(dec!(50), dec!(500), dec!(99), dec!(100000), 0);
        dd.record_pnl(dec!(-400), 1_000, 1_000);
        assert!(dd.check(1_001).is_ok());
        dd.record_pnl(dec!(-100), 2_000, 2_000);
        let (reason, _) = dd.check(2_001).unwrap_err();
        assert_eq!(reason, "daily_loss_usd");
    }

    #[test]
    fn day_rollover_resets_counters() {
        let mut dd = DrawdownMonitor::new(dec!(50), dec!(500), dec!(99), dec!(100000), 0);
        dd.record_pnl(dec!(-600), 1_000, 1_000);
        assert!(dd.check(1_001).is_err());
        // Next UTC day: counters reset.
        let next_day = DAY_MS + 1;
        assert!(dd.check(next_day).is_ok());
        assert_eq!(dd.daily_realized(), Decimal::ZERO);
    }

    #[test]
    fn in_flight_pnl_uses_submission_day_bucket() {
        let mut dd = DrawdownMonitor::new(dec!(50), dec!(500), dec!(99), dec!(100000), 0);
        // Submitted just before midnight, closed just after: old bucket.
        dd.record_pnl(dec!(-600), DAY_MS - 10, DAY_MS + 10);
        assert_eq!(dd.daily_realized(), Decimal::ZERO);
        assert!(dd.check(DAY_MS + 20).is_ok());
    }

    #[test]
    fn daily_loss_pct_floor() {
        let mut dd = DrawdownMonitor::new(dec!(50), dec!(1000000), dec!(1.0), dec!(10000), 0);
        dd.record_pnl(dec!(-100), 500, 500);
        let (reason, _) = dd.check(501).unwrap_err();
        assert_eq!(reason, "daily_loss_pct");
    }
}
