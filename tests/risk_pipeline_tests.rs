// Risk gate behavior: position-limit reduction, drawdown and daily-loss
// gates, and the consecutive-loss circuit breaker end to end.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use arbot::config::Config;
use arbot::market_state::MarketState;
use arbot::risk::{ClosedTrade, PortfolioView, RiskManager};
use arbot::types::{ExecutionMode, Side, Signal, SignalLeg, Strategy};

fn signal(id: u64, notional: Decimal) -> Signal {
    Signal {
        id,
        strategy: Strategy::Spatial,
        symbol: "BTC/USDT".to_string(),
        legs: vec![
            SignalLeg {
                exchange: "alpha".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: Side::Buy,
                target_price: dec!(100),
                max_qty: notional / dec!(100),
            },
            SignalLeg {
                exchange: "beta".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: Side::Sell,
                target_price: dec!(100.5),
                max_qty: notional / dec!(100.5),
            },
        ],
        gross_spread_pct: dec!(0.5),
        net_spread_pct: dec!(0.3),
        estimated_pnl_usd: notional * dec!(0.003),
        notional_usd: notional,
        confidence: 0.8,
        detected_ts: 0,
    }
}

fn manager(mode: ExecutionMode) -> RiskManager {
    let cfg = Config::default();
    RiskManager::new(&cfg.risk, mode, dec!(100000), 0)
}

fn portfolio_with_coin(position_usd: Decimal) -> PortfolioView {
    let mut view = PortfolioView {
        equity_usd: dec!(100000),
        total_exposure_usd: position_usd,
        ..Default::default()
    };
    view.position_usd_by_asset
        .insert("BTC".to_string(), position_usd);
    view.exposure_usd_by_exchange
        .insert("alpha".to_string(), position_usd);
    view
}

#[test]
fn clean_signal_is_approved_unchanged() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    let decision = risk.check_signal(&signal(1, dec!(1000)), &PortfolioView::default(), &state, 1_000);
    assert!(decision.approved);
    assert!(decision.adjusted_notional_usd.is_none());
}

#[test]
fn position_limit_shrinks_notional_to_headroom() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    // 9_500 of a 10_000 per-coin limit already used.
    let decision = risk.check_signal(
        &signal(1, dec!(1000)),
        &portfolio_with_coin(dec!(9500)),
        &state,
        1_000,
    );
    assert!(decision.approved);
    assert_eq!(decision.adjusted_notional_usd, Some(dec!(500)));
    // Headroom warning fired at the 70% threshold.
    assert!(!risk.take_warnings().is_empty());
}

#[test]
fn position_limit_rejects_below_economic_minimum() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    let decision = risk.check_signal(
        &signal(1, dec!(1000)),
        &portfolio_with_coin(dec!(9995)),
        &state,
        1_000,
    );
    assert!(!decision.approved);
    assert_eq!(decision.reason, "position_limit");
}

#[test]
fn drawdown_gate_blocks_until_recovery() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    let portfolio = PortfolioView::default();

    // Equity drops 5% from the high-water mark.
    risk.drawdown.update_equity(dec!(95000), 1_000);
    let decision = risk.check_signal(&signal(2, dec!(1000)), &portfolio, &state, 2_000);
    assert!(!decision.approved);
    assert_eq!(decision.reason, "max_drawdown");

    // Equity recovers above the threshold: approvals resume.
    risk.drawdown.update_equity(dec!(98000), 3_000);
    let decision = risk.check_signal(&signal(3, dec!(1000)), &portfolio, &state, 4_000);
    assert!(decision.approved);
}

#[test]
fn daily_loss_floor_blocks_and_resets_at_rollover() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    let portfolio = PortfolioView::default();
    risk.record_outcome(
        ClosedTrade { pnl_usd: dec!(-600), counts_as_loss: true, submitted_ts: 1_000 },
        dec!(99400),
        1_000,
    );
    let decision = risk.check_signal(&signal(2, dec!(1000)), &portfolio, &state, 2_000);
    assert!(!decision.approved);
    assert_eq!(decision.reason, "daily_loss_usd");

    // 00:00 UTC rollover resets the daily counters atomically.
    let next_day = 86_400_000 + 1;
    let decision = risk.check_signal(&signal(3, dec!(1000)), &portfolio, &state, next_day);
    assert!(decision.approved);
}

#[test]
fn circuit_breaker_trips_after_consecutive_losses() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    let portfolio = PortfolioView::default();

    // Nine losses: still trading.
    for i in 0..9 {
        let tripped = risk.record_outcome(
            ClosedTrade { pnl_usd: dec!(-1), counts_as_loss: true, submitted_ts: i },
            dec!(100000),
            i,
        );
        assert!(!tripped);
    }
    // The tenth closes the streak at the limit and trips the breaker.
    assert!(risk.record_outcome(
        ClosedTrade { pnl_usd: dec!(-1), counts_as_loss: true, submitted_ts: 10 },
        dec!(100000),
        10,
    ));

    // An otherwise-profitable signal is rejected while tripped.
    let decision = risk.check_signal(&signal(11, dec!(1000)), &portfolio, &state, 11);
    assert!(!decision.approved);
    assert_eq!(decision.reason, "circuit_breaker_tripped");

    // Cooldown elapsed (30 minutes): trading resumes.
    let after_cooldown = 10 + 30 * 60_000 + 1;
    let decision = risk.check_signal(&signal(12, dec!(1000)), &portfolio, &state, after_cooldown);
    assert!(decision.approved);
}

#[test]
fn operator_reset_reopens_trading() {
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    for i in 0..10 {
        risk.record_outcome(
            ClosedTrade { pnl_usd: dec!(-1), counts_as_loss: true, submitted_ts: i },
            dec!(100000),
            i,
        );
    }
    assert!(!risk
        .check_signal(&signal(1, dec!(1000)), &PortfolioView::default(), &state, 20)
        .approved);
    risk.operator_reset_breaker();
    assert!(risk
        .check_signal(&signal(2, dec!(1000)), &PortfolioView::default(), &state, 21)
        .approved);
}

#[test]
fn paper_mode_logs_through_a_tripped_breaker() {
    let mut risk = manager(ExecutionMode::Paper);
    let state = MarketState::new(4);
    for i in 0..10 {
        risk.record_outcome(
            ClosedTrade { pnl_usd: dec!(-1), counts_as_loss: true, submitted_ts: i },
            dec!(100000),
            i,
        );
    }
    // Paper keeps going; the would-be rejection is only logged.
    let decision = risk.check_signal(&signal(1, dec!(1000)), &PortfolioView::default(), &state, 20);
    assert!(decision.approved);
}

#[test]
fn approved_notional_never_exceeds_headroom() {
    let cfg = Config::default();
    let mut risk = manager(ExecutionMode::Live);
    let state = MarketState::new(4);
    for used in [dec!(0), dec!(5000), dec!(9100), dec!(9800)] {
        let portfolio = portfolio_with_coin(used);
        let decision = risk.check_signal(&signal(1, dec!(1000)), &portfolio, &state, 1_000);
        if !decision.approved {
            continue;
        }
        let granted = decision.adjusted_notional_usd.unwrap_or(dec!(1000));
        assert!(used + granted <= cfg.risk.max_position_per_coin_usd);
        assert!(granted >= cfg.risk.min_notional_usd);
    }
}
