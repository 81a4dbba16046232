// Spatial detector behavior: emission thresholds, staleness, depth gates,
// tie-breaking, and per-pair cooldowns.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use arbot::config::Config;
use arbot::detector::SpatialDetector;
use arbot::market_state::MarketState;
use arbot::orderbook::{BookLevel, OrderBook};
use arbot::types::Side;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.exchanges_enabled = vec!["alpha".to_string(), "beta".to_string()];
    for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
        let mut exchange = cfg.exchanges[0].clone();
        exchange.name = name.to_string();
        exchange.taker_fee_pct = dec!(0.10);
        if i < cfg.exchanges.len() {
            cfg.exchanges[i] = exchange;
        } else {
            cfg.exchanges.push(exchange);
        }
    }
    // Target notional = min(1000, 1000 * 10) = 1000.
    cfg.risk.max_position_per_coin_usd = dec!(1000);
    cfg.spatial.min_depth_usd = dec!(1000);
    cfg
}

fn publish(
    state: &MarketState,
    exchange: &str,
    bid: (Decimal, Decimal),
    ask: (Decimal, Decimal),
    event_ts: i64,
) {
    let mut book = OrderBook::new(exchange, "BTC/USDT");
    book.apply_snapshot(
        &[BookLevel { price: bid.0, qty: bid.1 }],
        &[BookLevel { price: ask.0, qty: ask.1 }],
        1,
        event_ts,
        event_ts,
    )
    .unwrap();
    state.publish_book(Arc::new(book));
}

fn detector() -> SpatialDetector {
    SpatialDetector::new(Arc::new(AtomicU64::new(0)))
}

#[test]
fn capture_emits_single_signal_with_net_spread() {
    let cfg = test_config();
    let state = MarketState::new(16);
    let now = 1_000_000;
    // Buy alpha at 100.00, sell beta at 100.50, 0.10% taker each side.
    publish(&state, "alpha", (dec!(99.90), dec!(20)), (dec!(100.00), dec!(20)), now);
    publish(&state, "beta", (dec!(100.50), dec!(20)), (dec!(100.60), dec!(20)), now);

    let mut det = detector();
    let signal = det.detect(&cfg, &state, "BTC/USDT", now).unwrap();
    assert_eq!(signal.gross_spread_pct, dec!(0.5));
    assert_eq!(signal.net_spread_pct, dec!(0.30));
    assert_eq!(signal.buy_exchange(), "alpha");
    assert_eq!(signal.sell_exchange(), "beta");
    assert_eq!(signal.notional_usd, dec!(1000));
    let buy = signal.leg(Side::Buy).unwrap();
    assert_eq!(buy.target_price, dec!(100.00));
    assert_eq!(buy.max_qty, dec!(10));
    assert!(signal.estimated_pnl_usd > dec!(2.9) && signal.estimated_pnl_usd < dec!(3.1));
    // One signal per symbol per cycle: the same cycle yields nothing more
    // (and the pair is now on cooldown anyway).
    assert!(det.detect(&cfg, &state, "BTC/USDT", now).is_none());
}

#[test]
fn threshold_boundary_epsilon() {
    let cfg = test_config();
    let now = 1_000_000;

    // Exactly at min_spread_pct: emitted.
    let state = MarketState::new(16);
    publish(&state, "alpha", (dec!(99.90), dec!(20)), (dec!(100.00), dec!(20)), now);
    publish(&state, "beta", (dec!(100.45), dec!(20)), (dec!(100.55), dec!(20)), now);
    let signal = detector().detect(&cfg, &state, "BTC/USDT", now).unwrap();
    assert_eq!(signal.net_spread_pct, dec!(0.25));

    // A hair under: nothing.
    let state = MarketState::new(16);
    publish(&state, "alpha", (dec!(99.90), dec!(20)), (dec!(100.00), dec!(20)), now);
    publish(&state, "beta", (dec!(100.4499), dec!(20)), (dec!(100.55), dec!(20)), now);
    assert!(detector().detect(&cfg, &state, "BTC/USDT", now).is_none());
}

#[test]
fn stale_snapshot_suppresses_emission() {
    let cfg = test_config();
    let state = MarketState::new(16);
    let now = 1_000_000_000;
    // Same prices as the capture case, but alpha's snapshot is 35s old
    // against a 30s staleness threshold.
    publish(
        &state,
        "alpha",
        (dec!(99.90), dec!(20)),
        (dec!(100.00), dec!(20)),
        now - 35_000,
    );
    publish(&state, "beta", (dec!(100.50), dec!(20)), (dec!(100.60), dec!(20)), now);
    assert!(detector().detect(&cfg, &state, "BTC/USDT", now).is_none());
}

#[test]
fn shallow_depth_suppresses_emission() {
    let cfg = test_config();
    let state = MarketState::new(16);
    let now = 1_000_000;
    // Only $200 of depth per side against a $1000 floor.
    publish(&state, "alpha", (dec!(99.90), dec!(2)), (dec!(100.00), dec!(2)), now);
    publish(&state, "beta", (dec!(100.50), dec!(2)), (dec!(100.60), dec!(2)), now);
    assert!(detector().detect(&cfg, &state, "BTC/USDT", now).is_none());
}

#[test]
fn tie_break_prefers_best_weighted_spread() {
    let cfg = test_config();
    let state = MarketState::new(16);
    let now = 1_000_000;
    publish(&state, "alpha", (dec!(99.90), dec!(20)), (dec!(100.00), dec!(20)), now);
    publish(&state, "beta", (dec!(100.50), dec!(20)), (dec!(100.60), dec!(20)), now);
    // gamma bids higher than beta: the (alpha, gamma) pair must win.
    publish(&state, "gamma", (dec!(100.80), dec!(20)), (dec!(100.90), dec!(20)), now);

    let signal = detector().detect(&cfg, &state, "BTC/USDT", now).unwrap();
    assert_eq!(signal.sell_exchange(), "gamma");
}

#[test]
fn pair_cooldown_blocks_reemission_until_expiry() {
    let cfg = test_config();
    let state = MarketState::new(16);
    let now = 1_000_000;
    publish(&state, "alpha", (dec!(99.90), dec!(20)), (dec!(100.00), dec!(20)), now);
    publish(&state, "beta", (dec!(100.50), dec!(20)), (dec!(100.60), dec!(20)), now);

    let mut det = detector();
    assert!(det.detect(&cfg, &state, "BTC/USDT", now).is_some());
    assert!(det.detect(&cfg, &state, "BTC/USDT", now + 1_000).is_none());
    // Cooldown (5s default) elapsed: the pair qualifies again.
    assert!(det
        .detect(&cfg, &state, "BTC/USDT", now + cfg.spatial.pair_cooldown_ms + 1)
        .is_some());
}
