// Paper executor behavior: the simple capture, ledger conservation,
// partial-imbalance hedging, one-leg-failed flattening, and replay
// determinism.

use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use arbot::config::Config;
use arbot::execution::{Executor, PaperExecutor};
use arbot::ledger::Ledger;
use arbot::market_state::MarketState;
use arbot::orderbook::{BookLevel, OrderBook};
use arbot::types::{Balance, Side, Signal, SignalLeg, SignalStatus, Strategy};

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.exchanges[0].name = "alpha".to_string();
    cfg.exchanges[1].name = "beta".to_string();
    cfg.execution.paper_latency_ms = 1;
    cfg.execution.paper_latency_jitter_ms = 1;
    cfg
}

fn publish(
    state: &MarketState,
    exchange: &str,
    bids: &[(Decimal, Decimal)],
    asks: &[(Decimal, Decimal)],
) {
    let mut book = OrderBook::new(exchange, "BTC/USDT");
    let bids: Vec<BookLevel> = bids.iter().map(|&(price, qty)| BookLevel { price, qty }).collect();
    let asks: Vec<BookLevel> = asks.iter().map(|&(price, qty)| BookLevel { price, qty }).collect();
    book.apply_snapshot(&bids, &asks, 1, 1_000, 1_000).unwrap();
    state.publish_book(Arc::new(book));
}

fn seeded_ledger() -> Arc<Mutex<Ledger>> {
    let mut ledger = Ledger::new(None);
    ledger.seed_quote_balances(
        &["alpha".to_string(), "beta".to_string()],
        "USDT",
        dec!(10000),
    );
    // The sell side needs inventory to sell.
    ledger.set_balance("beta", "BTC", Balance { free: dec!(20), locked: Decimal::ZERO });
    ledger.set_balance("alpha", "BTC", Balance { free: dec!(20), locked: Decimal::ZERO });
    Arc::new(Mutex::new(ledger))
}

fn spatial_signal(id: u64, qty: Decimal, buy_px: Decimal, sell_px: Decimal) -> Signal {
    let notional = qty * buy_px;
    Signal {
        id,
        strategy: Strategy::Spatial,
        symbol: "BTC/USDT".to_string(),
        legs: vec![
            SignalLeg {
                exchange: "alpha".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: Side::Buy,
                target_price: buy_px,
                max_qty: qty,
            },
            SignalLeg {
                exchange: "beta".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: Side::Sell,
                target_price: sell_px,
                max_qty: qty,
            },
        ],
        gross_spread_pct: dec!(0.5),
        net_spread_pct: dec!(0.3),
        estimated_pnl_usd: notional * dec!(0.003),
        notional_usd: notional,
        confidence: 0.8,
        detected_ts: 1_000,
    }
}

#[tokio::test]
async fn simple_capture_books_expected_pnl() {
    let cfg = test_config();
    let state = Arc::new(MarketState::new(16));
    publish(&state, "alpha", &[(dec!(99.90), dec!(20))], &[(dec!(100.00), dec!(20))]);
    publish(&state, "beta", &[(dec!(100.50), dec!(20))], &[(dec!(100.60), dec!(20))]);
    let ledger = seeded_ledger();
    let executor = PaperExecutor::new(&cfg, state, ledger.clone());

    let signal = spatial_signal(1, dec!(10), dec!(100.00), dec!(100.50));
    let outcome = executor.execute(signal.clone(), signal.notional_usd).await;

    assert_eq!(outcome.status, SignalStatus::Executed);
    assert_eq!(outcome.legs.len(), 2);
    assert!(!outcome.counts_as_loss);
    // Gross $5 on $1000, minus ~0.1% taker each side (~$2.01).
    assert!(outcome.realized_pnl_usd > dec!(2.5) && outcome.realized_pnl_usd < dec!(3.5));

    // Ledger conservation: base inventory is flat and the quote delta
    // across both exchanges equals the booked PnL.
    let ledger = ledger.lock().unwrap();
    let btc_total = ledger.balance("alpha", "BTC").free + ledger.balance("beta", "BTC").free;
    assert_eq!(btc_total, dec!(40));
    let usdt_total = ledger.balance("alpha", "USDT").free + ledger.balance("beta", "USDT").free;
    assert_eq!(usdt_total - dec!(20000), outcome.realized_pnl_usd);
    assert_eq!(ledger.cumulative_realized_usd(), outcome.realized_pnl_usd);
}

#[tokio::test]
async fn partial_imbalance_is_hedged_on_the_filled_exchange() {
    let cfg = test_config();
    let state = Arc::new(MarketState::new(16));
    // Buy side has full depth; the sell side only carries 0.4 at or above
    // the limit price, so 0.6 of exposure is left naked.
    publish(&state, "alpha", &[(dec!(99.00), dec!(20))], &[(dec!(100.00), dec!(20))]);
    publish(
        &state,
        "beta",
        &[(dec!(100.50), dec!(0.4)), (dec!(99.00), dec!(20))],
        &[(dec!(100.60), dec!(20))],
    );
    let ledger = seeded_ledger();
    let executor = PaperExecutor::new(&cfg, state, ledger.clone());

    let signal = spatial_signal(2, dec!(1), dec!(100.00), dec!(100.50));
    let outcome = executor.execute(signal.clone(), signal.notional_usd).await;

    // Three legs: buy 1.0, sell 0.4, hedge-sell 0.6 on the buy exchange.
    assert_eq!(outcome.status, SignalStatus::Executed);
    assert_eq!(outcome.legs.len(), 3);
    let hedge = &outcome.legs[2];
    assert!(hedge.is_hedge);
    assert_eq!(hedge.order.exchange, "alpha");
    assert_eq!(hedge.order.side, Side::Sell);
    assert_eq!(hedge.filled_qty, dec!(0.6));
    // Hedge sold at 99 after buying at 100: the event nets a loss and
    // bumps the consecutive-loss counter.
    assert!(outcome.realized_pnl_usd < Decimal::ZERO);
    assert!(outcome.counts_as_loss);

    // Exposure is flat afterwards.
    let ledger = ledger.lock().unwrap();
    let btc_total = ledger.balance("alpha", "BTC").free + ledger.balance("beta", "BTC").free;
    assert_eq!(btc_total, dec!(40));
}

#[tokio::test]
async fn one_leg_failed_flattens_and_counts_as_loss() {
    let cfg = test_config();
    let state = Arc::new(MarketState::new(16));
    publish(&state, "alpha", &[(dec!(99.00), dec!(20))], &[(dec!(100.00), dec!(20))]);
    // Sell side bids are all below the limit: the leg cancels at zero.
    publish(&state, "beta", &[(dec!(99.00), dec!(20))], &[(dec!(100.60), dec!(20))]);
    let ledger = seeded_ledger();
    let executor = PaperExecutor::new(&cfg, state, ledger.clone());

    let signal = spatial_signal(3, dec!(1), dec!(100.00), dec!(100.50));
    let outcome = executor.execute(signal.clone(), signal.notional_usd).await;

    assert_eq!(outcome.status, SignalStatus::Missed);
    assert_eq!(outcome.legs.len(), 3);
    assert_eq!(outcome.legs[1].filled_qty, Decimal::ZERO);
    let hedge = &outcome.legs[2];
    assert!(hedge.is_hedge);
    assert_eq!(hedge.filled_qty, dec!(1));
    // Bought at 100, flattened at 99: a loss for the breaker.
    assert!(outcome.realized_pnl_usd <= Decimal::ZERO);
    assert!(outcome.counts_as_loss);
}

#[tokio::test]
async fn both_legs_failed_is_a_plain_miss() {
    let cfg = test_config();
    let state = Arc::new(MarketState::new(16));
    // No books published at all.
    let ledger = seeded_ledger();
    let executor = PaperExecutor::new(&cfg, state, ledger.clone());
    let signal = spatial_signal(4, dec!(1), dec!(100.00), dec!(100.50));
    let outcome = executor.execute(signal.clone(), signal.notional_usd).await;
    assert_eq!(outcome.status, SignalStatus::Missed);
    assert_eq!(outcome.realized_pnl_usd, Decimal::ZERO);
    assert!(!outcome.counts_as_loss);
    let ledger = ledger.lock().unwrap();
    assert_eq!(ledger.balance("alpha", "USDT").free, dec!(10000));
}

#[tokio::test]
async fn replay_of_the_same_stream_is_deterministic() {
    let run = || async {
        let cfg = test_config();
        let state = Arc::new(MarketState::new(16));
        publish(&state, "alpha", &[(dec!(99.90), dec!(20))], &[(dec!(100.00), dec!(20))]);
        publish(&state, "beta", &[(dec!(100.50), dec!(20))], &[(dec!(100.60), dec!(20))]);
        let ledger = seeded_ledger();
        let executor = PaperExecutor::new(&cfg, state, ledger);
        let signal = spatial_signal(1, dec!(10), dec!(100.00), dec!(100.50));
        let outcome = executor.execute(signal.clone(), signal.notional_usd).await;
        outcome
            .legs
            .iter()
            .map(|l| {
                (
                    l.order.id.clone(),
                    l.filled_qty,
                    l.avg_price,
                    l.fills.iter().map(|f| f.exchange_fill_id.clone()).collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>()
    };
    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}
