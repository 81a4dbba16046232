// End-to-end engine scenarios over scripted mock exchanges: the simple
// spatial capture, the staleness drop, the flash-crash guard, and the
// emergency stop.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use arbot::config::Config;
use arbot::engine::Engine;
use arbot::types::{wall_clock_ms, Balance, ExecutionMode, Side};

fn test_config(run_dir: &std::path::Path, mode: ExecutionMode) -> Config {
    let mut cfg = Config::default();
    cfg.system.execution_mode = mode;
    cfg.exchanges_enabled = vec!["alpha".to_string(), "beta".to_string()];
    cfg.symbols = vec!["BTC/USDT".to_string()];
    cfg.exchanges[0].name = "alpha".to_string();
    cfg.exchanges[1].name = "beta".to_string();
    cfg.exchanges[1].taker_fee_pct = dec!(0.10);
    cfg.risk.max_position_per_coin_usd = dec!(5000);
    cfg.spatial.min_depth_usd = dec!(1000);
    cfg.execution.paper_latency_ms = 1;
    cfg.execution.paper_latency_jitter_ms = 0;
    cfg.metrics_addr = "127.0.0.1:0".to_string();
    cfg.run_dir = run_dir.display().to_string();
    cfg
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spatial_capture_flows_tick_to_trade() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(test_config(dir.path(), ExecutionMode::Paper)).unwrap();
    engine.start();

    let alpha = engine.mock_connector("alpha").unwrap();
    let beta = engine.mock_connector("beta").unwrap();
    engine.ledger().lock().unwrap().set_balance(
        "beta",
        "BTC",
        Balance { free: dec!(12), locked: Decimal::ZERO },
    );

    // $1000 of depth at the touch on each side caps the trade at the
    // scenario's $1000 target notional.
    let now = wall_clock_ms();
    alpha.publish_snapshot(
        "BTC/USDT",
        &[(dec!(99.90), dec!(10))],
        &[(dec!(100.00), dec!(10))],
        now,
        now,
    );
    beta.publish_snapshot(
        "BTC/USDT",
        &[(dec!(100.50), dec!(10))],
        &[(dec!(100.60), dec!(10))],
        now,
        now,
    );

    let metrics = engine.metrics();
    wait_for("signal execution", || {
        metrics
            .signals_executed
            .with_label_values(&["SPATIAL"])
            .get()
            >= 1
    })
    .await;

    let pnl = engine.ledger().lock().unwrap().cumulative_realized_usd();
    assert!(pnl > dec!(2) && pnl < dec!(4), "pnl out of range: {pnl}");

    engine.stop("test_complete").await;
    assert!(dir.path().join("signals.jsonl").exists());
    assert!(dir.path().join("trades.jsonl").exists());
    assert!(dir.path().join("shutdown.json").exists());
    let trades = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
    assert!(trades.contains("\"execution_mode\":\"paper\""));
    assert!(trades.contains("\"status\":\"FILLED\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_feed_produces_no_signal() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(test_config(dir.path(), ExecutionMode::Paper)).unwrap();
    engine.start();

    let alpha = engine.mock_connector("alpha").unwrap();
    let beta = engine.mock_connector("beta").unwrap();

    // Same prices as the capture case, but alpha's event time is 35s old
    // against the 30s staleness threshold.
    let now = wall_clock_ms();
    alpha.publish_snapshot(
        "BTC/USDT",
        &[(dec!(99.90), dec!(20))],
        &[(dec!(100.00), dec!(20))],
        now - 35_000,
        now - 35_000,
    );
    beta.publish_snapshot(
        "BTC/USDT",
        &[(dec!(100.50), dec!(20))],
        &[(dec!(100.60), dec!(20))],
        now,
        now,
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let metrics = engine.metrics();
    assert_eq!(
        metrics.signals_detected.with_label_values(&["SPATIAL"]).get(),
        0
    );
    engine.stop("test_complete").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flash_crash_guard_rejects_the_signal() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(test_config(dir.path(), ExecutionMode::Paper)).unwrap();
    engine.start();

    let alpha = engine.mock_connector("alpha").unwrap();
    let beta = engine.mock_connector("beta").unwrap();

    // Calm market first, so the trade ring has the pre-crash price.
    let now = wall_clock_ms();
    alpha.publish_snapshot(
        "BTC/USDT",
        &[(dec!(99.90), dec!(20))],
        &[(dec!(100.00), dec!(20))],
        now,
        now,
    );
    beta.publish_snapshot(
        "BTC/USDT",
        &[(dec!(100.00), dec!(20))],
        &[(dec!(100.10), dec!(20))],
        now,
        now,
    );
    alpha.publish_trade("BTC/USDT", Side::Sell, dec!(100), dec!(1), now);
    // Alpha collapses 20% while beta holds: a fat apparent spread that the
    // anomaly stage must kill.
    alpha.publish_trade("BTC/USDT", Side::Sell, dec!(80), dec!(1), now + 10);
    alpha.publish_snapshot(
        "BTC/USDT",
        &[(dec!(79.90), dec!(20))],
        &[(dec!(80.00), dec!(20))],
        now + 20,
        now + 20,
    );

    let metrics = engine.metrics();
    wait_for("flash crash rejection", || {
        metrics
            .signals_rejected
            .with_label_values(&["SPATIAL", "flash_crash"])
            .get()
            >= 1
    })
    .await;
    assert_eq!(
        metrics.signals_executed.with_label_values(&["SPATIAL"]).get(),
        0
    );
    engine.stop("test_complete").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_stop_cancels_open_orders_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(test_config(dir.path(), ExecutionMode::Live)).unwrap();
    engine.start();

    let alpha = engine.mock_connector("alpha").unwrap();
    alpha.inject_open_order("resting-1", "BTC/USDT");
    alpha.inject_open_order("resting-2", "BTC/USDT");

    let started = std::time::Instant::now();
    engine.emergency_stop().await;
    assert!(started.elapsed() < Duration::from_secs(10));

    // No order is left Pending or Open anywhere.
    use arbot::connectors::ExchangeClient;
    let open = alpha.open_orders().await.unwrap();
    assert!(open.is_empty(), "orders still open: {open:?}");

    let marker = std::fs::read_to_string(dir.path().join("shutdown.json")).unwrap();
    assert!(marker.contains("emergency_stop"));
    assert!(marker.contains("\"cancelled_orders\": 2"));
}
