//! Arbot core library.
//!
//! Cross-exchange arbitrage engine: per-exchange websocket connectors fan
//! into a versioned in-memory market view, spatial and triangular detectors
//! emit signals, a four-stage risk gate filters them, and a paper or live
//! executor submits both legs and reconciles fills into the ledger.
//!
//! # Architecture
//!
//! The pipeline is staged and message-driven:
//!
//! - **Connectors** (`connectors`): one per exchange; normalize feeds into
//!   the canonical order book, stamp ingress times, and publish snapshots.
//!   REST calls go through per-exchange rate limiters.
//!
//! - **Market state** (`market_state`): sharded snapshot store with
//!   per-key versions and read-time staleness.
//!
//! - **Detectors** (`detector`): spatial (cross-exchange) and triangular
//!   (single-exchange cycles), handing signals to risk through a bounded
//!   drop-oldest queue.
//!
//! - **Risk** (`risk`): position limits, drawdown, anomaly checks, and the
//!   consecutive-loss circuit breaker, applied serially per signal.
//!
//! - **Execution** (`execution`): paper (book-walking simulation) or live
//!   (concurrent IOC legs, fill dedupe, imbalance hedging), settling into
//!   the `ledger` and the persisted `records`.
//!
//! The binary (`src/main.rs`) is a thin CLI around `engine::Engine`.

pub mod alerts;
pub mod config;
pub mod connectors;
pub mod detector;
pub mod engine;
pub mod execution;
pub mod ledger;
pub mod market_state;
pub mod metrics;
pub mod ops;
pub mod orderbook;
pub mod rate_limit;
pub mod records;
pub mod risk;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::{Config, ConfigHandle};
pub use engine::Engine;
pub use execution::{Executor, LiveExecutor, PaperExecutor, SignalOutcome};
pub use ledger::Ledger;
pub use market_state::MarketState;
pub use orderbook::{BookLevel, OrderBook, TopOfBook};
pub use risk::RiskManager;
pub use types::{ExecutionMode, Signal, SignalStatus, Strategy};
