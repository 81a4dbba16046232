// src/market_state.rs
//
// Process-wide market view. Connectors publish immutable book snapshots
// keyed by (exchange, symbol); readers clone Arcs and never block writers.
// Staleness is a property of the read, not the write: a snapshot past the
// freshness window is reported as absent.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::orderbook::OrderBook;
use crate::types::{TimestampMs, TradePrint};

const SHARD_COUNT: usize = 16;
const TRADE_RING_CAP: usize = 128;

/// Notification that a (exchange, symbol) key changed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub exchange: String,
    pub symbol: String,
    pub version: u64,
}

/// Read-time freshness policy.
#[derive(Debug, Clone, Copy)]
pub struct Freshness {
    pub now_ms: TimestampMs,
    pub stale_threshold_ms: i64,
    pub max_latency_ms: i64,
}

impl Freshness {
    pub fn accepts(&self, book: &OrderBook) -> bool {
        if self.now_ms.saturating_sub(book.event_ts) > self.stale_threshold_ms {
            return false;
        }
        if self.now_ms.saturating_sub(book.ingress_ts) > self.max_latency_ms {
            return false;
        }
        true
    }
}

struct Entry {
    book: Arc<OrderBook>,
    version: u64,
    trades: VecDeque<TradePrint>,
}

type Shard = RwLock<HashMap<(String, String), Entry>>;

pub struct MarketState {
    shards: Vec<Shard>,
    change_tx: broadcast::Sender<ChangeEvent>,
    version_counter: AtomicU64,
}

impl MarketState {
    pub fn new(change_capacity: usize) -> Self {
        let (change_tx, _) = broadcast::channel(change_capacity.max(1));
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            change_tx,
            version_counter: AtomicU64::new(0),
        }
    }

    fn shard(&self, exchange: &str, symbol: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        exchange.hash(&mut hasher);
        symbol.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Publish a normalized book snapshot. Only the owning connector writes
    /// a given key. Returns the new version for the key.
    pub fn publish_book(&self, book: Arc<OrderBook>) -> u64 {
        let version = self.version_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (book.exchange.clone(), book.symbol.clone());
        let event = ChangeEvent {
            exchange: key.0.clone(),
            symbol: key.1.clone(),
            version,
        };
        {
            let mut shard = self
                .shard(&key.0, &key.1)
                .write()
                .unwrap_or_else(|p| p.into_inner());
            let entry = shard.entry(key).or_insert_with(|| Entry {
                book: book.clone(),
                version,
                trades: VecDeque::new(),
            });
            entry.book = book;
            entry.version = version;
        }
        // No receivers is fine; detectors may not have subscribed yet.
        let _ = self.change_tx.send(event);
        version
    }

    pub fn publish_trade(&self, trade: TradePrint) {
        let key = (trade.exchange.clone(), trade.symbol.clone());
        let mut shard = self
            .shard(&key.0, &key.1)
            .write()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = shard.get_mut(&key) {
            if entry.trades.len() >= TRADE_RING_CAP {
                entry.trades.pop_front();
            }
            entry.trades.push_back(trade);
        }
    }

    /// Point-in-time snapshot with its version, ignoring freshness.
    pub fn snapshot(&self, exchange: &str, symbol: &str) -> Option<(Arc<OrderBook>, u64)> {
        let shard = self
            .shard(exchange, symbol)
            .read()
            .unwrap_or_else(|p| p.into_inner());
        shard
            .get(&(exchange.to_string(), symbol.to_string()))
            .map(|e| (e.book.clone(), e.version))
    }

    /// Snapshot filtered through the freshness policy.
    pub fn fresh_snapshot(
        &self,
        exchange: &str,
        symbol: &str,
        freshness: Freshness,
    ) -> Option<Arc<OrderBook>> {
        let (book, _) = self.snapshot(exchange, symbol)?;
        freshness.accepts(&book).then_some(book)
    }

    /// All fresh books for one symbol across exchanges.
    pub fn fresh_books_for_symbol(
        &self,
        symbol: &str,
        freshness: Freshness,
    ) -> Vec<Arc<OrderBook>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap_or_else(|p| p.into_inner());
            for ((_, sym), entry) in guard.iter() {
                if sym == symbol && freshness.accepts(&entry.book) {
                    out.push(entry.book.clone());
                }
            }
        }
        out.sort_by(|a, b| a.exchange.cmp(&b.exchange));
        out
    }

    /// All fresh books on one exchange, keyed by symbol.
    pub fn fresh_books_on_exchange(
        &self,
        exchange: &str,
        freshness: Freshness,
    ) -> HashMap<String, Arc<OrderBook>> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap_or_else(|p| p.into_inner());
            for ((ex, sym), entry) in guard.iter() {
                if ex == exchange && freshness.accepts(&entry.book) {
                    out.insert(sym.clone(), entry.book.clone());
                }
            }
        }
        out
    }

    /// Trade prints for a key with `ts >= since_ts`, oldest first.
    pub fn recent_trades(
        &self,
        exchange: &str,
        symbol: &str,
        since_ts: TimestampMs,
    ) -> Vec<TradePrint> {
        let shard = self
            .shard(exchange, symbol)
            .read()
            .unwrap_or_else(|p| p.into_inner());
        shard
            .get(&(exchange.to_string(), symbol.to_string()))
            .map(|e| {
                e.trades
                    .iter()
                    .filter(|t| t.event_ts >= since_ts)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::BookLevel;
    use rust_decimal_macros::dec;

    fn book(exchange: &str, symbol: &str, event_ts: i64, ingress_ts: i64) -> Arc<OrderBook> {
        let mut b = OrderBook::new(exchange, symbol);
        b.apply_snapshot(
            &[BookLevel { price: dec!(100), qty: dec!(1) }],
            &[BookLevel { price: dec!(101), qty: dec!(1) }],
            1,
            event_ts,
            ingress_ts,
        )
        .unwrap();
        Arc::new(b)
    }

    #[test]
    fn publish_bumps_version_and_notifies() {
        let state = MarketState::new(16);
        let mut rx = state.subscribe();
        let v1 = state.publish_book(book("binance", "BTC/USDT", 1_000, 1_000));
        let v2 = state.publish_book(book("binance", "BTC/USDT", 2_000, 2_000));
        assert!(v2 > v1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.exchange, "binance");
        assert_eq!(ev.version, v1);
        let (snap, version) = state.snapshot("binance", "BTC/USDT").unwrap();
        assert_eq!(version, v2);
        assert_eq!(snap.event_ts, 2_000);
    }

    #[test]
    fn staleness_is_evaluated_at_read_time() {
        let state = MarketState::new(16);
        state.publish_book(book("binance", "BTC/USDT", 1_000, 1_000));
        let fresh = Freshness {
            now_ms: 2_000,
            stale_threshold_ms: 30_000,
            max_latency_ms: 5_000,
        };
        assert!(state.fresh_snapshot("binance", "BTC/USDT", fresh).is_some());
        // Same stored value, later read: now stale.
        let late = Freshness {
            now_ms: 40_000,
            stale_threshold_ms: 30_000,
            max_latency_ms: 5_000,
        };
        assert!(state.fresh_snapshot("binance", "BTC/USDT", late).is_none());
    }

    #[test]
    fn symbol_scan_filters_stale_exchanges() {
        let state = MarketState::new(16);
        state.publish_book(book("binance", "BTC/USDT", 35_000, 35_000));
        state.publish_book(book("bybit", "BTC/USDT", 1_000, 1_000));
        let freshness = Freshness {
            now_ms: 36_000,
            stale_threshold_ms: 30_000,
            max_latency_ms: 30_000,
        };
        let books = state.fresh_books_for_symbol("BTC/USDT", freshness);
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].exchange, "binance");
    }

    #[test]
    fn trade_ring_filters_by_ts() {
        let state = MarketState::new(16);
        state.publish_book(book("binance", "BTC/USDT", 1_000, 1_000));
        for ts in [100, 200, 300] {
            state.publish_trade(TradePrint {
                exchange: "binance".to_string(),
                symbol: "BTC/USDT".to_string(),
                side: crate::types::Side::Buy,
                price: dec!(100),
                qty: dec!(1),
                event_ts: ts,
                ingress_ts: ts,
            });
        }
        assert_eq!(state.recent_trades("binance", "BTC/USDT", 200).len(), 2);
    }
}
