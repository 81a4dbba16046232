// src/detector/mod.rs
//
// Detector plumbing. The signal queue is the detector -> risk handoff:
// bounded, FIFO per detector, and on overflow it drops the oldest
// un-consumed signal for the same (strategy, symbol) -- arbitrage
// freshness outweighs history.

pub mod spatial;
pub mod spread;
pub mod triangular;

pub use spatial::SpatialDetector;
pub use triangular::{validate_paths, TriangularDetector};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::types::Signal;

pub struct SignalQueue {
    inner: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

struct QueueState {
    deque: VecDeque<Signal>,
    closed: bool,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                deque: VecDeque::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a signal. On overflow the oldest signal with the same
    /// (strategy, symbol) is dropped first; with no such entry, the oldest
    /// signal overall goes.
    pub fn push(&self, signal: Signal) {
        {
            let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if state.closed {
                return;
            }
            if state.deque.len() >= self.capacity {
                let key = (signal.strategy, signal.symbol.clone());
                let victim = state
                    .deque
                    .iter()
                    .position(|s| (s.strategy, s.symbol.as_str()) == (key.0, key.1.as_str()))
                    .unwrap_or(0);
                let _ = state.deque.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.deque.push_back(signal);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next signal in emission order. Returns `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<Signal> {
        loop {
            {
                let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(signal) = state.deque.pop_front() {
                    return Some(signal);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Signal> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .deque
            .pop_front()
    }

    pub fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .deque
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Strategy, TimestampMs};
    use rust_decimal::Decimal;

    fn signal(id: u64, strategy: Strategy, symbol: &str, ts: TimestampMs) -> Signal {
        Signal {
            id,
            strategy,
            symbol: symbol.to_string(),
            legs: Vec::new(),
            gross_spread_pct: Decimal::ZERO,
            net_spread_pct: Decimal::ZERO,
            estimated_pnl_usd: Decimal::ZERO,
            notional_usd: Decimal::ZERO,
            confidence: 0.0,
            detected_ts: ts,
        }
    }

    #[test]
    fn overflow_drops_oldest_for_same_key() {
        let queue = SignalQueue::new(3);
        queue.push(signal(1, Strategy::Spatial, "BTC/USDT", 1));
        queue.push(signal(2, Strategy::Spatial, "ETH/USDT", 2));
        queue.push(signal(3, Strategy::Spatial, "BTC/USDT", 3));
        // Full; new BTC/USDT entry evicts signal 1, not signal 2.
        queue.push(signal(4, Strategy::Spatial, "BTC/USDT", 4));
        let ids: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn overflow_without_key_match_drops_oldest_overall() {
        let queue = SignalQueue::new(2);
        queue.push(signal(1, Strategy::Spatial, "BTC/USDT", 1));
        queue.push(signal(2, Strategy::Spatial, "ETH/USDT", 2));
        queue.push(signal(3, Strategy::Triangular, "SOL/USDT", 3));
        let ids: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn pop_preserves_emission_order_and_close_drains() {
        let queue = SignalQueue::new(8);
        queue.push(signal(1, Strategy::Spatial, "BTC/USDT", 1));
        queue.push(signal(2, Strategy::Spatial, "BTC/USDT", 2));
        queue.close();
        assert_eq!(queue.pop().await.unwrap().id, 1);
        assert_eq!(queue.pop().await.unwrap().id, 2);
        assert!(queue.pop().await.is_none());
    }
}
