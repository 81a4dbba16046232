// src/rate_limit.rs
//
// Outbound call limiter, one per exchange. Three quota models: weight
// (rolling-window cost sum), count (cost 1), and token bucket. Exhausted
// callers queue FIFO and block until capacity frees or their deadline fires.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::config::{RateLimitConfig, RateLimitKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitTimeout;

impl std::fmt::Display for RateLimitTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate limiter deadline expired")
    }
}

impl std::error::Error for RateLimitTimeout {}

enum Inner {
    /// Sliding window of (stamp, cost). Count is Weight with cost 1.
    Window {
        limit: u32,
        window: Duration,
        entries: VecDeque<(Instant, u32)>,
    },
    TokenBucket {
        capacity: f64,
        refill_rate: f64,
        tokens: f64,
        last_refill: Instant,
    },
}

impl Inner {
    fn try_consume(&mut self, weight: u32, now: Instant) -> bool {
        match self {
            Inner::Window {
                limit,
                window,
                entries,
            } => {
                while let Some((stamp, _)) = entries.front() {
                    if now.duration_since(*stamp) >= *window {
                        entries.pop_front();
                    } else {
                        break;
                    }
                }
                let used: u32 = entries.iter().map(|(_, w)| *w).sum();
                if used + weight <= *limit {
                    entries.push_back((now, weight));
                    true
                } else {
                    false
                }
            }
            Inner::TokenBucket {
                capacity,
                refill_rate,
                tokens,
                last_refill,
            } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * *refill_rate).min(*capacity);
                *last_refill = now;
                if *tokens >= weight as f64 {
                    *tokens -= weight as f64;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn wait_hint(&self, weight: u32, now: Instant) -> Duration {
        match self {
            Inner::Window { window, entries, .. } => entries
                .front()
                .map(|(stamp, _)| {
                    (*stamp + *window)
                        .saturating_duration_since(now)
                        .max(Duration::from_millis(10))
                })
                .unwrap_or(Duration::from_millis(10)),
            Inner::TokenBucket {
                refill_rate, tokens, ..
            } => {
                let deficit = (weight as f64 - tokens).max(0.0);
                if *refill_rate <= 0.0 {
                    return Duration::from_secs(1);
                }
                Duration::from_secs_f64((deficit / refill_rate).max(0.01))
            }
        }
    }
}

pub struct RateLimiter {
    /// Lined up on by waiters; tokio mutexes wake FIFO.
    queue: AsyncMutex<()>,
    inner: std::sync::Mutex<Inner>,
}

impl RateLimiter {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        let inner = match cfg.kind {
            RateLimitKind::Weight | RateLimitKind::Count => Inner::Window {
                limit: cfg.limit.max(1),
                window: Duration::from_secs_f64(cfg.window_secs.max(0.001)),
                entries: VecDeque::new(),
            },
            RateLimitKind::TokenBucket => Inner::TokenBucket {
                capacity: cfg.capacity.max(1) as f64,
                refill_rate: cfg.refill_rate.max(0.001),
                tokens: cfg.capacity.max(1) as f64,
                last_refill: Instant::now(),
            },
        };
        Self {
            queue: AsyncMutex::new(()),
            inner: std::sync::Mutex::new(inner),
        }
    }

    /// Consume `weight` units, waiting as long as it takes.
    /// Returns how long the caller was held.
    pub async fn acquire(&self, weight: u32) -> Duration {
        let started = Instant::now();
        let _slot = self.queue.lock().await;
        loop {
            let wait = {
                let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                let now = Instant::now();
                if inner.try_consume(weight, now) {
                    return started.elapsed();
                }
                inner.wait_hint(weight, now)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume `weight` units or fail when `deadline` passes first.
    pub async fn acquire_until(
        &self,
        weight: u32,
        deadline: Instant,
    ) -> Result<Duration, RateLimitTimeout> {
        tokio::time::timeout_at(deadline, self.acquire(weight))
            .await
            .map_err(|_| RateLimitTimeout)
    }

    /// Non-blocking attempt, bypassing the FIFO queue.
    pub fn try_acquire(&self, weight: u32) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.try_consume(weight, Instant::now())
    }
}
