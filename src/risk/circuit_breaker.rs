// src/risk/circuit_breaker.rs
//
// Consecutive-loss circuit breaker. Normal -> Tripped when the closed-loss
// streak reaches the limit; Tripped -> Normal when the cooldown elapses or
// an operator resets it. While Tripped only cancellations are allowed.

use serde::Serialize;

use crate::types::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Normal,
    Tripped,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    loss_limit: u32,
    cooldown_ms: i64,
    consecutive_losses: u32,
    state: BreakerState,
    cooldown_until: Option<TimestampMs>,
}

impl CircuitBreaker {
    pub fn new(loss_limit: u32, cooldown_minutes: i64) -> Self {
        Self {
            loss_limit: loss_limit.max(1),
            cooldown_ms: cooldown_minutes.max(0) * 60_000,
            consecutive_losses: 0,
            state: BreakerState::Normal,
            cooldown_until: None,
        }
    }

    /// Current state, applying cooldown expiry as a side effect.
    pub fn state(&mut self, now_ms: TimestampMs) -> BreakerState {
        if self.state == BreakerState::Tripped {
            if let Some(until) = self.cooldown_until {
                if now_ms >= until {
                    self.reset();
                }
            }
        }
        self.state
    }

    pub fn is_tripped(&mut self, now_ms: TimestampMs) -> bool {
        self.state(now_ms) == BreakerState::Tripped
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn cooldown_until(&self) -> Option<TimestampMs> {
        self.cooldown_until
    }

    /// Record a closed trade. Returns true when this loss trips the breaker.
    pub fn record_close(&mut self, counts_as_loss: bool, now_ms: TimestampMs) -> bool {
        if self.state(now_ms) == BreakerState::Tripped {
            // Streak accounting is frozen while tripped.
            return false;
        }
        if !counts_as_loss {
            self.consecutive_losses = 0;
            return false;
        }
        self.consecutive_losses += 1;
        if self.consecutive_losses >= self.loss_limit {
            self.state = BreakerState::Tripped;
            self.cooldown_until = Some(now_ms + self.cooldown_ms);
            return true;
        }
        false
    }

    /// Operator reset back to Normal.
    pub fn reset(&mut self) {
        self.state = BreakerState::Normal;
        self.consecutive_losses = 0;
        self.cooldown_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_at_exact_limit_and_cooldown_expires() {
        let mut breaker = CircuitBreaker::new(3, 30);
        assert!(!breaker.record_close(true, 1_000));
        assert!(!breaker.record_close(true, 2_000));
        // Exactly at the limit: trip.
        assert!(breaker.record_close(true, 3_000));
        assert!(breaker.is_tripped(3_001));
        assert_eq!(breaker.cooldown_until(), Some(3_000 + 30 * 60_000));
        // One ms before cooldown expiry: still tripped.
        assert!(breaker.is_tripped(3_000 + 30 * 60_000 - 1));
        // Expiry resets the counter and resumes.
        assert!(!breaker.is_tripped(3_000 + 30 * 60_000));
        assert_eq!(breaker.consecutive_losses(), 0);
    }

    #[test]
    fn win_resets_streak() {
        let mut breaker = CircuitBreaker::new(3, 30);
        breaker.record_close(true, 1);
        breaker.record_close(true, 2);
        breaker.record_close(false, 3);
        breaker.record_close(true, 4);
        assert_eq!(breaker.consecutive_losses(), 1);
        assert!(!breaker.is_tripped(5));
    }

    #[test]
    fn operator_reset_clears_trip() {
        let mut breaker = CircuitBreaker::new(1, 30);
        assert!(breaker.record_close(true, 1_000));
        assert!(breaker.is_tripped(1_001));
        breaker.reset();
        assert!(!breaker.is_tripped(1_002));
    }

    #[test]
    fn losses_while_tripped_do_not_extend() {
        let mut breaker = CircuitBreaker::new(1, 1);
        breaker.record_close(true, 0);
        let until = breaker.cooldown_until().unwrap();
        breaker.record_close(true, 10);
        assert_eq!(breaker.cooldown_until(), Some(until));
    }
}
