// src/alerts.rs
//
// Operator alerts with per-category throttling. Identical categories
// inside the throttle window are coalesced into a suppressed-count that
// is flushed with the next emitted alert.

use std::collections::HashMap;

use crate::types::TimestampMs;

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub category: &'static str,
    pub message: String,
    pub ts: TimestampMs,
    /// How many identical alerts were coalesced since the last emission.
    pub suppressed: u64,
}

struct CategoryState {
    last_emitted: TimestampMs,
    suppressed: u64,
}

pub struct AlertManager {
    window_ms: i64,
    categories: HashMap<&'static str, CategoryState>,
    emitted: Vec<Alert>,
}

impl AlertManager {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(0),
            categories: HashMap::new(),
            emitted: Vec::new(),
        }
    }

    /// Raise an alert. Returns the alert when it passed the throttle.
    pub fn raise(
        &mut self,
        category: &'static str,
        message: impl Into<String>,
        now_ms: TimestampMs,
    ) -> Option<Alert> {
        let state = self.categories.entry(category).or_insert(CategoryState {
            last_emitted: i64::MIN / 2,
            suppressed: 0,
        });
        if now_ms - state.last_emitted < self.window_ms {
            state.suppressed += 1;
            return None;
        }
        let alert = Alert {
            category,
            message: message.into(),
            ts: now_ms,
            suppressed: state.suppressed,
        };
        state.last_emitted = now_ms;
        state.suppressed = 0;
        if alert.suppressed > 0 {
            eprintln!(
                "WARN: alert category={} suppressed={} msg={}",
                alert.category, alert.suppressed, alert.message
            );
        } else {
            eprintln!("WARN: alert category={} msg={}", alert.category, alert.message);
        }
        self.emitted.push(alert.clone());
        Some(alert)
    }

    /// Alerts emitted so far (for the control surface / tests).
    pub fn emitted(&self) -> &[Alert] {
        &self.emitted
    }
}
