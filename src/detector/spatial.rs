// src/detector/spatial.rs
//
// Cross-exchange detector. For one symbol and one update cycle it scans all
// ordered fresh (buy, sell) exchange pairs and emits at most one signal:
// the pair with the largest net_spread * min(depth, target_notional).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::detector::spread::{confidence, estimate_spatial};
use crate::market_state::{Freshness, MarketState};
use crate::orderbook::OrderBook;
use crate::types::{Side, Signal, SignalLeg, Strategy, TimestampMs};

pub struct SpatialDetector {
    signal_ids: Arc<AtomicU64>,
    /// (buy_exchange, sell_exchange) -> cooldown expiry.
    pair_cooldowns: HashMap<(String, String), TimestampMs>,
}

impl SpatialDetector {
    pub fn new(signal_ids: Arc<AtomicU64>) -> Self {
        Self {
            signal_ids,
            pair_cooldowns: HashMap::new(),
        }
    }

    /// Put a directed pair on cooldown until `until_ts`.
    pub fn set_pair_cooldown(&mut self, buy: &str, sell: &str, until_ts: TimestampMs) {
        self.pair_cooldowns
            .insert((buy.to_string(), sell.to_string()), until_ts);
    }

    fn pair_on_cooldown(&self, buy: &str, sell: &str, now_ms: TimestampMs) -> bool {
        self.pair_cooldowns
            .get(&(buy.to_string(), sell.to_string()))
            .is_some_and(|until| now_ms < *until)
    }

    /// Scan one symbol. Emits at most one signal per cycle.
    pub fn detect(
        &mut self,
        cfg: &Config,
        state: &MarketState,
        symbol: &str,
        now_ms: TimestampMs,
    ) -> Option<Signal> {
        if !cfg.spatial.enabled {
            return None;
        }
        let freshness = Freshness {
            now_ms,
            stale_threshold_ms: cfg.risk.stale_threshold_seconds * 1_000,
            max_latency_ms: cfg.spatial.max_latency_ms,
        };
        let books = state.fresh_books_for_symbol(symbol, freshness);
        if books.len() < 2 {
            return None;
        }

        let target_notional = cfg
            .risk
            .max_position_per_coin_usd
            .min(cfg.spatial.min_depth_usd * Decimal::TEN);

        let mut best: Option<(Decimal, Signal)> = None;
        for buy_book in &books {
            for sell_book in &books {
                if buy_book.exchange == sell_book.exchange {
                    continue;
                }
                if self.pair_on_cooldown(&buy_book.exchange, &sell_book.exchange, now_ms) {
                    continue;
                }
                let Some(signal) = self.evaluate_pair(
                    cfg,
                    buy_book,
                    sell_book,
                    target_notional,
                    now_ms,
                ) else {
                    continue;
                };
                let depth_cap = target_notional.min(signal.notional_usd);
                let score = signal.net_spread_pct * depth_cap;
                if best.as_ref().is_none_or(|(prev, _)| score > *prev) {
                    best = Some((score, signal));
                }
            }
        }

        let (_, mut signal) = best?;
        signal.id = self.signal_ids.fetch_add(1, Ordering::Relaxed) + 1;
        if cfg.spatial.pair_cooldown_ms > 0 {
            self.set_pair_cooldown(
                signal.buy_exchange(),
                signal.sell_exchange(),
                now_ms + cfg.spatial.pair_cooldown_ms,
            );
        }
        Some(signal)
    }

    fn evaluate_pair(
        &self,
        cfg: &Config,
        buy_book: &OrderBook,
        sell_book: &OrderBook,
        target_notional: Decimal,
        now_ms: TimestampMs,
    ) -> Option<Signal> {
        let buy_fee = cfg.taker_fee_pct(&buy_book.exchange);
        let sell_fee = cfg.taker_fee_pct(&sell_book.exchange);
        let est = estimate_spatial(buy_book, sell_book, buy_fee, sell_fee, target_notional)?;

        if est.net_spread_pct < cfg.spatial.min_spread_pct {
            return None;
        }
        if est.available_depth_usd < cfg.spatial.min_depth_usd {
            return None;
        }

        // Shrink to the shallower side when depth does not cover the target.
        let notional = target_notional.min(est.available_depth_usd);
        if notional <= Decimal::ZERO
            || est.buy_effective_price <= Decimal::ZERO
            || est.sell_effective_price <= Decimal::ZERO
        {
            return None;
        }
        let estimated_pnl = est.net_spread_pct / Decimal::ONE_HUNDRED * notional;

        let legs = vec![
            SignalLeg {
                exchange: buy_book.exchange.clone(),
                symbol: buy_book.symbol.clone(),
                side: Side::Buy,
                target_price: est.buy_effective_price,
                max_qty: notional / est.buy_effective_price,
            },
            SignalLeg {
                exchange: sell_book.exchange.clone(),
                symbol: sell_book.symbol.clone(),
                side: Side::Sell,
                target_price: est.sell_effective_price,
                max_qty: notional / est.sell_effective_price,
            },
        ];

        Some(Signal {
            id: 0,
            strategy: Strategy::Spatial,
            symbol: buy_book.symbol.clone(),
            legs,
            gross_spread_pct: est.gross_spread_pct,
            net_spread_pct: est.net_spread_pct,
            estimated_pnl_usd: estimated_pnl,
            notional_usd: notional,
            confidence: confidence(
                est.net_spread_pct,
                cfg.spatial.min_spread_pct,
                est.available_depth_usd,
                target_notional,
            ),
            detected_ts: now_ms,
        })
    }
}
