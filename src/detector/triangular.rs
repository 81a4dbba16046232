// src/detector/triangular.rs
//
// Single-exchange triangular detector. Paths are declared in config as
// three pairs; at startup each is validated to form a closed cycle (three
// assets, each appearing in exactly two pairs) and ambiguous or open paths
// are rejected. Detection simulates both traversal directions with best
// ask/bid rates net of the taker fee at each hop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::config::Config;
use crate::market_state::{Freshness, MarketState};
use crate::orderbook::OrderBook;
use crate::types::{split_symbol, Side, Signal, SignalLeg, Strategy, TimestampMs};

const START_ASSET_PREFERENCE: [&str; 5] = ["USDT", "USDC", "BUSD", "USD", "DAI"];

/// A validated closed cycle: each hop names its pair and trade side.
#[derive(Debug, Clone, PartialEq)]
pub struct TriPath {
    pub hops: [TriHop; 3],
    pub start_asset: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriHop {
    pub symbol: String,
    pub side: Side,
}

/// Validate the configured paths. Errors name the offending path so a bad
/// config fails at startup, never silently at runtime.
pub fn validate_paths(paths: &[[String; 3]]) -> Result<Vec<Vec<TriPath>>, String> {
    paths.iter().map(|p| validate_path(p)).collect()
}

/// Both traversal directions of one declared path.
fn validate_path(pairs: &[String; 3]) -> Result<Vec<TriPath>, String> {
    let mut asset_count: HashMap<&str, u32> = HashMap::new();
    // (from_asset, to_asset) -> (symbol, side)
    let mut edges: HashMap<(&str, &str), (&str, Side)> = HashMap::new();
    for symbol in pairs {
        let (base, quote) = split_symbol(symbol)
            .ok_or_else(|| format!("triangular path pair is not BASE/QUOTE: {symbol}"))?;
        *asset_count.entry(base).or_insert(0) += 1;
        *asset_count.entry(quote).or_insert(0) += 1;
        edges.insert((quote, base), (symbol, Side::Buy));
        edges.insert((base, quote), (symbol, Side::Sell));
    }
    if asset_count.len() != 3 || asset_count.values().any(|c| *c != 2) {
        return Err(format!(
            "triangular path is not a closed 3-asset cycle: {pairs:?}"
        ));
    }

    let start = START_ASSET_PREFERENCE
        .iter()
        .find(|a| asset_count.contains_key(**a))
        .copied()
        .unwrap_or_else(|| {
            let mut assets: Vec<&str> = asset_count.keys().copied().collect();
            assets.sort();
            assets[0]
        });

    let mut others: Vec<&str> = asset_count.keys().copied().filter(|a| *a != start).collect();
    others.sort();

    let mut cycles = Vec::new();
    for &mid in &others {
        let end = others.iter().copied().find(|a| *a != mid).unwrap_or(mid);
        let (Some(leg1), Some(leg2), Some(leg3)) = (
            edges.get(&(start, mid)),
            edges.get(&(mid, end)),
            edges.get(&(end, start)),
        ) else {
            continue;
        };
        cycles.push(TriPath {
            hops: [
                TriHop { symbol: leg1.0.to_string(), side: leg1.1 },
                TriHop { symbol: leg2.0.to_string(), side: leg2.1 },
                TriHop { symbol: leg3.0.to_string(), side: leg3.1 },
            ],
            start_asset: start.to_string(),
        });
    }
    if cycles.is_empty() {
        return Err(format!("triangular path has no traversable cycle: {pairs:?}"));
    }
    Ok(cycles)
}

struct CycleResult {
    final_amount: Decimal,
    min_depth_usd: Decimal,
    legs: Vec<SignalLeg>,
}

#[derive(Debug)]
pub struct TriangularDetector {
    signal_ids: Arc<AtomicU64>,
    /// Validated cycles per declared path.
    paths: Vec<Vec<TriPath>>,
}

impl TriangularDetector {
    pub fn new(signal_ids: Arc<AtomicU64>, cfg: &Config) -> Result<Self, String> {
        Ok(Self {
            signal_ids,
            paths: validate_paths(&cfg.triangular.paths)?,
        })
    }

    /// Scan all configured paths on one exchange.
    pub fn detect(
        &mut self,
        cfg: &Config,
        state: &MarketState,
        exchange: &str,
        now_ms: TimestampMs,
    ) -> Vec<Signal> {
        if !cfg.triangular.enabled || self.paths.is_empty() {
            return Vec::new();
        }
        let freshness = Freshness {
            now_ms,
            stale_threshold_ms: cfg.risk.stale_threshold_seconds * 1_000,
            max_latency_ms: cfg.spatial.max_latency_ms,
        };
        let books = state.fresh_books_on_exchange(exchange, freshness);
        if books.is_empty() {
            return Vec::new();
        }
        let taker_fee = cfg.taker_fee_pct(exchange);
        let start_notional = cfg
            .risk
            .max_position_per_coin_usd
            .min(cfg.spatial.min_depth_usd * Decimal::TEN);
        if start_notional <= Decimal::ZERO {
            return Vec::new();
        }

        let mut signals = Vec::new();
        for cycles in &self.paths {
            let mut best: Option<CycleResult> = None;
            for cycle in cycles {
                let Some(result) =
                    simulate_cycle(cycle, &books, exchange, taker_fee, start_notional)
                else {
                    continue;
                };
                if best
                    .as_ref()
                    .map_or(true, |b| result.final_amount > b.final_amount)
                {
                    best = Some(result);
                }
            }
            let Some(result) = best else { continue };
            let net_pct = (result.final_amount / start_notional - Decimal::ONE)
                * Decimal::ONE_HUNDRED;
            if net_pct < cfg.triangular.min_profit_pct {
                continue;
            }
            let profit_usd = result.final_amount - start_notional;
            if profit_usd <= Decimal::ZERO {
                continue;
            }
            let gross_pct = net_pct + taker_fee * Decimal::from(3);
            let symbol = result.legs[0].symbol.clone();
            signals.push(Signal {
                id: self.signal_ids.fetch_add(1, Ordering::Relaxed) + 1,
                strategy: Strategy::Triangular,
                symbol,
                legs: result.legs,
                gross_spread_pct: gross_pct,
                net_spread_pct: net_pct,
                estimated_pnl_usd: profit_usd,
                notional_usd: start_notional,
                confidence: crate::detector::spread::confidence(
                    net_pct,
                    cfg.triangular.min_profit_pct,
                    result.min_depth_usd,
                    start_notional,
                ),
                detected_ts: now_ms,
            });
        }
        signals.sort_by(|a, b| b.net_spread_pct.cmp(&a.net_spread_pct));
        signals
    }
}

/// Walk one cycle direction: buys consume best ask, sells best bid, taker
/// fee applied at each hop. `None` when a book is missing or degenerate.
fn simulate_cycle(
    cycle: &TriPath,
    books: &HashMap<String, Arc<OrderBook>>,
    exchange: &str,
    taker_fee_pct: Decimal,
    start_notional: Decimal,
) -> Option<CycleResult> {
    let fee_keep = Decimal::ONE - taker_fee_pct / Decimal::ONE_HUNDRED;
    let mut amount = start_notional;
    let mut min_depth = Decimal::MAX;
    let mut legs = Vec::with_capacity(3);

    for hop in &cycle.hops {
        let book = books.get(&hop.symbol)?;
        match hop.side {
            Side::Buy => {
                let ask = book.best_ask()?;
                if ask.price <= Decimal::ZERO {
                    return None;
                }
                let qty = amount / ask.price;
                legs.push(SignalLeg {
                    exchange: exchange.to_string(),
                    symbol: hop.symbol.clone(),
                    side: Side::Buy,
                    target_price: ask.price,
                    max_qty: qty,
                });
                amount = qty * fee_keep;
                min_depth = min_depth.min(book.depth_quote(crate::orderbook::BookSide::Ask));
            }
            Side::Sell => {
                let bid = book.best_bid()?;
                if bid.price <= Decimal::ZERO {
                    return None;
                }
                legs.push(SignalLeg {
                    exchange: exchange.to_string(),
                    symbol: hop.symbol.clone(),
                    side: Side::Sell,
                    target_price: bid.price,
                    max_qty: amount,
                });
                amount = amount * bid.price * fee_keep;
                min_depth = min_depth.min(book.depth_quote(crate::orderbook::BookSide::Bid));
            }
        }
    }

    Some(CycleResult {
        final_amount: amount,
        min_depth_usd: if min_depth == Decimal::MAX {
            Decimal::ZERO
        } else {
            min_depth
        },
        legs,
    })
}
