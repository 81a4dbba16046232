// src/orderbook.rs
//
// Canonical L2 order book. Connectors normalize exchange payloads into this
// form: snapshots replace the book, deltas apply level-by-level under a
// sequence check, and a detected gap tells the connector to resync.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Incremental change to one level. `qty == 0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub side: BookSide,
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BookError {
    SeqOutOfOrder { last_seq: u64, incoming_seq: u64 },
    SeqGap { last_seq: u64, incoming_seq: u64 },
    InvalidPrice { price: Decimal },
    InvalidQty { qty: Decimal },
    /// best_bid >= best_ask after normalization. Invariant violation:
    /// fatal in live mode, logged in paper.
    CrossedBook { best_bid: Decimal, best_ask: Decimal },
}

impl std::fmt::Display for BookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookError::SeqOutOfOrder { last_seq, incoming_seq } => {
                write!(f, "seq out of order: last={last_seq} incoming={incoming_seq}")
            }
            BookError::SeqGap { last_seq, incoming_seq } => {
                write!(f, "seq gap: last={last_seq} incoming={incoming_seq}")
            }
            BookError::InvalidPrice { price } => write!(f, "invalid price: {price}"),
            BookError::InvalidQty { qty } => write!(f, "invalid qty: {qty}"),
            BookError::CrossedBook { best_bid, best_ask } => {
                write!(f, "crossed book: bid={best_bid} ask={best_ask}")
            }
        }
    }
}

impl std::error::Error for BookError {}

/// Best bid/ask with sizes, derived from a book snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopOfBook {
    pub exchange: String,
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_bid_qty: Decimal,
    pub best_ask: Decimal,
    pub best_ask_qty: Decimal,
    pub event_ts: TimestampMs,
    pub ingress_ts: TimestampMs,
}

impl TopOfBook {
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::TWO
    }

    /// Spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> Decimal {
        let mid = self.mid();
        if mid <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / mid * Decimal::ONE_HUNDRED
    }
}

/// Exchange order book with bids descending and asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub exchange: String,
    pub symbol: String,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    last_seq: u64,
    pub event_ts: TimestampMs,
    pub ingress_ts: TimestampMs,
}

impl OrderBook {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_seq: 0,
            event_ts: 0,
            ingress_ts: 0,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    /// Replace the book from a full snapshot. Re-applying the snapshot with
    /// the same sequence number leaves the state unchanged; only a sequence
    /// regression is rejected.
    pub fn apply_snapshot(
        &mut self,
        bids: &[BookLevel],
        asks: &[BookLevel],
        seq: u64,
        event_ts: TimestampMs,
        ingress_ts: TimestampMs,
    ) -> Result<(), BookError> {
        if seq < self.last_seq {
            return Err(BookError::SeqOutOfOrder {
                last_seq: self.last_seq,
                incoming_seq: seq,
            });
        }
        let bids = validate_and_sort(bids, true)?;
        let asks = validate_and_sort(asks, false)?;
        check_uncrossed(&bids, &asks)?;
        self.bids = bids;
        self.asks = asks;
        self.last_seq = seq;
        self.event_ts = event_ts;
        self.ingress_ts = ingress_ts;
        Ok(())
    }

    /// Apply incremental level changes. The sequence must be exactly
    /// `last_seq + 1`; a gap means the connector must resync.
    pub fn apply_delta(
        &mut self,
        deltas: &[BookDelta],
        seq: u64,
        event_ts: TimestampMs,
        ingress_ts: TimestampMs,
    ) -> Result<(), BookError> {
        if seq <= self.last_seq {
            return Err(BookError::SeqOutOfOrder {
                last_seq: self.last_seq,
                incoming_seq: seq,
            });
        }
        if seq != self.last_seq + 1 {
            return Err(BookError::SeqGap {
                last_seq: self.last_seq,
                incoming_seq: seq,
            });
        }
        for delta in deltas {
            if delta.price <= Decimal::ZERO {
                return Err(BookError::InvalidPrice { price: delta.price });
            }
            if delta.qty < Decimal::ZERO {
                return Err(BookError::InvalidQty { qty: delta.qty });
            }
            match delta.side {
                BookSide::Bid => apply_delta_to_levels(&mut self.bids, delta, true),
                BookSide::Ask => apply_delta_to_levels(&mut self.asks, delta, false),
            }
        }
        check_uncrossed(&self.bids, &self.asks)?;
        self.last_seq = seq;
        self.event_ts = event_ts;
        self.ingress_ts = ingress_ts;
        Ok(())
    }

    /// Drop local state ahead of a resync.
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_seq = 0;
    }

    pub fn trim_levels(&mut self, max_levels: usize) {
        self.bids.truncate(max_levels);
        self.asks.truncate(max_levels);
    }

    pub fn top_of_book(&self) -> Option<TopOfBook> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some(TopOfBook {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            best_bid: bid.price,
            best_bid_qty: bid.qty,
            best_ask: ask.price,
            best_ask_qty: ask.qty,
            event_ts: self.event_ts,
            ingress_ts: self.ingress_ts,
        })
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }

    fn levels(&self, side: BookSide) -> &[BookLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    /// Total quote-denominated depth on a side.
    pub fn depth_quote(&self, side: BookSide) -> Decimal {
        self.levels(side)
            .iter()
            .map(|l| l.price * l.qty)
            .sum()
    }

    /// Quote-denominated depth at prices at or better than `limit`.
    /// "Better" means <= limit for asks (a buyer) and >= limit for bids.
    pub fn depth_quote_within(&self, side: BookSide, limit: Decimal) -> Decimal {
        self.levels(side)
            .iter()
            .take_while(|l| match side {
                BookSide::Ask => l.price <= limit,
                BookSide::Bid => l.price >= limit,
            })
            .map(|l| l.price * l.qty)
            .sum()
    }

    /// Volume-weighted average price for consuming up to `notional` of quote
    /// from a side. Returns `None` on an empty book or non-positive notional.
    pub fn effective_price(&self, side: BookSide, notional: Decimal) -> Option<Decimal> {
        if notional <= Decimal::ZERO {
            return None;
        }
        let mut remaining = notional;
        let mut total_qty = Decimal::ZERO;
        let mut total_cost = Decimal::ZERO;
        let mut levels_used = 0usize;
        let mut last_price = Decimal::ZERO;
        for level in self.levels(side) {
            let level_notional = level.price * level.qty;
            levels_used += 1;
            last_price = level.price;
            if level_notional <= remaining {
                total_qty += level.qty;
                total_cost += level_notional;
                remaining -= level_notional;
                if remaining.is_zero() {
                    break;
                }
            } else {
                let partial_qty = remaining / level.price;
                total_qty += partial_qty;
                total_cost += remaining;
                remaining = Decimal::ZERO;
                break;
            }
        }
        if total_qty <= Decimal::ZERO {
            return None;
        }
        // A single consumed level executes at that level's price; skipping
        // the division keeps the result exact.
        if levels_used == 1 {
            return Some(last_price);
        }
        Some(total_cost / total_qty)
    }

    /// Walk a side for up to `qty` of base asset, honoring an optional limit
    /// price. Returns (filled_qty, vwap); the fill is partial when depth at
    /// acceptable prices runs out.
    pub fn walk_qty(
        &self,
        side: BookSide,
        qty: Decimal,
        limit: Option<Decimal>,
    ) -> (Decimal, Decimal) {
        let mut remaining = qty;
        let mut filled = Decimal::ZERO;
        let mut cost = Decimal::ZERO;
        let mut levels_used = 0usize;
        let mut last_price = Decimal::ZERO;
        for level in self.levels(side) {
            if remaining <= Decimal::ZERO {
                break;
            }
            let acceptable = match (side, limit) {
                (_, None) => true,
                (BookSide::Ask, Some(lim)) => level.price <= lim,
                (BookSide::Bid, Some(lim)) => level.price >= lim,
            };
            if !acceptable {
                break;
            }
            let take = remaining.min(level.qty);
            filled += take;
            cost += take * level.price;
            remaining -= take;
            levels_used += 1;
            last_price = level.price;
        }
        let vwap = if filled <= Decimal::ZERO {
            Decimal::ZERO
        } else if levels_used == 1 {
            last_price
        } else {
            cost / filled
        };
        (filled, vwap)
    }
}

fn validate_and_sort(levels: &[BookLevel], is_bid: bool) -> Result<Vec<BookLevel>, BookError> {
    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        if level.price <= Decimal::ZERO {
            return Err(BookError::InvalidPrice { price: level.price });
        }
        if level.qty < Decimal::ZERO {
            return Err(BookError::InvalidQty { qty: level.qty });
        }
        if level.qty.is_zero() {
            continue;
        }
        out.push(*level);
    }
    if is_bid {
        out.sort_by(|a, b| b.price.cmp(&a.price));
    } else {
        out.sort_by(|a, b| a.price.cmp(&b.price));
    }
    Ok(out)
}

fn check_uncrossed(bids: &[BookLevel], asks: &[BookLevel]) -> Result<(), BookError> {
    if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
        if bid.price >= ask.price {
            return Err(BookError::CrossedBook {
                best_bid: bid.price,
                best_ask: ask.price,
            });
        }
    }
    Ok(())
}

fn apply_delta_to_levels(levels: &mut Vec<BookLevel>, delta: &BookDelta, is_bid: bool) {
    if delta.qty.is_zero() {
        if let Some(pos) = levels.iter().position(|l| l.price == delta.price) {
            levels.remove(pos);
        }
        return;
    }
    if let Some(level) = levels.iter_mut().find(|l| l.price == delta.price) {
        level.qty = delta.qty;
        return;
    }
    levels.push(BookLevel {
        price: delta.price,
        qty: delta.qty,
    });
    if is_bid {
        levels.sort_by(|a, b| b.price.cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.cmp(&b.price));
    }
}
