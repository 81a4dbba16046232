// src/detector/spread.rs
//
// Spread arithmetic shared by the detectors: gross spread from top of book,
// slippage estimated by walking depth at the target notional, net spread
// after taker fees on both legs.

use rust_decimal::Decimal;

use crate::orderbook::{BookSide, OrderBook};

/// Full profitability estimate for one directed (buy, sell) exchange pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialEstimate {
    pub buy_effective_price: Decimal,
    pub sell_effective_price: Decimal,
    pub gross_spread_pct: Decimal,
    pub slippage_pct: Decimal,
    pub net_spread_pct: Decimal,
    pub estimated_pnl_usd: Decimal,
    /// min over both sides of quote depth at or better than the target price.
    pub available_depth_usd: Decimal,
}

pub fn gross_spread_pct(buy_price: Decimal, sell_price: Decimal) -> Decimal {
    if buy_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (sell_price - buy_price) / buy_price * Decimal::ONE_HUNDRED
}

/// Estimate buying `notional` on `buy_book` asks and selling on `sell_book`
/// bids. Returns `None` when either side is empty or prices are degenerate.
pub fn estimate_spatial(
    buy_book: &OrderBook,
    sell_book: &OrderBook,
    buy_fee_pct: Decimal,
    sell_fee_pct: Decimal,
    notional: Decimal,
) -> Option<SpatialEstimate> {
    let best_ask = buy_book.best_ask()?.price;
    let best_bid = sell_book.best_bid()?.price;
    if best_ask <= Decimal::ZERO || best_bid <= Decimal::ZERO {
        return None;
    }
    let buy_effective = buy_book.effective_price(BookSide::Ask, notional)?;
    let sell_effective = sell_book.effective_price(BookSide::Bid, notional)?;

    let gross = gross_spread_pct(best_ask, best_bid);
    // Slippage: how far the walked prices sit from the touch, both legs.
    let buy_slip = (buy_effective - best_ask) / best_ask * Decimal::ONE_HUNDRED;
    let sell_slip = (best_bid - sell_effective) / best_bid * Decimal::ONE_HUNDRED;
    let slippage = buy_slip.max(Decimal::ZERO) + sell_slip.max(Decimal::ZERO);

    let net = gross - buy_fee_pct - sell_fee_pct - slippage;
    let estimated_pnl = net / Decimal::ONE_HUNDRED * notional;

    let buy_depth = buy_book.depth_quote_within(BookSide::Ask, buy_effective);
    let sell_depth = sell_book.depth_quote_within(BookSide::Bid, sell_effective);

    Some(SpatialEstimate {
        buy_effective_price: buy_effective,
        sell_effective_price: sell_effective,
        gross_spread_pct: gross,
        slippage_pct: slippage,
        net_spread_pct: net,
        estimated_pnl_usd: estimated_pnl,
        available_depth_usd: buy_depth.min(sell_depth),
    })
}

/// Confidence in [0, 1]: how far the spread clears the threshold, blended
/// with how well depth covers the trade size.
pub fn confidence(net_spread_pct: Decimal, min_spread_pct: Decimal, depth_usd: Decimal, notional: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    let spread_ratio = if min_spread_pct > Decimal::ZERO {
        (net_spread_pct / min_spread_pct).to_f64().unwrap_or(0.0)
    } else {
        1.0
    };
    let spread_score = (spread_ratio.min(3.0) / 3.0).max(0.0);
    let depth_ratio = if notional > Decimal::ZERO {
        (depth_usd / notional).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };
    let depth_score = (depth_ratio.min(10.0) / 10.0).max(0.0);
    ((spread_score + depth_score) / 2.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::BookLevel;
    use rust_decimal_macros::dec;

    fn book(exchange: &str, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> OrderBook {
        let mut b = OrderBook::new(exchange, "BTC/USDT");
        let bids: Vec<BookLevel> = bids.iter().map(|&(price, qty)| BookLevel { price, qty }).collect();
        let asks: Vec<BookLevel> = asks.iter().map(|&(price, qty)| BookLevel { price, qty }).collect();
        b.apply_snapshot(&bids, &asks, 1, 0, 0).unwrap();
        b
    }

    #[test]
    fn gross_spread_basic() {
        assert_eq!(gross_spread_pct(dec!(100), dec!(100.5)), dec!(0.5));
        assert_eq!(gross_spread_pct(dec!(0), dec!(100)), Decimal::ZERO);
    }

    #[test]
    fn net_spread_subtracts_fees() {
        // Deep books: no slippage at this notional.
        let buy = book("a", &[(dec!(99.9), dec!(100))], &[(dec!(100.0), dec!(100))]);
        let sell = book("b", &[(dec!(100.5), dec!(100))], &[(dec!(100.6), dec!(100))]);
        let est = estimate_spatial(&buy, &sell, dec!(0.10), dec!(0.10), dec!(1000)).unwrap();
        assert_eq!(est.gross_spread_pct, dec!(0.5));
        assert_eq!(est.slippage_pct, Decimal::ZERO);
        assert_eq!(est.net_spread_pct, dec!(0.3));
        assert_eq!(est.estimated_pnl_usd, dec!(3.0));
    }

    #[test]
    fn slippage_reduces_net() {
        // Thin top level forces the walk into a worse second level.
        let buy = book(
            "a",
            &[(dec!(99.0), dec!(10))],
            &[(dec!(100.0), dec!(0.005)), (dec!(101.0), dec!(10))],
        );
        let sell = book("b", &[(dec!(100.5), dec!(100))], &[(dec!(100.6), dec!(100))]);
        let est = estimate_spatial(&buy, &sell, dec!(0.10), dec!(0.10), dec!(1000)).unwrap();
        assert!(est.slippage_pct > Decimal::ZERO);
        assert!(est.net_spread_pct < est.gross_spread_pct - dec!(0.20));
    }

    #[test]
    fn empty_side_yields_none() {
        let buy = book("a", &[(dec!(99.0), dec!(1))], &[(dec!(100.0), dec!(1))]);
        let mut sell = OrderBook::new("b", "BTC/USDT");
        sell.apply_snapshot(&[], &[BookLevel { price: dec!(100.6), qty: dec!(1) }], 1, 0, 0)
            .unwrap();
        assert!(estimate_spatial(&buy, &sell, dec!(0.1), dec!(0.1), dec!(1000)).is_none());
    }

    #[test]
    fn confidence_bounds() {
        let c = confidence(dec!(0.75), dec!(0.25), dec!(10000), dec!(1000));
        assert!(c > 0.9 && c <= 1.0);
        let weak = confidence(dec!(0.25), dec!(0.25), dec!(1000), dec!(1000));
        assert!(weak < c);
    }
}
