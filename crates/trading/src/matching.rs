//! Price-time greedy matching
//!
//! The walk itself is a pure function over a batch of candidates fetched
//! from the book projection. Candidates arrive best price first, arrival
//! order within a price level; the walk consumes
//! `min(remaining_order_qty, remaining_target_qty)` per step until the
//! incoming order is filled or candidates run out. Execution price is
//! always the resting order's limit price.

use rust_decimal::Decimal;

use projections::OrderBookEntry;

/// One planned pairing against a resting order
#[derive(Debug, Clone)]
pub struct PlannedFill {
    /// The resting order, as it looked when planned
    pub target: OrderBookEntry,
    /// Quantity consumed by this pairing
    pub qty: Decimal,
    /// Execution price: the target's limit price
    pub price: Decimal,
    /// Incoming order's remaining quantity after this pairing
    pub action_remaining: Decimal,
    /// Target's remaining quantity after this pairing
    pub target_remaining: Decimal,
}

/// Result of one matching walk
#[derive(Debug, Clone)]
pub struct MatchPlan {
    pub fills: Vec<PlannedFill>,
    /// Unfilled remainder of the incoming order
    pub remaining: Decimal,
}

impl MatchPlan {
    /// Total quantity consumed
    pub fn filled_qty(&self) -> Decimal {
        self.fills.iter().map(|f| f.qty).sum()
    }
}

/// Walk `candidates` greedily with `qty` to place
///
/// Candidates must already be filtered to crossing prices and sorted best
/// first; [`projections::OrderBookProjection::match_candidates`] returns
/// exactly that shape.
pub fn plan_matches(candidates: &[OrderBookEntry], qty: Decimal) -> MatchPlan {
    let mut fills = Vec::new();
    let mut remaining = qty;

    for target in candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(target.remaining_qty());
        if take <= Decimal::ZERO {
            continue;
        }
        remaining -= take;
        fills.push(PlannedFill {
            target: target.clone(),
            qty: take,
            price: target.limit_price,
            action_remaining: remaining,
            target_remaining: target.remaining_qty() - take,
        });
    }

    MatchPlan { fills, remaining }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountId, DurationType, Instrument, Side, UserId};
    use rust_decimal_macros::dec;

    fn resting(version: i64, price: Decimal, qty: Decimal) -> OrderBookEntry {
        OrderBookEntry {
            created_on_version: version,
            user: UserId::new(),
            account_id: AccountId::new(),
            instrument: Instrument::new("ETH", "BTC"),
            qty,
            side: Side::Sell,
            filled_qty: Decimal::ZERO,
            limit_price: price,
            duration_type: DurationType::GoodTillCancel,
            duration: None,
        }
    }

    #[test]
    fn test_consumes_in_order_until_filled() {
        let candidates = vec![
            resting(1, dec!(0.1), dec!(2.5)),
            resting(2, dec!(0.2), dec!(1)),
            resting(3, dec!(0.3), dec!(5)),
        ];

        let plan = plan_matches(&candidates, dec!(3));
        assert_eq!(plan.fills.len(), 2);
        assert_eq!(plan.fills[0].qty, dec!(2.5));
        assert_eq!(plan.fills[0].price, dec!(0.1));
        assert_eq!(plan.fills[1].qty, dec!(0.5));
        assert_eq!(plan.fills[1].target_remaining, dec!(0.5));
        assert_eq!(plan.remaining, dec!(0));
        assert_eq!(plan.filled_qty(), dec!(3));
    }

    #[test]
    fn test_remainder_when_liquidity_runs_out() {
        let candidates = vec![resting(1, dec!(0.2), dec!(3.5))];

        let plan = plan_matches(&candidates, dec!(4.5));
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].qty, dec!(3.5));
        assert_eq!(plan.remaining, dec!(1.0));
        assert_eq!(plan.fills[0].action_remaining, dec!(1.0));
    }

    #[test]
    fn test_no_candidates() {
        let plan = plan_matches(&[], dec!(1));
        assert!(plan.fills.is_empty());
        assert_eq!(plan.remaining, dec!(1));
    }

    #[test]
    fn test_partially_filled_target_offers_remainder_only() {
        let mut target = resting(1, dec!(0.8), dec!(2));
        target.filled_qty = dec!(1);

        let plan = plan_matches(&[target], dec!(5));
        assert_eq!(plan.fills[0].qty, dec!(1));
        assert_eq!(plan.remaining, dec!(4));
    }
}
