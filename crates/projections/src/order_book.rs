//! Order book projection
//!
//! Mutable state derived from replayed events: open limit orders, hidden
//! (stop) orders, and the depth view. Books are per instrument and never
//! interact.
//!
//! CRITICAL PROPERTIES:
//! 1. Bids iterate descending (highest price first)
//! 2. Asks iterate ascending (lowest price first)
//! 3. Each price level is a FIFO queue in arrival (version) order
//! 4. Only the replay loop mutates a book

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use common::{AccountId, DurationType, Instrument, Side, Symbol, UserId};
use event_log::CreateOrder;

/// Open order resting in the book
///
/// Identified by the version number of the `CreateOrder` that spawned it;
/// that number is stable across every service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEntry {
    pub created_on_version: i64,
    pub user: UserId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub side: Side,
    pub filled_qty: Decimal,
    pub limit_price: Decimal,
    pub duration_type: DurationType,
    pub duration: Option<i64>,
}

impl OrderBookEntry {
    /// Build a book entry from its creation event
    pub fn from_event(version: i64, ev: &CreateOrder, limit_price: Decimal) -> Self {
        Self {
            created_on_version: version,
            user: ev.user,
            account_id: ev.account_id,
            instrument: ev.instrument.clone(),
            qty: ev.qty,
            side: ev.side,
            filled_qty: Decimal::ZERO,
            limit_price,
            duration_type: ev.duration_type,
            duration: ev.duration,
        }
    }

    /// Quantity still open
    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    /// Check if the order is completely filled
    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }
}

/// Stop order waiting for its trigger price
///
/// Hidden orders never participate in matching; a trigger converts them
/// into ordinary limit orders through the normal planning path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenOrderEntry {
    pub created_on_version: i64,
    pub user: UserId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub side: Side,
    pub stop_price: Decimal,
    pub limit_price: Option<Decimal>,
    pub duration_type: DurationType,
    pub duration: Option<i64>,
}

impl HiddenOrderEntry {
    /// True when a trade printing at `price` crosses the stop level
    ///
    /// A buy stop arms at or above its stop price, a sell stop at or below.
    pub fn triggers_at(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price >= self.stop_price,
            Side::Sell => price <= self.stop_price,
        }
    }
}

/// One side of the depth view: (price, open quantity)
pub type DepthLevel = (Decimal, Decimal);

/// Aggregated depth for one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub instrument: Instrument,
    /// Best (highest) bid first
    pub bids: Vec<DepthLevel>,
    /// Best (lowest) ask first
    pub asks: Vec<DepthLevel>,
}

/// Book for a single instrument
#[derive(Debug, Default)]
struct Book {
    /// Buy orders, price descending via `Reverse`
    bids: BTreeMap<Reverse<Decimal>, VecDeque<OrderBookEntry>>,
    /// Sell orders, price ascending
    asks: BTreeMap<Decimal, VecDeque<OrderBookEntry>>,
}

impl Book {
    fn insert(&mut self, entry: OrderBookEntry) {
        match entry.side {
            Side::Buy => self
                .bids
                .entry(Reverse(entry.limit_price))
                .or_default()
                .push_back(entry),
            Side::Sell => self
                .asks
                .entry(entry.limit_price)
                .or_default()
                .push_back(entry),
        }
    }

    fn find_mut(&mut self, version: i64) -> Option<&mut OrderBookEntry> {
        for queue in self.bids.values_mut() {
            if let Some(e) = queue.iter_mut().find(|e| e.created_on_version == version) {
                return Some(e);
            }
        }
        for queue in self.asks.values_mut() {
            if let Some(e) = queue.iter_mut().find(|e| e.created_on_version == version) {
                return Some(e);
            }
        }
        None
    }

    fn remove(&mut self, version: i64) -> Option<OrderBookEntry> {
        let mut removed = None;
        for queue in self.bids.values_mut() {
            if let Some(pos) = queue.iter().position(|e| e.created_on_version == version) {
                removed = queue.remove(pos);
                break;
            }
        }
        if removed.is_none() {
            for queue in self.asks.values_mut() {
                if let Some(pos) = queue.iter().position(|e| e.created_on_version == version) {
                    removed = queue.remove(pos);
                    break;
                }
            }
        }
        if removed.is_some() {
            self.cleanup_empty_levels();
        }
        removed
    }

    fn cleanup_empty_levels(&mut self) {
        self.bids.retain(|_, q| !q.is_empty());
        self.asks.retain(|_, q| !q.is_empty());
    }
}

/// All books plus the hidden-order table, guarded for concurrent readers
#[derive(Default)]
pub struct OrderBookProjection {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    books: HashMap<Instrument, Book>,
    hidden: HashMap<Instrument, Vec<HiddenOrderEntry>>,
}

impl OrderBookProjection {
    /// Create an empty projection
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Mutation (replay loop only)
    // ------------------------------------------------------------------

    /// Insert a freshly created limit order
    pub fn insert_order(&self, entry: OrderBookEntry) {
        let mut inner = self.inner.write();
        inner
            .books
            .entry(entry.instrument.clone())
            .or_default()
            .insert(entry);
    }

    /// Insert a freshly created stop order
    pub fn insert_hidden(&self, entry: HiddenOrderEntry) {
        let mut inner = self.inner.write();
        inner
            .hidden
            .entry(entry.instrument.clone())
            .or_default()
            .push(entry);
    }

    /// Remove an open order, returning it
    pub fn remove_order(&self, instrument: &Instrument, version: i64) -> Option<OrderBookEntry> {
        let mut inner = self.inner.write();
        inner.books.get_mut(instrument)?.remove(version)
    }

    /// Remove a hidden order, returning it
    pub fn remove_hidden(
        &self,
        instrument: &Instrument,
        version: i64,
    ) -> Option<HiddenOrderEntry> {
        let mut inner = self.inner.write();
        let hidden = inner.hidden.get_mut(instrument)?;
        let pos = hidden.iter().position(|e| e.created_on_version == version)?;
        Some(hidden.remove(pos))
    }

    /// Add `qty` to an order's fill, removing it when fully filled
    ///
    /// Returns the entry state after the fill, plus whether it closed.
    pub fn apply_fill(
        &self,
        instrument: &Instrument,
        version: i64,
        qty: Decimal,
    ) -> Option<(OrderBookEntry, bool)> {
        let mut inner = self.inner.write();
        let book = inner.books.get_mut(instrument)?;
        let entry = book.find_mut(version)?;
        entry.filled_qty += qty;
        let snapshot = entry.clone();
        if snapshot.is_filled() {
            book.remove(version);
            Some((snapshot, true))
        } else {
            Some((snapshot, false))
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Look up an open order by its creation version
    pub fn find_order(&self, instrument: &Instrument, version: i64) -> Option<OrderBookEntry> {
        let inner = self.inner.read();
        let book = inner.books.get(instrument)?;
        for queue in book.bids.values() {
            if let Some(e) = queue.iter().find(|e| e.created_on_version == version) {
                return Some(e.clone());
            }
        }
        for queue in book.asks.values() {
            if let Some(e) = queue.iter().find(|e| e.created_on_version == version) {
                return Some(e.clone());
            }
        }
        None
    }

    /// Look up a hidden order by its creation version
    pub fn find_hidden(&self, instrument: &Instrument, version: i64) -> Option<HiddenOrderEntry> {
        let inner = self.inner.read();
        inner
            .hidden
            .get(instrument)?
            .iter()
            .find(|e| e.created_on_version == version)
            .cloned()
    }

    /// Resting orders an incoming order of `side` could match, best first
    ///
    /// For a buy: asks priced at or below `limit` (all asks when `None`),
    /// ascending. For a sell: bids priced at or above `limit`, descending.
    /// Within a price level, arrival order is preserved.
    pub fn match_candidates(
        &self,
        instrument: &Instrument,
        side: Side,
        limit: Option<Decimal>,
    ) -> Vec<OrderBookEntry> {
        let inner = self.inner.read();
        let Some(book) = inner.books.get(instrument) else {
            return Vec::new();
        };
        match side {
            Side::Buy => book
                .asks
                .iter()
                .take_while(|(price, _)| limit.map_or(true, |l| **price <= l))
                .flat_map(|(_, q)| q.iter().cloned())
                .collect(),
            Side::Sell => book
                .bids
                .iter()
                .take_while(|(Reverse(price), _)| limit.map_or(true, |l| *price >= l))
                .flat_map(|(_, q)| q.iter().cloned())
                .collect(),
        }
    }

    /// All open orders belonging to a user, any instrument
    pub fn open_orders_for_user(&self, user: UserId) -> Vec<OrderBookEntry> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for book in inner.books.values() {
            for queue in book.bids.values().chain(book.asks.values()) {
                out.extend(queue.iter().filter(|e| e.user == user).cloned());
            }
        }
        out.sort_by_key(|e| e.created_on_version);
        out
    }

    /// Open orders of a user whose instrument touches the given coin
    ///
    /// The overdraw handler cancels from this set to free reservations.
    pub fn open_orders_touching_coin(&self, user: UserId, coin: &Symbol) -> Vec<OrderBookEntry> {
        self.open_orders_for_user(user)
            .into_iter()
            .filter(|e| e.instrument.touches(coin))
            .collect()
    }

    /// Hidden orders on an instrument, arrival order
    pub fn hidden_orders(&self, instrument: &Instrument) -> Vec<HiddenOrderEntry> {
        let inner = self.inner.read();
        inner.hidden.get(instrument).cloned().unwrap_or_default()
    }

    /// Aggregated depth for an instrument
    pub fn depth(&self, instrument: &Instrument) -> DepthSnapshot {
        let inner = self.inner.read();
        let (bids, asks) = match inner.books.get(instrument) {
            Some(book) => (
                book.bids
                    .iter()
                    .map(|(Reverse(price), q)| {
                        (*price, q.iter().map(|e| e.remaining_qty()).sum())
                    })
                    .collect(),
                book.asks
                    .iter()
                    .map(|(price, q)| (*price, q.iter().map(|e| e.remaining_qty()).sum()))
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        DepthSnapshot {
            instrument: instrument.clone(),
            bids,
            asks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(version: i64, side: Side, price: Decimal, qty: Decimal) -> OrderBookEntry {
        OrderBookEntry {
            created_on_version: version,
            user: UserId::new(),
            account_id: AccountId::new(),
            instrument: Instrument::new("ETH", "BTC"),
            qty,
            side,
            filled_qty: Decimal::ZERO,
            limit_price: price,
            duration_type: DurationType::GoodTillCancel,
            duration: None,
        }
    }

    #[test]
    fn test_candidates_price_then_arrival_order() {
        let books = OrderBookProjection::new();
        let inst = Instrument::new("ETH", "BTC");
        books.insert_order(entry(1, Side::Sell, dec!(0.2), dec!(1)));
        books.insert_order(entry(2, Side::Sell, dec!(0.1), dec!(1)));
        books.insert_order(entry(3, Side::Sell, dec!(0.1), dec!(1)));

        let candidates = books.match_candidates(&inst, Side::Buy, Some(dec!(0.2)));
        let versions: Vec<i64> = candidates.iter().map(|e| e.created_on_version).collect();
        // Best price first, arrival order within the 0.1 level.
        assert_eq!(versions, vec![2, 3, 1]);

        let capped = books.match_candidates(&inst, Side::Buy, Some(dec!(0.15)));
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_candidates_for_sell_descend() {
        let books = OrderBookProjection::new();
        let inst = Instrument::new("ETH", "BTC");
        books.insert_order(entry(1, Side::Buy, dec!(0.1), dec!(1)));
        books.insert_order(entry(2, Side::Buy, dec!(0.3), dec!(1)));

        let candidates = books.match_candidates(&inst, Side::Sell, Some(dec!(0.1)));
        let prices: Vec<Decimal> = candidates.iter().map(|e| e.limit_price).collect();
        assert_eq!(prices, vec![dec!(0.3), dec!(0.1)]);
    }

    #[test]
    fn test_fill_removes_when_complete() {
        let books = OrderBookProjection::new();
        let inst = Instrument::new("ETH", "BTC");
        books.insert_order(entry(5, Side::Buy, dec!(0.2), dec!(2.5)));

        let (state, closed) = books.apply_fill(&inst, 5, dec!(1)).unwrap();
        assert!(!closed);
        assert_eq!(state.remaining_qty(), dec!(1.5));

        let (state, closed) = books.apply_fill(&inst, 5, dec!(1.5)).unwrap();
        assert!(closed);
        assert!(state.is_filled());
        assert!(books.find_order(&inst, 5).is_none());
    }

    #[test]
    fn test_depth_aggregates_remaining_qty() {
        let books = OrderBookProjection::new();
        let inst = Instrument::new("ETH", "BTC");
        let mut partially_filled = entry(1, Side::Sell, dec!(0.1), dec!(4.5));
        partially_filled.filled_qty = dec!(3.5);
        books.insert_order(partially_filled);

        let depth = books.depth(&inst);
        assert!(depth.bids.is_empty());
        assert_eq!(depth.asks, vec![(dec!(0.1), dec!(1.0))]);
    }

    #[test]
    fn test_stop_trigger_direction() {
        let stop = HiddenOrderEntry {
            created_on_version: 1,
            user: UserId::new(),
            account_id: AccountId::new(),
            instrument: Instrument::new("ETH", "BTC"),
            qty: dec!(1),
            side: Side::Sell,
            stop_price: dec!(0.5),
            limit_price: None,
            duration_type: DurationType::GoodTillCancel,
            duration: None,
        };
        assert!(stop.triggers_at(dec!(0.5)));
        assert!(stop.triggers_at(dec!(0.4)));
        assert!(!stop.triggers_at(dec!(0.6)));
    }
}
