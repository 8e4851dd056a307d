//! Closed-order and trade history projections

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use common::{AccountId, Instrument, OrderType, Side, UserId};

/// Terminal state of a closed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderHistoryStatus {
    Filled,
    Cancelled,
    Rejected,
}

/// Immutable record written once per closed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
    pub created_on_version: i64,
    /// Version of the event that closed the order
    pub closed_on_version: i64,
    pub user: UserId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub status: OrderHistoryStatus,
    pub closed_at: DateTime<Utc>,
}

/// One executed match, as seen by the transaction history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub version: i64,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub price: Decimal,
    pub action_side: Side,
    pub action_user: UserId,
    pub action_account_id: AccountId,
    pub target_user: UserId,
    pub target_account_id: AccountId,
    pub executed_at: DateTime<Utc>,
}

/// Append-only history state
#[derive(Default)]
pub struct HistoryProjection {
    orders: RwLock<Vec<OrderHistoryEntry>>,
    trades: RwLock<Vec<TradeHistoryEntry>>,
}

impl HistoryProjection {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a closed order (replay loop only)
    pub fn record_order(&self, entry: OrderHistoryEntry) {
        self.orders.write().push(entry);
    }

    /// Record an executed match (replay loop only)
    pub fn record_trade(&self, entry: TradeHistoryEntry) {
        self.trades.write().push(entry);
    }

    /// A user's closed orders, most recent first
    pub fn orders_for_user(&self, user: UserId) -> Vec<OrderHistoryEntry> {
        let orders = self.orders.read();
        let mut out: Vec<OrderHistoryEntry> =
            orders.iter().filter(|o| o.user == user).cloned().collect();
        out.sort_by(|a, b| b.closed_on_version.cmp(&a.closed_on_version));
        out
    }

    /// Trades on an instrument, most recent first, capped at `limit`
    pub fn trades_for_instrument(
        &self,
        instrument: &Instrument,
        limit: usize,
    ) -> Vec<TradeHistoryEntry> {
        let trades = self.trades.read();
        let mut out: Vec<TradeHistoryEntry> = trades
            .iter()
            .filter(|t| &t.instrument == instrument)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version));
        out.truncate(limit);
        out
    }
}
