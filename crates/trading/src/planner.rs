//! Order command planning
//!
//! Planning happens under the process's version gate: read the book and
//! ledger as of the locally integrated version, decide, and append the
//! whole decision as one transaction at version + 1. When the optimistic
//! persist reports the version taken, the ENTIRE planning step reruns from
//! scratch, because the book state it decided on is stale. Retries are
//! capped and escalate to a reported fault.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};

use common::{
    order_reservation, reservation_coin, AccountId, DurationType, Instrument, OrderType, Side,
    UserId,
};
use event_log::{
    CancelOrder, CreateOrder, EventEntry, EventLog, EventPayload, MatchOrder,
};
use projections::{BalanceSheet, HiddenOrderEntry, Projections};

use crate::error::TradingError;
use crate::matching::{plan_matches, MatchPlan};

/// Default cap on persist retries before escalating
pub const DEFAULT_PERSIST_ATTEMPTS: u32 = 16;

/// An incoming order command, already unwrapped from its envelope
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user: UserId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub duration_type: DurationType,
    pub duration: Option<i64>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Plans order commands into event transactions
pub struct OrderCommandPlanner {
    log: Arc<EventLog>,
    projections: Projections,
    max_attempts: u32,
}

impl OrderCommandPlanner {
    /// Create a planner over the shared log and this instance's projections
    pub fn new(log: Arc<EventLog>, projections: Projections) -> Self {
        Self {
            log,
            projections,
            max_attempts: DEFAULT_PERSIST_ATTEMPTS,
        }
    }

    /// Override the persist retry cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Plan and persist a create-order command
    ///
    /// Returns the version number the order committed at. Business
    /// rejections (bad fields, insufficient balance, market order without
    /// liquidity) come back as [`TradingError::Rejected`].
    pub async fn create_order(&self, order: NewOrder) -> Result<i64, TradingError> {
        validate(&order)?;
        let order = &order;

        for attempt in 1..=self.max_attempts {
            let outcome = self
                .log
                .version_control()
                .execute_using_fixed_version(|current| async move {
                    self.plan_create(order, current).await
                })
                .await?;
            match outcome {
                Some(version) => {
                    info!(
                        version,
                        user = %order.user,
                        instrument = %order.instrument,
                        side = %order.side,
                        order_type = %order.order_type,
                        "order committed"
                    );
                    return Ok(version);
                }
                None => debug!(attempt, "create-order persist outdated, re-planning"),
            }
        }
        Err(TradingError::RetriesExhausted(self.max_attempts))
    }

    /// Plan and persist a cancel-order command
    ///
    /// Rejects when the order does not exist or belongs to someone else;
    /// the cross-user case never mutates the order.
    pub async fn cancel_order(
        &self,
        user: UserId,
        account_id: AccountId,
        instrument: Instrument,
        created_on_version: i64,
    ) -> Result<i64, TradingError> {
        for attempt in 1..=self.max_attempts {
            let instrument = instrument.clone();
            let outcome = self
                .log
                .version_control()
                .execute_using_fixed_version(|current| async move {
                    let owner = self
                        .projections
                        .books
                        .find_order(&instrument, created_on_version)
                        .map(|o| (o.user, o.account_id))
                        .or_else(|| {
                            self.projections
                                .books
                                .find_hidden(&instrument, created_on_version)
                                .map(|o| (o.user, o.account_id))
                        });
                    match owner {
                        None => {
                            return Err(TradingError::rejected(format!(
                                "no open order created on version {created_on_version}"
                            )))
                        }
                        Some((order_user, order_account))
                            if order_user != user || order_account != account_id =>
                        {
                            return Err(TradingError::rejected(
                                "order belongs to a different account",
                            ))
                        }
                        Some(_) => {}
                    }

                    let version = current + 1;
                    let cancel = EventEntry::new(
                        version,
                        EventPayload::CancelOrder(CancelOrder {
                            user,
                            account_id,
                            instrument: instrument.clone(),
                            cancel_order_created_on_version: created_on_version,
                        }),
                    );
                    let committed = self.log.persist(vec![cancel], Some(current)).await?;
                    Ok(committed.map(|_| version))
                })
                .await?;
            match outcome {
                Some(version) => {
                    info!(version, created_on_version, "cancel committed");
                    return Ok(version);
                }
                None => debug!(attempt, "cancel persist outdated, re-planning"),
            }
        }
        Err(TradingError::RetriesExhausted(self.max_attempts))
    }

    /// Convert a triggered stop order into a live limit order
    ///
    /// The conversion transaction cancels the hidden order and creates an
    /// ordinary limit order (at the stop's limit price, or the trigger
    /// price when none was given), inheriting the normal balance check and
    /// matching. When the account can no longer cover the order, the stop
    /// is cancelled alone. Returns `Ok(None)` when the stop was already
    /// gone.
    pub async fn trigger_stop_order(
        &self,
        hidden: &HiddenOrderEntry,
        trigger_price: Decimal,
    ) -> Result<Option<i64>, TradingError> {
        for attempt in 1..=self.max_attempts {
            let outcome = self
                .log
                .version_control()
                .execute_using_fixed_version(|current| async move {
                    if self
                        .projections
                        .books
                        .find_hidden(&hidden.instrument, hidden.created_on_version)
                        .is_none()
                    {
                        return Ok::<_, TradingError>(Some(None));
                    }

                    let version = current + 1;
                    let limit_price = hidden.limit_price.unwrap_or(trigger_price);
                    let mut events = vec![EventEntry::new(
                        version,
                        EventPayload::CancelOrder(CancelOrder {
                            user: hidden.user,
                            account_id: hidden.account_id,
                            instrument: hidden.instrument.clone(),
                            cancel_order_created_on_version: hidden.created_on_version,
                        }),
                    )];

                    let coin = reservation_coin(hidden.side, &hidden.instrument);
                    let needed = order_reservation(hidden.side, hidden.qty, limit_price);
                    let available = self.projections.accounts.available(
                        hidden.user,
                        hidden.account_id,
                        &coin,
                    );
                    if available >= needed {
                        let order = NewOrder {
                            user: hidden.user,
                            account_id: hidden.account_id,
                            instrument: hidden.instrument.clone(),
                            qty: hidden.qty,
                            side: hidden.side,
                            order_type: OrderType::Limit,
                            limit_price: Some(limit_price),
                            stop_price: None,
                            duration_type: hidden.duration_type,
                            duration: hidden.duration,
                            stop_loss: None,
                            take_profit: None,
                        };
                        let candidates = self.projections.books.match_candidates(
                            &order.instrument,
                            order.side,
                            Some(limit_price),
                        );
                        let plan = plan_matches(&candidates, order.qty);
                        events.push(create_order_entry(version, &order, None));
                        events.extend(self.build_match_events(version, &order, &plan));
                    } else {
                        info!(
                            created_on_version = hidden.created_on_version,
                            "stop trigger lacks balance, cancelling stop order"
                        );
                    }

                    let committed = self.log.persist(events, Some(current)).await?;
                    Ok(committed.map(|_| Some(version)))
                })
                .await?;
            match outcome {
                Some(result) => return Ok(result),
                None => debug!(attempt, "stop-trigger persist outdated, re-planning"),
            }
        }
        Err(TradingError::RetriesExhausted(self.max_attempts))
    }

    // ------------------------------------------------------------------
    // Planning internals (run under the version gate)
    // ------------------------------------------------------------------

    async fn plan_create(
        &self,
        order: &NewOrder,
        current: i64,
    ) -> Result<Option<i64>, TradingError> {
        let version = current + 1;
        let events = match order.order_type {
            OrderType::Limit => self.plan_limit(order, version)?,
            OrderType::Market => self.plan_market(order, version)?,
            OrderType::Stop => self.plan_stop(order, version)?,
        };
        let committed = self.log.persist(events, Some(current)).await?;
        Ok(committed.map(|_| version))
    }

    fn plan_limit(&self, order: &NewOrder, version: i64) -> Result<Vec<EventEntry>, TradingError> {
        // Validated earlier; limit orders always carry a price.
        let price = order.limit_price.expect("validated limit price");
        self.assert_covered(order, order_reservation(order.side, order.qty, price))?;

        let candidates =
            self.projections
                .books
                .match_candidates(&order.instrument, order.side, Some(price));
        let plan = plan_matches(&candidates, order.qty);

        let mut events = vec![create_order_entry(version, order, None)];
        events.extend(self.build_match_events(version, order, &plan));
        Ok(events)
    }

    fn plan_market(&self, order: &NewOrder, version: i64) -> Result<Vec<EventEntry>, TradingError> {
        let candidates =
            self.projections
                .books
                .match_candidates(&order.instrument, order.side, None);
        let plan = plan_matches(&candidates, order.qty);
        if plan.fills.is_empty() {
            return Err(TradingError::rejected(
                "market order found no matching liquidity",
            ));
        }

        // Worst case for a market order is what the planned fills actually
        // cost; nothing rests, so nothing beyond that is earmarked.
        let needed = match order.side {
            Side::Buy => plan.fills.iter().map(|f| f.qty * f.price).sum(),
            Side::Sell => plan.filled_qty(),
        };
        self.assert_covered(order, needed)?;

        let mut events = vec![create_order_entry(version, order, Some(plan.filled_qty()))];
        events.extend(self.build_match_events(version, order, &plan));
        Ok(events)
    }

    fn plan_stop(&self, order: &NewOrder, version: i64) -> Result<Vec<EventEntry>, TradingError> {
        let stop_price = order.stop_price.expect("validated stop price");
        let worst_price = order.limit_price.unwrap_or(stop_price);
        self.assert_covered(order, order_reservation(order.side, order.qty, worst_price))?;
        // Hidden until triggered; no matching, no reservation yet.
        Ok(vec![create_order_entry(version, order, None)])
    }

    fn assert_covered(&self, order: &NewOrder, needed: Decimal) -> Result<(), TradingError> {
        let coin = reservation_coin(order.side, &order.instrument);
        let available = self
            .projections
            .accounts
            .available(order.user, order.account_id, &coin);
        if available < needed {
            return Err(TradingError::rejected(format!(
                "insufficient balance: {needed} {coin} needed, {available} available"
            )));
        }
        Ok(())
    }

    /// Turn a match plan into `MatchOrder` events with running balances
    ///
    /// A balance sheet accumulates the deltas of every fill in the
    /// transaction, so the asserted new-balance fields line up with what
    /// replay recomputes, fill by fill, even when one account appears on
    /// both sides.
    fn build_match_events(
        &self,
        version: i64,
        order: &NewOrder,
        plan: &MatchPlan,
    ) -> Vec<EventEntry> {
        let base = &order.instrument.base;
        let quote = &order.instrument.quote;
        let mut sheet = BalanceSheet::new(&self.projections.accounts);
        let mut events = Vec::with_capacity(plan.fills.len());

        for fill in &plan.fills {
            let cost = fill.qty * fill.price;
            let action = (order.user, order.account_id);
            let target = (fill.target.user, fill.target.account_id);
            match order.side {
                Side::Buy => {
                    sheet.add(action.0, action.1, base, fill.qty);
                    sheet.add(target.0, target.1, base, -fill.qty);
                    sheet.add(action.0, action.1, quote, -cost);
                    sheet.add(target.0, target.1, quote, cost);
                }
                Side::Sell => {
                    sheet.add(action.0, action.1, base, -fill.qty);
                    sheet.add(target.0, target.1, base, fill.qty);
                    sheet.add(action.0, action.1, quote, cost);
                    sheet.add(target.0, target.1, quote, -cost);
                }
            }
            events.push(EventEntry::new(
                version,
                EventPayload::MatchOrder(MatchOrder {
                    action_user: order.user,
                    action_account_id: order.account_id,
                    target_order_on_version: fill.target.created_on_version,
                    target_user: fill.target.user,
                    target_account_id: fill.target.account_id,
                    instrument: order.instrument.clone(),
                    qty: fill.qty,
                    action_side: order.side,
                    price: fill.price,
                    action_base_new_balance: sheet.get(action.0, action.1, base),
                    action_quote_new_balance: sheet.get(action.0, action.1, quote),
                    target_base_new_balance: sheet.get(target.0, target.1, base),
                    target_quote_new_balance: sheet.get(target.0, target.1, quote),
                    action_order_qty_remaining: fill.action_remaining,
                    target_order_qty_remaining: fill.target_remaining,
                }),
            ));
        }
        events
    }
}

fn create_order_entry(
    version: i64,
    order: &NewOrder,
    filled_market_order_qty: Option<Decimal>,
) -> EventEntry {
    EventEntry::new(
        version,
        EventPayload::CreateOrder(CreateOrder {
            user: order.user,
            account_id: order.account_id,
            instrument: order.instrument.clone(),
            qty: order.qty,
            side: order.side,
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            duration_type: order.duration_type,
            duration: order.duration,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            filled_market_order_qty,
        }),
    )
}

fn validate(order: &NewOrder) -> Result<(), TradingError> {
    if order.qty <= Decimal::ZERO {
        return Err(TradingError::rejected("quantity must be positive"));
    }
    match order.order_type {
        OrderType::Limit => match order.limit_price {
            Some(p) if p > Decimal::ZERO => {}
            _ => return Err(TradingError::rejected("limit order requires a positive price")),
        },
        OrderType::Stop => {
            match order.stop_price {
                Some(p) if p > Decimal::ZERO => {}
                _ => {
                    return Err(TradingError::rejected(
                        "stop order requires a positive stop price",
                    ))
                }
            }
            if matches!(order.limit_price, Some(p) if p <= Decimal::ZERO) {
                return Err(TradingError::rejected("limit price must be positive"));
            }
        }
        OrderType::Market => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(order_type: OrderType, limit: Option<Decimal>, stop: Option<Decimal>) -> NewOrder {
        NewOrder {
            user: UserId::new(),
            account_id: AccountId::new(),
            instrument: Instrument::new("ETH", "BTC"),
            qty: dec!(1),
            side: Side::Buy,
            order_type,
            limit_price: limit,
            stop_price: stop,
            duration_type: DurationType::GoodTillCancel,
            duration: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut bad_qty = order(OrderType::Limit, Some(dec!(0.1)), None);
        bad_qty.qty = dec!(0);
        assert!(validate(&bad_qty).is_err());

        assert!(validate(&order(OrderType::Limit, None, None)).is_err());
        assert!(validate(&order(OrderType::Limit, Some(dec!(-1)), None)).is_err());
        assert!(validate(&order(OrderType::Stop, None, None)).is_err());
        assert!(validate(&order(OrderType::Stop, None, Some(dec!(0.5)))).is_ok());
        assert!(validate(&order(OrderType::Market, None, None)).is_ok());
    }
}
