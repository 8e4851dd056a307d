//! Ledger-side withdrawal validation
//!
//! Withdrawals are provider-initiated, so the ledger can only rule on them
//! when its own replay loop integrates the event; by then the deduction has
//! already been applied. Three outcomes:
//!
//! - balance still covers everything: `validated = true`
//! - balance is non-negative but reservations now exceed it: force-cancel
//!   open orders on every instrument touching the coin until the shortfall
//!   is freed, mark `overdrawn_and_canceled_orders`, then `validated = true`
//! - balance went negative: `validated = false` (the provider side revokes)
//!
//! The listener runs outside the version gate, so the forced cancellations
//! go through the ordinary planner path. They are appended BEFORE the flag
//! flips, which is what lets the provider see them by waiting for
//! integration.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use common::{order_reservation, reservation_coin, Symbol, UserId};
use event_log::{EventEntry, EventLog, EventPayload, WalletWithdrawal};
use projections::{EventListener, Projections};
use trading::OrderCommandPlanner;

use crate::saga::update_flags;

/// Replay listener implementing the trading ledger's side of the saga
pub struct LedgerSagaValidator {
    log: Arc<EventLog>,
    projections: Projections,
    planner: Arc<OrderCommandPlanner>,
}

impl LedgerSagaValidator {
    /// Create the validator over this instance's planner and projections
    pub fn new(
        log: Arc<EventLog>,
        projections: Projections,
        planner: Arc<OrderCommandPlanner>,
    ) -> Self {
        Self {
            log,
            projections,
            planner,
        }
    }

    async fn validate_withdrawal(&self, entry: &EventEntry, ev: &WalletWithdrawal) {
        let accounts = &self.projections.accounts;
        let balance = accounts.balance(ev.user, ev.account_id, &ev.coin_symbol);

        let verdict = if balance < Decimal::ZERO {
            warn!(
                version = entry.version_number,
                %balance,
                "withdrawal overdraws the account outright, rejecting"
            );
            false
        } else {
            let reserved = accounts.reserved(ev.user, ev.account_id, &ev.coin_symbol);
            if reserved > balance {
                let shortfall = reserved - balance;
                let freed = self
                    .force_cancel(ev.user, &ev.coin_symbol, shortfall)
                    .await;
                info!(
                    version = entry.version_number,
                    %shortfall,
                    %freed,
                    "withdrawal overdrew reservations, orders force-cancelled"
                );
                if let Err(e) = update_flags(&self.log, entry.id, |mut f| {
                    f.overdrawn_and_canceled_orders = true;
                    f
                })
                .await
                {
                    warn!(error = %e, "failed to record overdraw flag");
                }
            }
            true
        };

        if let Err(e) = update_flags(&self.log, entry.id, |mut f| {
            f.validated = Some(verdict);
            f
        })
        .await
        {
            // The provider side will time out and revoke.
            warn!(error = %e, "failed to record validation verdict");
        }
    }

    /// Cancel open orders reserving `coin` until `shortfall` is freed
    async fn force_cancel(&self, user: UserId, coin: &Symbol, shortfall: Decimal) -> Decimal {
        let mut freed = Decimal::ZERO;
        for order in self.projections.books.open_orders_touching_coin(user, coin) {
            if freed >= shortfall {
                break;
            }
            if &reservation_coin(order.side, &order.instrument) != coin {
                continue;
            }
            let held = order_reservation(order.side, order.remaining_qty(), order.limit_price);
            match self
                .planner
                .cancel_order(
                    order.user,
                    order.account_id,
                    order.instrument.clone(),
                    order.created_on_version,
                )
                .await
            {
                Ok(version) => {
                    freed += held;
                    info!(
                        cancelled = order.created_on_version,
                        at_version = version,
                        %held,
                        "order force-cancelled to cover withdrawal"
                    );
                }
                Err(e) => {
                    warn!(
                        order = order.created_on_version,
                        error = %e,
                        "force-cancel failed"
                    );
                }
            }
        }
        freed
    }
}

#[async_trait]
impl EventListener for LedgerSagaValidator {
    async fn on_transaction(&self, _version: i64, events: &[EventEntry]) {
        for event in events {
            let EventPayload::WalletWithdrawal(ev) = &event.payload else {
                continue;
            };
            // Only rule once; replays of already-ruled events are not ours.
            let already_ruled = match self.log.store().find(event.id).await {
                Ok(Some(stored)) => stored
                    .saga_flags()
                    .map_or(false, |f| f.validated.is_some()),
                _ => false,
            };
            if !already_ruled {
                self.validate_withdrawal(event, ev).await;
            }
        }
    }
}
