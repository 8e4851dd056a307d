//! Event replay/integration loop
//!
//! Every service instance runs one of these. Each tick it loads committed
//! events beyond the local watermark and applies them, in order, to the
//! projections. The watermark moves ONLY on commit markers, under the
//! process's version gate, so planners never race a mid-flight replay.
//!
//! A commit marker at any version other than watermark + 1 means the log
//! itself is suspect: the loop stops, fires the shutdown token, and the
//! process requires operator intervention. The same applies when an event's
//! asserted new balance disagrees with the recomputed one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{AccountId, OrderType, Side, Symbol, UserId};
use event_log::{
    CancelOrder, CreateOrder, EventEntry, EventLog, EventPayload, MatchOrder, WalletConsolidation,
    WalletDeposit, WalletGenerate, WalletRevoke, WalletWithdrawal,
};

use crate::accounts::{AccountLedgerProjection, BalanceSheet};
use crate::error::ReplayError;
use crate::history::{HistoryProjection, OrderHistoryEntry, OrderHistoryStatus, TradeHistoryEntry};
use crate::order_book::{HiddenOrderEntry, OrderBookEntry, OrderBookProjection};

/// Default replay tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(2);

/// The projection set one service instance derives from the log
#[derive(Clone)]
pub struct Projections {
    pub books: Arc<OrderBookProjection>,
    pub accounts: Arc<AccountLedgerProjection>,
    pub history: Arc<HistoryProjection>,
}

impl Projections {
    /// Fresh, empty projections
    pub fn new() -> Self {
        Self {
            books: Arc::new(OrderBookProjection::new()),
            accounts: Arc::new(AccountLedgerProjection::new()),
            history: Arc::new(HistoryProjection::new()),
        }
    }

    /// Fresh projections with a custom balance CAS retry cap
    pub fn with_cas_attempts(cas_attempts: u32) -> Self {
        Self {
            books: Arc::new(OrderBookProjection::new()),
            accounts: Arc::new(AccountLedgerProjection::with_cas_attempts(cas_attempts)),
            history: Arc::new(HistoryProjection::new()),
        }
    }
}

impl Default for Projections {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook invoked after a transaction is fully integrated
///
/// Listeners run OUTSIDE the version gate, so they may plan and persist new
/// transactions (forced cancellations, stop-order conversions) without
/// deadlocking against the loop.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_transaction(&self, version: i64, events: &[EventEntry]);
}

/// A withdrawal this instance has integrated, kept for revoke arithmetic
#[derive(Debug, Clone)]
struct WithdrawalRecord {
    user: UserId,
    account_id: AccountId,
    coin_symbol: Symbol,
    amount_with_fee: Decimal,
}

/// The replay loop state machine
pub struct ReplayLoop {
    log: Arc<EventLog>,
    projections: Projections,
    listeners: Vec<Arc<dyn EventListener>>,
    tick: Duration,
    shutdown: CancellationToken,
    /// Integrated withdrawals by version, for revoke application
    withdrawals: Mutex<HashMap<i64, WithdrawalRecord>>,
}

impl ReplayLoop {
    /// Create a loop over the shared log and this instance's projections
    pub fn new(log: Arc<EventLog>, projections: Projections, shutdown: CancellationToken) -> Self {
        Self {
            log,
            projections,
            listeners: Vec::new(),
            tick: DEFAULT_TICK,
            shutdown,
            withdrawals: Mutex::new(HashMap::new()),
        }
    }

    /// Override the tick interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Register a post-integration listener
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// The projections this loop maintains
    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    /// Run until shutdown or a fatal integrity error
    ///
    /// Transient store failures are logged and retried next tick; integrity
    /// violations cancel the shutdown token and return the error.
    pub async fn run(&self) -> Result<(), ReplayError> {
        info!(tick = ?self.tick, "replay loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("replay loop stopping on shutdown");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            match self.integrate_once().await {
                Ok(_) => {}
                Err(e) if e.is_integrity_violation() => {
                    error!(error = %e, "fatal integrity violation, halting service");
                    self.shutdown.cancel();
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "transient replay failure, retrying next tick");
                }
            }
        }
    }

    /// One integration pass; returns the number of transactions applied
    ///
    /// Skipped (returns 0) when a writer currently holds the version gate.
    pub async fn integrate_once(&self) -> Result<usize, ReplayError> {
        let mut completed: Vec<(i64, Vec<EventEntry>)> = Vec::new();
        let outcome = {
            let completed = &mut completed;
            self.log
                .version_control()
                .try_increase_version(|current| async move {
                    let events = self.log.load_missing_events(current, None).await?;
                    let mut watermark = current;
                    let mut pending: Vec<EventEntry> = Vec::new();
                    for event in events {
                        if event.version_number != watermark + 1 {
                            return Err(ReplayError::VersionGap {
                                expected: watermark + 1,
                                found: event.version_number,
                            });
                        }
                        if event.is_commit() {
                            watermark = event.version_number;
                            debug!(version = watermark, "transaction integrated");
                            completed.push((watermark, std::mem::take(&mut pending)));
                        } else {
                            self.apply(&event)?;
                            pending.push(event);
                        }
                    }
                    Ok(watermark)
                })
                .await
        };

        match outcome {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => {
                for (version, events) in &completed {
                    for listener in &self.listeners {
                        listener.on_transaction(*version, events).await;
                    }
                }
                Ok(completed.len())
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-event handlers
    // ------------------------------------------------------------------

    fn apply(&self, entry: &EventEntry) -> Result<(), ReplayError> {
        match &entry.payload {
            EventPayload::CreateOrder(ev) => self.apply_create_order(entry, ev),
            EventPayload::CancelOrder(ev) => self.apply_cancel_order(entry, ev),
            EventPayload::MatchOrder(ev) => self.apply_match_order(entry, ev),
            EventPayload::TransactionCommit => Ok(()),
            EventPayload::WalletGenerate(ev) => self.apply_wallet_generate(ev),
            EventPayload::WalletDeposit(ev) => self.apply_wallet_deposit(ev),
            EventPayload::WalletWithdrawal(ev) => self.apply_wallet_withdrawal(entry, ev),
            EventPayload::WalletConsolidation(ev) => self.apply_wallet_consolidation(ev),
            EventPayload::WalletRevoke(ev) => self.apply_wallet_revoke(entry, ev),
        }
    }

    fn apply_create_order(&self, entry: &EventEntry, ev: &CreateOrder) -> Result<(), ReplayError> {
        match ev.order_type {
            OrderType::Limit => {
                let price = ev
                    .limit_price
                    .ok_or(ReplayError::MalformedEvent("limit order without limit price"))?;
                let book_entry = OrderBookEntry::from_event(entry.version_number, ev, price);
                // Earmark the worst-case cost for the full quantity; matches
                // in the same transaction release their share per fill.
                let coin = common::reservation_coin(ev.side, &ev.instrument);
                let reservation = common::order_reservation(ev.side, ev.qty, price);
                self.projections
                    .accounts
                    .adjust_reserved(ev.user, ev.account_id, &coin, reservation);
                self.projections.books.insert_order(book_entry);
            }
            OrderType::Stop => {
                let stop_price = ev
                    .stop_price
                    .ok_or(ReplayError::MalformedEvent("stop order without stop price"))?;
                self.projections.books.insert_hidden(HiddenOrderEntry {
                    created_on_version: entry.version_number,
                    user: ev.user,
                    account_id: ev.account_id,
                    instrument: ev.instrument.clone(),
                    qty: ev.qty,
                    side: ev.side,
                    stop_price,
                    limit_price: ev.limit_price,
                    duration_type: ev.duration_type,
                    duration: ev.duration,
                });
            }
            OrderType::Market => {
                // Never rests; the match events settle the balances. Record
                // the terminal history row here.
                let filled = ev.filled_market_order_qty.ok_or(ReplayError::MalformedEvent(
                    "market order without filled quantity",
                ))?;
                self.projections.history.record_order(OrderHistoryEntry {
                    created_on_version: entry.version_number,
                    closed_on_version: entry.version_number,
                    user: ev.user,
                    account_id: ev.account_id,
                    instrument: ev.instrument.clone(),
                    qty: ev.qty,
                    filled_qty: filled,
                    side: ev.side,
                    order_type: OrderType::Market,
                    limit_price: None,
                    status: OrderHistoryStatus::Filled,
                    closed_at: entry.entry_time,
                });
            }
        }
        Ok(())
    }

    fn apply_cancel_order(&self, entry: &EventEntry, ev: &CancelOrder) -> Result<(), ReplayError> {
        let version = ev.cancel_order_created_on_version;
        if let Some(order) = self.projections.books.remove_order(&ev.instrument, version) {
            // Release what the open remainder still had earmarked.
            let coin = common::reservation_coin(order.side, &order.instrument);
            let held =
                common::order_reservation(order.side, order.remaining_qty(), order.limit_price);
            self.projections
                .accounts
                .adjust_reserved(order.user, order.account_id, &coin, -held);
            self.projections.history.record_order(OrderHistoryEntry {
                created_on_version: version,
                closed_on_version: entry.version_number,
                user: order.user,
                account_id: order.account_id,
                instrument: order.instrument,
                qty: order.qty,
                filled_qty: order.filled_qty,
                side: order.side,
                order_type: OrderType::Limit,
                limit_price: Some(order.limit_price),
                status: OrderHistoryStatus::Cancelled,
                closed_at: entry.entry_time,
            });
            return Ok(());
        }
        if let Some(hidden) = self.projections.books.remove_hidden(&ev.instrument, version) {
            // Hidden orders hold no reservation until triggered.
            self.projections.history.record_order(OrderHistoryEntry {
                created_on_version: version,
                closed_on_version: entry.version_number,
                user: hidden.user,
                account_id: hidden.account_id,
                instrument: hidden.instrument,
                qty: hidden.qty,
                filled_qty: Decimal::ZERO,
                side: hidden.side,
                order_type: OrderType::Stop,
                limit_price: hidden.limit_price,
                status: OrderHistoryStatus::Cancelled,
                closed_at: entry.entry_time,
            });
            return Ok(());
        }
        Err(ReplayError::ReferenceNotFound {
            kind: "order",
            version,
        })
    }

    fn apply_match_order(&self, entry: &EventEntry, ev: &MatchOrder) -> Result<(), ReplayError> {
        let books = &self.projections.books;
        let accounts = &self.projections.accounts;
        let base = &ev.instrument.base;
        let quote = &ev.instrument.quote;
        let cost = ev.qty * ev.price;

        // Recompute the four new balances through a sheet so a self-match
        // (one account on both ends) collapses exactly like the planner's.
        let mut sheet = BalanceSheet::new(accounts);
        let (base_in, base_out, quote_in, quote_out) = match ev.action_side {
            // Action buys: base flows action <- target, quote the other way.
            Side::Buy => (
                (ev.action_user, ev.action_account_id),
                (ev.target_user, ev.target_account_id),
                (ev.target_user, ev.target_account_id),
                (ev.action_user, ev.action_account_id),
            ),
            Side::Sell => (
                (ev.target_user, ev.target_account_id),
                (ev.action_user, ev.action_account_id),
                (ev.action_user, ev.action_account_id),
                (ev.target_user, ev.target_account_id),
            ),
        };
        sheet.add(base_in.0, base_in.1, base, ev.qty);
        sheet.add(base_out.0, base_out.1, base, -ev.qty);
        sheet.add(quote_in.0, quote_in.1, quote, cost);
        sheet.add(quote_out.0, quote_out.1, quote, -cost);

        let computed = [
            (
                "action base",
                sheet.get(ev.action_user, ev.action_account_id, base),
                ev.action_base_new_balance,
            ),
            (
                "action quote",
                sheet.get(ev.action_user, ev.action_account_id, quote),
                ev.action_quote_new_balance,
            ),
            (
                "target base",
                sheet.get(ev.target_user, ev.target_account_id, base),
                ev.target_base_new_balance,
            ),
            (
                "target quote",
                sheet.get(ev.target_user, ev.target_account_id, quote),
                ev.target_quote_new_balance,
            ),
        ];
        for (context, computed_value, asserted) in computed {
            if computed_value != asserted {
                return Err(ReplayError::BalanceMismatch {
                    context,
                    asserted,
                    computed: computed_value,
                });
            }
        }
        sheet.commit()?;

        // Fill the resting target; execution price is its limit price, so
        // its reservation releases at exactly that price.
        let (target, target_closed) = books
            .apply_fill(&ev.instrument, ev.target_order_on_version, ev.qty)
            .ok_or(ReplayError::ReferenceNotFound {
                kind: "match target",
                version: ev.target_order_on_version,
            })?;
        let target_coin = common::reservation_coin(target.side, &ev.instrument);
        let target_release = common::order_reservation(target.side, ev.qty, target.limit_price);
        accounts.adjust_reserved(target.user, target.account_id, &target_coin, -target_release);
        if target_closed {
            self.projections.history.record_order(OrderHistoryEntry {
                created_on_version: target.created_on_version,
                closed_on_version: entry.version_number,
                user: target.user,
                account_id: target.account_id,
                instrument: target.instrument.clone(),
                qty: target.qty,
                filled_qty: target.filled_qty,
                side: target.side,
                order_type: OrderType::Limit,
                limit_price: Some(target.limit_price),
                status: OrderHistoryStatus::Filled,
                closed_at: entry.entry_time,
            });
        }

        // Fill the action order's own book entry when it rests (a limit
        // order created in this same transaction). Market orders have none.
        if let Some((action, action_closed)) =
            books.apply_fill(&ev.instrument, entry.version_number, ev.qty)
        {
            let action_coin = common::reservation_coin(action.side, &ev.instrument);
            let action_release =
                common::order_reservation(action.side, ev.qty, action.limit_price);
            accounts.adjust_reserved(
                action.user,
                action.account_id,
                &action_coin,
                -action_release,
            );
            if action_closed {
                self.projections.history.record_order(OrderHistoryEntry {
                    created_on_version: action.created_on_version,
                    closed_on_version: entry.version_number,
                    user: action.user,
                    account_id: action.account_id,
                    instrument: action.instrument.clone(),
                    qty: action.qty,
                    filled_qty: action.filled_qty,
                    side: action.side,
                    order_type: OrderType::Limit,
                    limit_price: Some(action.limit_price),
                    status: OrderHistoryStatus::Filled,
                    closed_at: entry.entry_time,
                });
            }
        }

        self.projections.history.record_trade(TradeHistoryEntry {
            version: entry.version_number,
            instrument: ev.instrument.clone(),
            qty: ev.qty,
            price: ev.price,
            action_side: ev.action_side,
            action_user: ev.action_user,
            action_account_id: ev.action_account_id,
            target_user: ev.target_user,
            target_account_id: ev.target_account_id,
            executed_at: entry.entry_time,
        });
        Ok(())
    }

    fn apply_wallet_generate(&self, ev: &WalletGenerate) -> Result<(), ReplayError> {
        let accounts = &self.projections.accounts;
        let current = accounts.balance(ev.user, ev.account_id, &ev.coin_symbol);
        if current != ev.new_balance {
            return Err(ReplayError::BalanceMismatch {
                context: "wallet generate",
                asserted: ev.new_balance,
                computed: current,
            });
        }
        accounts.set_public_key(ev.user, ev.account_id, &ev.coin_symbol, ev.public_key.clone());
        Ok(())
    }

    fn apply_wallet_deposit(&self, ev: &WalletDeposit) -> Result<(), ReplayError> {
        let accounts = &self.projections.accounts;
        let computed = accounts.balance(ev.user, ev.account_id, &ev.coin_symbol) + ev.deposit_qty;
        if computed != ev.new_balance {
            return Err(ReplayError::BalanceMismatch {
                context: "wallet deposit",
                asserted: ev.new_balance,
                computed,
            });
        }
        accounts.modify_balance(ev.user, ev.account_id, &ev.coin_symbol, |b| {
            b + ev.deposit_qty
        })?;
        Ok(())
    }

    fn apply_wallet_withdrawal(
        &self,
        entry: &EventEntry,
        ev: &WalletWithdrawal,
    ) -> Result<(), ReplayError> {
        let accounts = &self.projections.accounts;
        let amount = ev.qty + ev.fee;
        let computed = accounts.balance(ev.user, ev.account_id, &ev.coin_symbol) - amount;
        if computed != ev.new_balance {
            return Err(ReplayError::BalanceMismatch {
                context: "wallet withdrawal",
                asserted: ev.new_balance,
                computed,
            });
        }
        accounts.modify_balance(ev.user, ev.account_id, &ev.coin_symbol, |b| b - amount)?;
        self.withdrawals.lock().insert(
            entry.version_number,
            WithdrawalRecord {
                user: ev.user,
                account_id: ev.account_id,
                coin_symbol: ev.coin_symbol.clone(),
                amount_with_fee: amount,
            },
        );
        Ok(())
    }

    fn apply_wallet_consolidation(&self, ev: &WalletConsolidation) -> Result<(), ReplayError> {
        // Funds move between exchange-owned keys; the user's ledger balance
        // is untouched. The provider side checks the expected on-chain
        // balances when it executes.
        debug!(
            coin = %ev.coin_symbol,
            qty = %ev.transfer_qty,
            "consolidation integrated"
        );
        Ok(())
    }

    fn apply_wallet_revoke(&self, entry: &EventEntry, ev: &WalletRevoke) -> Result<(), ReplayError> {
        let record = self
            .withdrawals
            .lock()
            .get(&ev.revoked_version)
            .cloned()
            .ok_or(ReplayError::ReferenceNotFound {
                kind: "withdrawal",
                version: ev.revoked_version,
            })?;
        if record.user != ev.user
            || record.account_id != ev.account_id
            || record.coin_symbol != ev.coin_symbol
        {
            return Err(ReplayError::MalformedEvent(
                "revoke does not match the withdrawn account",
            ));
        }
        let accounts = &self.projections.accounts;
        let computed = accounts.balance(ev.user, ev.account_id, &ev.coin_symbol)
            + record.amount_with_fee;
        if computed != ev.new_balance {
            return Err(ReplayError::BalanceMismatch {
                context: "wallet revoke",
                asserted: ev.new_balance,
                computed,
            });
        }
        accounts.modify_balance(ev.user, ev.account_id, &ev.coin_symbol, |b| {
            b + record.amount_with_fee
        })?;
        debug!(
            version = entry.version_number,
            revoked = ev.revoked_version,
            "withdrawal revoked, funds restored"
        );
        Ok(())
    }
}
