//! Event entry model
//!
//! Every persisted fact is an [`EventEntry`]: a log-assigned id, the version
//! number of the transaction it belongs to, the commit-time stamp shared by
//! the whole transaction, and a closed payload union. Handlers dispatch with
//! an exhaustive `match` so a new variant fails to compile until every
//! consumer handles it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{AccountId, DurationType, Instrument, OrderType, Side, Symbol, UserId};

/// One persisted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    /// Globally unique, assigned when the entry is built
    pub id: Uuid,
    /// Transaction group this event belongs to
    pub version_number: i64,
    /// Stamped once per transaction at commit time
    pub entry_time: DateTime<Utc>,
    /// The fact itself
    pub payload: EventPayload,
}

impl EventEntry {
    /// Build an entry for a transaction at `version_number`
    ///
    /// `entry_time` is a placeholder here; the persist step re-stamps every
    /// entry of a transaction with one shared commit time.
    pub fn new(version_number: i64, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            version_number,
            entry_time: Utc::now(),
            payload,
        }
    }

    /// True for the commit marker terminating a transaction
    pub fn is_commit(&self) -> bool {
        matches!(self.payload, EventPayload::TransactionCommit)
    }

    /// The wallet saga flags, if this is a wallet event
    pub fn saga_flags(&self) -> Option<&SagaFlags> {
        match &self.payload {
            EventPayload::WalletGenerate(e) => Some(&e.saga),
            EventPayload::WalletDeposit(e) => Some(&e.saga),
            EventPayload::WalletWithdrawal(e) => Some(&e.saga),
            EventPayload::WalletConsolidation(e) => Some(&e.saga),
            EventPayload::WalletRevoke(e) => Some(&e.saga),
            _ => None,
        }
    }

    /// Mutable access to the wallet saga flags, if this is a wallet event
    pub fn saga_flags_mut(&mut self) -> Option<&mut SagaFlags> {
        match &mut self.payload {
            EventPayload::WalletGenerate(e) => Some(&mut e.saga),
            EventPayload::WalletDeposit(e) => Some(&mut e.saga),
            EventPayload::WalletWithdrawal(e) => Some(&mut e.saga),
            EventPayload::WalletConsolidation(e) => Some(&mut e.saga),
            EventPayload::WalletRevoke(e) => Some(&mut e.saga),
            _ => None,
        }
    }
}

/// The closed union of persisted facts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new order entered the system
    CreateOrder(CreateOrder),
    /// An open order was cancelled by its owner (or force-cancelled)
    CancelOrder(CancelOrder),
    /// Two orders matched
    MatchOrder(MatchOrder),
    /// Commit marker: terminates one atomic transaction
    TransactionCommit,
    /// A deposit wallet was generated
    WalletGenerate(WalletGenerate),
    /// Coin arrived on a deposit wallet
    WalletDeposit(WalletDeposit),
    /// Coin leaves the exchange to an external address
    WalletWithdrawal(WalletWithdrawal),
    /// Funds moved between exchange-owned wallets
    WalletConsolidation(WalletConsolidation),
    /// A withdrawal was revoked and its reservation released
    WalletRevoke(WalletRevoke),
}

/// Order creation fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
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
    /// Set only for market orders: the quantity consumed by this transaction
    pub filled_market_order_qty: Option<Decimal>,
}

/// Order cancellation fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrder {
    pub user: UserId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    /// Version number of the `CreateOrder` that spawned the order
    pub cancel_order_created_on_version: i64,
}

/// One pairing between an incoming (action) order and a resting (target) order
///
/// The four new-balance fields are redundant with the ledger: replay
/// recomputes them and treats any mismatch as unrecoverable corruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOrder {
    pub action_user: UserId,
    pub action_account_id: AccountId,
    /// Version number of the resting order's `CreateOrder`
    pub target_order_on_version: i64,
    pub target_user: UserId,
    pub target_account_id: AccountId,
    pub instrument: Instrument,
    pub qty: Decimal,
    pub action_side: Side,
    /// Execution price: always the resting order's limit price
    pub price: Decimal,
    pub action_base_new_balance: Decimal,
    pub action_quote_new_balance: Decimal,
    pub target_base_new_balance: Decimal,
    pub target_quote_new_balance: Decimal,
    pub action_order_qty_remaining: Decimal,
    pub target_order_qty_remaining: Decimal,
}

/// Saga coordination flags shared by all wallet events
///
/// These are the only mutable fields of a persisted entry: the event log is
/// the saga's shared state between the trading ledger and the wallet
/// provider service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFlags {
    /// Ledger-side verdict; `None` until the ledger's replay loop rules
    pub validated: Option<bool>,
    /// Provider-side: the on-chain transfer happened
    pub executed: bool,
    /// Outcome usable by dependent events (consolidation gating)
    pub valid: Option<bool>,
    /// The ledger found the account overdrawn and force-cancelled orders
    pub overdrawn_and_canceled_orders: bool,
}

/// Deposit wallet generation fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletGenerate {
    pub user: UserId,
    pub account_id: AccountId,
    pub coin_symbol: Symbol,
    pub public_key: String,
    pub new_balance: Decimal,
    pub saga: SagaFlags,
}

/// On-chain deposit fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletDeposit {
    pub user: UserId,
    pub account_id: AccountId,
    pub coin_symbol: Symbol,
    pub deposit_public_key: String,
    pub deposit_qty: Decimal,
    pub new_balance: Decimal,
    pub saga: SagaFlags,
}

/// Withdrawal request fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletWithdrawal {
    pub user: UserId,
    pub account_id: AccountId,
    pub coin_symbol: Symbol,
    pub withdrawal_source_public_key: String,
    pub withdrawal_target_public_key: String,
    pub qty: Decimal,
    pub fee: Decimal,
    pub new_balance: Decimal,
    pub saga: SagaFlags,
}

/// Transfer between exchange-owned wallets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConsolidation {
    pub user: UserId,
    pub account_id: AccountId,
    pub coin_symbol: Symbol,
    pub source_public_key: String,
    pub target_public_key: String,
    pub transfer_qty: Decimal,
    /// Expected on-chain balances after the transfer; used for idempotent
    /// re-entry
    pub expected_source_balance: Decimal,
    pub expected_target_balance: Decimal,
    /// Version of the withdrawal this consolidation is paired with, if any
    pub withdrawal_on_version: Option<i64>,
    pub saga: SagaFlags,
}

/// Withdrawal revocation fact: unlocks the originally reserved funds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRevoke {
    pub user: UserId,
    pub account_id: AccountId,
    pub coin_symbol: Symbol,
    /// Version number of the revoked withdrawal
    pub revoked_version: i64,
    pub new_balance: Decimal,
    pub saga: SagaFlags,
}
