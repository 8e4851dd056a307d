//! Append-only versioned event log for OpenLedger
//!
//! The event log is the only durable truth in the system. Every fact is an
//! [`EventEntry`] stamped with a version number; all entries sharing one
//! version number form one atomic transaction, terminated by a commit
//! marker. Order books, balances, and wallet state are projections rebuilt
//! by replaying the log from version 0.
//!
//! # Modules
//!
//! - [`entry`] - Event entry model (the closed payload union)
//! - [`version`] - Per-process version gate and integration watermark
//! - [`store`] - Raw storage trait and the in-memory backend
//! - [`log`] - The persist protocol (first-commit-wins) and read filtering

pub mod entry;
pub mod error;
pub mod log;
pub mod store;
pub mod version;

pub use entry::{
    CancelOrder, CreateOrder, EventEntry, EventPayload, MatchOrder, SagaFlags,
    WalletConsolidation, WalletDeposit, WalletGenerate, WalletRevoke, WalletWithdrawal,
};
pub use error::{EventLogError, StoreError};
pub use log::EventLog;
pub use store::{EventStore, InMemoryEventStore};
pub use version::VersionControl;
