//! Event log error types

use thiserror::Error;
use uuid::Uuid;

/// Errors from the raw storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("Entry {0} is not a wallet event")]
    NotAWalletEvent(Uuid),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Errors from the persist protocol
///
/// `MixedVersionNumbers` and `EmptyTransaction` indicate a planner bug, not
/// a business condition; callers must treat them as fatal integrity errors.
/// An ordinary losing race is NOT an error: `persist` reports it by
/// returning `None`.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Mixed version numbers in one transaction: {expected} and {found}")]
    MixedVersionNumbers { expected: i64, found: i64 },

    #[error("Refusing to persist an empty transaction")]
    EmptyTransaction,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EventLogError {
    /// True for errors that must halt the owning process
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            EventLogError::MixedVersionNumbers { .. } | EventLogError::EmptyTransaction
        )
    }
}
