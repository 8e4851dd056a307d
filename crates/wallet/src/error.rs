//! Wallet error types

use thiserror::Error;

use common::Symbol;
use event_log::{EventLogError, StoreError};

/// Errors from a blockchain provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Node unreachable or timed out; retried with backoff, never fatal
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Provider error: {0}")]
    Other(String),
}

/// Errors from wallet saga coordination
#[derive(Debug, Error)]
pub enum WalletError {
    /// Business rejection (including validation failure and saga timeout)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// No provider registered for the coin
    #[error("No provider registered for coin {0}")]
    UnknownCoin(Symbol),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The optimistic persist kept losing its version race past the cap
    #[error("Persist retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error(transparent)]
    Log(#[from] EventLogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WalletError {
    /// Shorthand for a business rejection
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True when the owning process must halt
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, WalletError::Log(e) if e.is_integrity_violation())
    }
}
