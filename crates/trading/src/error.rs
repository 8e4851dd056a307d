//! Trading error types

use thiserror::Error;

use event_log::EventLogError;

/// Errors from order command planning
#[derive(Debug, Error)]
pub enum TradingError {
    /// Business rejection: the command is simply not applied. Surfaced to
    /// the caller as a structured message; shared state is untouched.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The optimistic persist kept losing its version race past the cap
    #[error("Persist retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    /// Log-level failure; integrity variants are fatal
    #[error(transparent)]
    Log(#[from] EventLogError),
}

impl TradingError {
    /// Shorthand for a business rejection
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True when the owning process must halt
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, TradingError::Log(e) if e.is_integrity_violation())
    }
}
