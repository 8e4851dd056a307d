//! Replay error types

use rust_decimal::Decimal;
use thiserror::Error;

use event_log::EventLogError;

/// Errors raised while integrating events into projections
///
/// Everything here except `Log(..)`-wrapped transient store failures is an
/// integrity violation: the log or the derived state is suspect and the
/// owning process must stop accepting work.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// A commit marker arrived at a version other than watermark + 1
    #[error("Version gap: expected commit at {expected}, found {found}")]
    VersionGap { expected: i64, found: i64 },

    /// An event's asserted new balance disagrees with the recomputed one
    #[error(
        "Balance mismatch on {context}: event asserts {asserted}, ledger computes {computed}"
    )]
    BalanceMismatch {
        context: &'static str,
        asserted: Decimal,
        computed: Decimal,
    },

    /// An event referenced something the projections do not contain
    #[error("Referenced {kind} not found: version {version}")]
    ReferenceNotFound { kind: &'static str, version: i64 },

    /// An event is missing a field its variant requires
    #[error("Malformed event: {0}")]
    MalformedEvent(&'static str),

    /// Balance compare-and-swap kept failing past the attempt cap
    #[error("Balance CAS retries exhausted for {0}")]
    CasRetriesExhausted(String),

    #[error(transparent)]
    Log(#[from] EventLogError),
}

impl ReplayError {
    /// True for errors that must halt the owning process
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            ReplayError::VersionGap { .. }
            | ReplayError::BalanceMismatch { .. }
            | ReplayError::ReferenceNotFound { .. }
            | ReplayError::MalformedEvent(_)
            | ReplayError::CasRetriesExhausted(_) => true,
            ReplayError::Log(e) => e.is_integrity_violation(),
        }
    }
}
