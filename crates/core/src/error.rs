//! Domain error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::id::SequenceId;

/// Result type used across the recovery domain.
pub type DunningResult<T> = Result<T, DunningError>;

/// Recovery-domain error.
///
/// Every failure surfaced to callers carries its structured kind; nothing is
/// silently downgraded to a string at the domain boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DunningError {
    /// No sequence with the given identifier exists.
    #[error("dunning sequence {sequence_id} not found")]
    NotFound { sequence_id: SequenceId },

    /// The requested event is not legal from the sequence's current status.
    ///
    /// `current` and `event` are the wire names of the status and event
    /// (e.g. `"cancelled"`, `"retry_payment"`).
    #[error("cannot apply {event} while sequence is {current}")]
    InvalidTransition { current: String, event: String },

    /// `retry_payment` was invoked before the scheduled retry instant.
    #[error("retry not due until {next_retry_at}")]
    TooEarlyForRetry { next_retry_at: DateTime<Utc> },

    /// Optimistic concurrency check failed (stale version supplied).
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    /// The payment gateway failed. Transient failures (timeouts, 5xx) never
    /// consume a dunning attempt; definitive declines are not errors at all
    /// and are reported as attempt outcomes instead.
    #[error("gateway error (transient={transient}): {message}")]
    Gateway { transient: bool, message: String },

    /// A value failed validation (e.g. malformed retry-policy offsets).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Persistence-layer failure (connection loss, serialization, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

impl DunningError {
    pub fn not_found(sequence_id: SequenceId) -> Self {
        Self::NotFound { sequence_id }
    }

    pub fn invalid_transition(current: impl Into<String>, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            current: current.into(),
            event: event.into(),
        }
    }

    pub fn too_early(next_retry_at: DateTime<Utc>) -> Self {
        Self::TooEarlyForRetry { next_retry_at }
    }

    pub fn conflict(expected: u64, actual: u64) -> Self {
        Self::ConcurrentModification { expected, actual }
    }

    pub fn gateway(transient: bool, message: impl Into<String>) -> Self {
        Self::Gateway {
            transient,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for gateway errors the adapter may retry on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Gateway { transient: true, .. })
    }
}
