//! Error types for timer service operations.

use thiserror::Error;

use crate::util::serde::{OwnerId, TimerId};

/// Errors produced by timer service components.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Malformed schedule field, bad bounds or a non-positive interval.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    /// No invoker is registered for the owner.
    #[error("owner not bound: {0}")]
    OwnerNotBound(OwnerId),
    /// The timer is cancelled, expired, suspended or unknown.
    #[error("timer {0} is not active")]
    NotActive(TimerId),
    /// The owner's timeout callback failed.
    #[error("timeout invocation failed for timer {timer_id}: {reason}")]
    Invocation {
        /// Timer whose dispatch failed.
        timer_id: TimerId,
        /// Failure reported by the invoker or the commit.
        reason: String,
    },
    /// Persisted timers reference an owner with no registered invoker.
    #[error("owner {owner_id} has no invoker; {suspended} timer(s) left suspended")]
    RecoveryInconsistency {
        /// Owner whose timers could not be re-armed.
        owner_id: OwnerId,
        /// Number of records kept in the suspended state.
        suspended: usize,
    },
    /// The transaction did not commit.
    #[error("transaction rolled back: {0}")]
    RolledBack(String),
    /// Storage backend failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
