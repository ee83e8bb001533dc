//! Shared serializable identifiers and duration helpers.

use chrono::TimeDelta;

/// Globally unique identifier of a timer instance.
pub type TimerId = uuid::Uuid;

/// Identifier of the component a timer fires on behalf of.
pub type OwnerId = String;

/// Allocate a fresh timer id.
#[must_use]
pub fn new_timer_id() -> TimerId {
    uuid::Uuid::new_v4()
}

/// Convert milliseconds into a chrono delta, `None` if it does not fit.
#[must_use]
pub fn millis(ms: u64) -> Option<TimeDelta> {
    i64::try_from(ms).ok().and_then(TimeDelta::try_milliseconds)
}
