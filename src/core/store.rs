//! Persistence port for timer records.

use crate::core::{TimerError, TimerRecord, Transaction};
use crate::util::serde::TimerId;

/// Durable storage of timer records.
///
/// Writes are staged against the ambient transaction and become visible to
/// other transactions only once it commits. Reads inside a transaction see
/// that transaction's own staged writes.
pub trait TimerStore: Send + Sync {
    /// Insert or replace a record.
    fn save(&self, tx: &Transaction, record: &TimerRecord) -> Result<(), TimerError>;

    /// Fetch one record.
    fn load(&self, tx: &Transaction, id: TimerId) -> Result<Option<TimerRecord>, TimerError>;

    /// Every non-terminal record (Active or Suspended) of `owner_id`.
    fn load_all_active(
        &self,
        tx: &Transaction,
        owner_id: &str,
    ) -> Result<Vec<TimerRecord>, TimerError>;

    /// Remove a record. Removing an absent id is not an error.
    fn delete(&self, tx: &Transaction, id: TimerId) -> Result<(), TimerError>;
}

impl<T: TimerStore + ?Sized> TimerStore for Box<T> {
    fn save(&self, tx: &Transaction, record: &TimerRecord) -> Result<(), TimerError> {
        (**self).save(tx, record)
    }

    fn load(&self, tx: &Transaction, id: TimerId) -> Result<Option<TimerRecord>, TimerError> {
        (**self).load(tx, id)
    }

    fn load_all_active(
        &self,
        tx: &Transaction,
        owner_id: &str,
    ) -> Result<Vec<TimerRecord>, TimerError> {
        (**self).load_all_active(tx, owner_id)
    }

    fn delete(&self, tx: &Transaction, id: TimerId) -> Result<(), TimerError> {
        (**self).delete(tx, id)
    }
}
