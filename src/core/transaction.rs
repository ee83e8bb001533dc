//! Local transactions with completion callbacks.
//!
//! Stores stage their writes against a [`Transaction`] and register a
//! [`Synchronization`] to apply or discard them; the engine uses
//! [`Transaction::after_commit`] to touch in-memory state only once the
//! outcome is durable. Dropping a transaction without committing rolls it back.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::TimerError;

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Writes are durable.
    Committed,
    /// Writes were discarded.
    RolledBack,
}

/// Participant notified around completion.
pub trait Synchronization: Send {
    /// Called before commit; an error turns the commit into a rollback.
    fn before_completion(&mut self) -> Result<(), TimerError> {
        Ok(())
    }

    /// Called once the outcome is known.
    fn after_completion(self: Box<Self>, outcome: TxOutcome);
}

struct AfterCommit<F>(Option<F>);

impl<F> Synchronization for AfterCommit<F>
where
    F: FnOnce() + Send,
{
    fn after_completion(mut self: Box<Self>, outcome: TxOutcome) {
        if outcome == TxOutcome::Committed {
            if let Some(hook) = self.0.take() {
                hook();
            }
        }
    }
}

/// Unit of work shared by the engine, the store and the invoker.
pub struct Transaction {
    id: Uuid,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    syncs: Mutex<Vec<Box<dyn Synchronization>>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("rollback_only", &self.is_rollback_only())
            .field("synchronizations", &self.syncs.lock().len())
            .finish()
    }
}

impl Transaction {
    /// Begin a fresh transaction.
    #[must_use]
    pub fn begin() -> Self {
        let id = Uuid::new_v4();
        debug!(tx_id = %id, "transaction begun");
        Self {
            id,
            rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            syncs: Mutex::new(Vec::new()),
        }
    }

    /// Transaction id, used by stores to key staged writes.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Register a completion participant. Synchronizations run in
    /// registration order.
    pub fn register_synchronization(&self, sync: Box<dyn Synchronization>) {
        self.syncs.lock().push(sync);
    }

    /// Run `hook` only if this transaction commits.
    pub fn after_commit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_synchronization(Box::new(AfterCommit(Some(hook))));
    }

    /// Force the eventual outcome to be a rollback.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Whether the transaction is doomed.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Commit, or roll back and report why.
    pub fn commit(self) -> Result<(), TimerError> {
        if self.is_rollback_only() {
            self.finish(TxOutcome::RolledBack);
            return Err(TimerError::RolledBack("marked rollback-only".into()));
        }

        let mut failure = None;
        {
            let mut syncs = self.syncs.lock();
            for sync in syncs.iter_mut() {
                if let Err(err) = sync.before_completion() {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            None if !self.is_rollback_only() => {
                self.finish(TxOutcome::Committed);
                debug!(tx_id = %self.id, "transaction committed");
                Ok(())
            }
            None => {
                self.finish(TxOutcome::RolledBack);
                Err(TimerError::RolledBack("marked rollback-only during completion".into()))
            }
            Some(err) => {
                warn!(tx_id = %self.id, error = %err, "before-completion failed, rolling back");
                self.finish(TxOutcome::RolledBack);
                Err(TimerError::RolledBack(err.to_string()))
            }
        }
    }

    /// Discard all staged work.
    pub fn rollback(self) {
        self.finish(TxOutcome::RolledBack);
        debug!(tx_id = %self.id, "transaction rolled back");
    }

    fn finish(&self, outcome: TxOutcome) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let syncs = std::mem::take(&mut *self.syncs.lock());
        for sync in syncs {
            sync.after_completion(outcome);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::SeqCst) {
            self.finish(TxOutcome::RolledBack);
        }
    }
}

/// Source of transactions for engine-initiated work.
pub trait TransactionManager: Send + Sync {
    /// Begin a transaction.
    fn begin(&self) -> Transaction;
}

/// Transaction manager for a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransactionManager;

impl TransactionManager for LocalTransactionManager {
    fn begin(&self) -> Transaction {
        Transaction::begin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Recorder {
        seen: Arc<Mutex<Vec<TxOutcome>>>,
        fail_before: bool,
    }

    impl Synchronization for Recorder {
        fn before_completion(&mut self) -> Result<(), TimerError> {
            if self.fail_before {
                Err(TimerError::Backend("disk full".into()))
            } else {
                Ok(())
            }
        }

        fn after_completion(self: Box<Self>, outcome: TxOutcome) {
            self.seen.lock().push(outcome);
        }
    }

    #[test]
    fn test_after_commit_runs_only_on_commit() {
        let hits = Arc::new(AtomicUsize::new(0));

        let tx = Transaction::begin();
        let h = hits.clone();
        tx.after_commit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tx.commit().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let tx = Transaction::begin();
        let h = hits.clone();
        tx.after_commit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tx.rollback();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_only_commit_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tx = Transaction::begin();
        tx.register_synchronization(Box::new(Recorder {
            seen: seen.clone(),
            fail_before: false,
        }));
        tx.set_rollback_only();
        assert!(matches!(tx.commit(), Err(TimerError::RolledBack(_))));
        assert_eq!(*seen.lock(), vec![TxOutcome::RolledBack]);
    }

    #[test]
    fn test_before_completion_failure_rolls_back_everyone() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tx = Transaction::begin();
        tx.register_synchronization(Box::new(Recorder {
            seen: seen.clone(),
            fail_before: false,
        }));
        tx.register_synchronization(Box::new(Recorder {
            seen: seen.clone(),
            fail_before: true,
        }));
        assert!(tx.commit().is_err());
        assert_eq!(*seen.lock(), vec![TxOutcome::RolledBack, TxOutcome::RolledBack]);
    }

    #[test]
    fn test_drop_rolls_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let tx = LocalTransactionManager.begin();
            tx.register_synchronization(Box::new(Recorder {
                seen: seen.clone(),
                fail_before: false,
            }));
        }
        assert_eq!(*seen.lock(), vec![TxOutcome::RolledBack]);
    }
}
