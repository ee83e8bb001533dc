//! In-memory timer store with transactional staging.
//!
//! Writes are buffered per transaction id. A synchronization registered on
//! the first write applies them under the write lock in `before_completion`
//! (so a failing journal append vetoes the commit) and undoes them if another
//! participant later forces a rollback. An undo only restores records still
//! holding the value this transaction wrote.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

use crate::core::{
    Synchronization, TimerError, TimerRecord, TimerStore, Transaction, TxOutcome,
};
use crate::util::serde::TimerId;

/// One write against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert or replace.
    Save(TimerRecord),
    /// Remove.
    Delete(TimerId),
}

impl StoreOp {
    const fn id(&self) -> TimerId {
        match self {
            Self::Save(record) => record.id,
            Self::Delete(id) => *id,
        }
    }
}

/// Durable sink for committed writes.
pub trait Journal: Send + Sync {
    /// Persist `ops` before they become visible; an error aborts the commit.
    fn append(&self, ops: &[StoreOp]) -> Result<(), TimerError>;
}

struct StoreInner {
    committed: RwLock<HashMap<TimerId, TimerRecord>>,
    staged: Mutex<HashMap<Uuid, Vec<StoreOp>>>,
    journal: Option<Box<dyn Journal>>,
}

/// In-memory store for testing and dev. Clones share state.
#[derive(Clone)]
pub struct InMemoryTimerStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryTimerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTimerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTimerStore")
            .field("committed", &self.len())
            .field("journaled", &self.inner.journal.is_some())
            .finish()
    }
}

impl InMemoryTimerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::build(HashMap::new(), None)
    }

    /// Store seeded with `records` that journals every commit.
    pub fn with_journal(
        records: HashMap<TimerId, TimerRecord>,
        journal: Box<dyn Journal>,
    ) -> Self {
        Self::build(records, Some(journal))
    }

    fn build(records: HashMap<TimerId, TimerRecord>, journal: Option<Box<dyn Journal>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                committed: RwLock::new(records),
                staged: Mutex::new(HashMap::new()),
                journal,
            }),
        }
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.committed.read().len()
    }

    /// Whether no records are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every committed record.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TimerRecord> {
        self.inner.committed.read().values().cloned().collect()
    }

    /// Committed copy of one record, outside any transaction.
    #[must_use]
    pub fn committed(&self, id: TimerId) -> Option<TimerRecord> {
        self.inner.committed.read().get(&id).cloned()
    }

    fn stage(&self, tx: &Transaction, op: StoreOp) {
        let first = {
            let mut staged = self.inner.staged.lock();
            let ops = staged.entry(tx.id()).or_default();
            ops.push(op);
            ops.len() == 1
        };
        if first {
            tx.register_synchronization(Box::new(ApplyOnCommit {
                inner: Arc::clone(&self.inner),
                tx_id: tx.id(),
                undo: None,
            }));
        }
    }

    fn staged_ops(&self, tx: &Transaction) -> Vec<StoreOp> {
        self.inner
            .staged
            .lock()
            .get(&tx.id())
            .cloned()
            .unwrap_or_default()
    }
}

/// One applied write: the value before and after it.
struct Applied {
    id: TimerId,
    before: Option<TimerRecord>,
    after: Option<TimerRecord>,
}

/// Apply `ops` and return what they changed, latest first.
fn apply(committed: &mut HashMap<TimerId, TimerRecord>, ops: Vec<StoreOp>) -> Vec<Applied> {
    let mut applied = Vec::with_capacity(ops.len());
    for op in ops {
        let id = op.id();
        let (before, after) = match op {
            StoreOp::Save(record) => (committed.insert(id, record.clone()), Some(record)),
            StoreOp::Delete(id) => (committed.remove(&id), None),
        };
        applied.push(Applied { id, before, after });
    }
    applied.reverse();
    applied
}

/// Reverse `applied` where the record still holds the value written, and
/// return the compensating ops. Later writers keep their value.
fn revert(committed: &mut HashMap<TimerId, TimerRecord>, applied: Vec<Applied>) -> Vec<StoreOp> {
    let mut ops = Vec::with_capacity(applied.len());
    for Applied { id, before, after } in applied {
        if committed.get(&id) != after.as_ref() {
            warn!(timer_id = %id, "record changed by a later commit, keeping it");
            continue;
        }
        match before {
            Some(record) => {
                committed.insert(id, record.clone());
                ops.push(StoreOp::Save(record));
            }
            None => {
                committed.remove(&id);
                ops.push(StoreOp::Delete(id));
            }
        }
    }
    ops
}

struct ApplyOnCommit {
    inner: Arc<StoreInner>,
    tx_id: Uuid,
    undo: Option<Vec<Applied>>,
}

impl Synchronization for ApplyOnCommit {
    fn before_completion(&mut self) -> Result<(), TimerError> {
        let ops = self
            .inner
            .staged
            .lock()
            .remove(&self.tx_id)
            .unwrap_or_default();
        if ops.is_empty() {
            return Ok(());
        }
        let mut committed = self.inner.committed.write();
        if let Some(journal) = &self.inner.journal {
            journal.append(&ops)?;
        }
        self.undo = Some(apply(&mut committed, ops));
        Ok(())
    }

    fn after_completion(self: Box<Self>, outcome: TxOutcome) {
        let Self { inner, tx_id, undo } = *self;
        match (outcome, undo) {
            (TxOutcome::Committed, _) => {}
            (TxOutcome::RolledBack, None) => {
                inner.staged.lock().remove(&tx_id);
            }
            (TxOutcome::RolledBack, Some(undo)) => {
                let mut committed = inner.committed.write();
                let compensation = revert(&mut committed, undo);
                if let Some(journal) = inner.journal.as_ref().filter(|_| !compensation.is_empty()) {
                    if let Err(err) = journal.append(&compensation) {
                        error!(tx_id = %tx_id, error = %err, "failed to journal compensating writes");
                    }
                }
            }
        }
    }
}

impl TimerStore for InMemoryTimerStore {
    fn save(&self, tx: &Transaction, record: &TimerRecord) -> Result<(), TimerError> {
        self.stage(tx, StoreOp::Save(record.clone()));
        Ok(())
    }

    fn load(&self, tx: &Transaction, id: TimerId) -> Result<Option<TimerRecord>, TimerError> {
        let own = self
            .staged_ops(tx)
            .into_iter()
            .rev()
            .find(|op| op.id() == id);
        Ok(match own {
            Some(StoreOp::Save(record)) => Some(record),
            Some(StoreOp::Delete(_)) => None,
            None => self.inner.committed.read().get(&id).cloned(),
        })
    }

    fn load_all_active(
        &self,
        tx: &Transaction,
        owner_id: &str,
    ) -> Result<Vec<TimerRecord>, TimerError> {
        let mut view: HashMap<TimerId, TimerRecord> = self
            .inner
            .committed
            .read()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| (r.id, r.clone()))
            .collect();
        for op in self.staged_ops(tx) {
            match op {
                StoreOp::Save(record) if record.owner_id == owner_id => {
                    view.insert(record.id, record);
                }
                StoreOp::Save(record) => {
                    view.remove(&record.id);
                }
                StoreOp::Delete(id) => {
                    view.remove(&id);
                }
            }
        }
        let mut records: Vec<_> = view
            .into_values()
            .filter(|r| !r.status.is_terminal())
            .collect();
        records.sort_by_key(|r| (r.next_fire_time, r.id));
        Ok(records)
    }

    fn delete(&self, tx: &Transaction, id: TimerId) -> Result<(), TimerError> {
        self.stage(tx, StoreOp::Delete(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TimerKind, TimerStatus};
    use chrono::Utc;

    fn record(owner: &str) -> TimerRecord {
        TimerRecord {
            id: crate::util::serde::new_timer_id(),
            owner_id: owner.into(),
            kind: TimerKind::Interval { interval_ms: 1_000 },
            initial_date: Utc::now(),
            next_fire_time: Some(Utc::now()),
            previous_run: None,
            status: TimerStatus::Active,
            auto_timer: false,
            timeout_method: None,
            info: None,
            failed_attempts: 0,
        }
    }

    struct FailingJournal;

    impl Journal for FailingJournal {
        fn append(&self, _ops: &[StoreOp]) -> Result<(), TimerError> {
            Err(TimerError::Backend("journal unavailable".into()))
        }
    }

    #[test]
    fn test_writes_invisible_until_commit() {
        let store = InMemoryTimerStore::new();
        let r = record("a");

        let tx = Transaction::begin();
        store.save(&tx, &r).unwrap();
        assert_eq!(store.load(&tx, r.id).unwrap(), Some(r.clone()));
        let other = Transaction::begin();
        assert_eq!(store.load(&other, r.id).unwrap(), None);
        tx.commit().unwrap();

        assert_eq!(store.load(&other, r.id).unwrap(), Some(r));
    }

    #[test]
    fn test_rollback_discards_staged() {
        let store = InMemoryTimerStore::new();
        let tx = Transaction::begin();
        store.save(&tx, &record("a")).unwrap();
        tx.rollback();
        assert!(store.is_empty());
    }

    #[test]
    fn test_failing_journal_vetoes_commit() {
        let store = InMemoryTimerStore::with_journal(HashMap::new(), Box::new(FailingJournal));
        let tx = Transaction::begin();
        store.save(&tx, &record("a")).unwrap();
        assert!(matches!(tx.commit(), Err(TimerError::RolledBack(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_all_active_merges_own_writes() {
        let store = InMemoryTimerStore::new();
        let kept = record("a");
        let gone = record("a");
        let foreign = record("b");
        let tx = Transaction::begin();
        for r in [&kept, &gone, &foreign] {
            store.save(&tx, r).unwrap();
        }
        tx.commit().unwrap();

        let tx = Transaction::begin();
        store.delete(&tx, gone.id).unwrap();
        let mut suspended = kept.clone();
        suspended.status = TimerStatus::Suspended;
        store.save(&tx, &suspended).unwrap();
        let active = store.load_all_active(&tx, "a").unwrap();
        assert_eq!(active, vec![suspended]);
    }

    #[test]
    fn test_compensation_after_late_veto() {
        let store = InMemoryTimerStore::new();
        let r = record("a");
        let tx = Transaction::begin();
        store.save(&tx, &r).unwrap();
        // A participant registered after the store fails its own check.
        struct Veto;
        impl Synchronization for Veto {
            fn before_completion(&mut self) -> Result<(), TimerError> {
                Err(TimerError::Backend("veto".into()))
            }
            fn after_completion(self: Box<Self>, _outcome: TxOutcome) {}
        }
        tx.register_synchronization(Box::new(Veto));
        assert!(tx.commit().is_err());
        assert!(store.is_empty());
    }

    /// Commits its own write to the store, then vetoes the outer commit.
    struct CommitThenVeto {
        store: InMemoryTimerStore,
        record: TimerRecord,
    }

    impl Synchronization for CommitThenVeto {
        fn before_completion(&mut self) -> Result<(), TimerError> {
            let tx = Transaction::begin();
            self.store.save(&tx, &self.record)?;
            tx.commit()?;
            Err(TimerError::Backend("veto".into()))
        }
        fn after_completion(self: Box<Self>, _outcome: TxOutcome) {}
    }

    #[test]
    fn test_late_veto_keeps_concurrent_commit() {
        let store = InMemoryTimerStore::new();
        let original = record("a");
        let tx = Transaction::begin();
        store.save(&tx, &original).unwrap();
        tx.commit().unwrap();

        let mut ours = original.clone();
        ours.failed_attempts = 1;
        let mut theirs = original.clone();
        theirs.status = TimerStatus::Suspended;
        let untouched = record("a");

        let tx = Transaction::begin();
        store.save(&tx, &ours).unwrap();
        store.save(&tx, &untouched).unwrap();
        tx.register_synchronization(Box::new(CommitThenVeto {
            store: store.clone(),
            record: theirs.clone(),
        }));
        assert!(tx.commit().is_err());

        assert_eq!(store.committed(original.id), Some(theirs));
        assert_eq!(store.committed(untouched.id), None);
    }

    #[test]
    fn test_late_veto_restores_own_writes() {
        let store = InMemoryTimerStore::new();
        let original = record("a");
        let tx = Transaction::begin();
        store.save(&tx, &original).unwrap();
        tx.commit().unwrap();

        let mut first = original.clone();
        first.failed_attempts = 1;
        let mut second = original.clone();
        second.failed_attempts = 2;
        let tx = Transaction::begin();
        store.save(&tx, &first).unwrap();
        store.save(&tx, &second).unwrap();
        struct Veto;
        impl Synchronization for Veto {
            fn before_completion(&mut self) -> Result<(), TimerError> {
                Err(TimerError::Backend("veto".into()))
            }
            fn after_completion(self: Box<Self>, _outcome: TxOutcome) {}
        }
        tx.register_synchronization(Box::new(Veto));
        assert!(tx.commit().is_err());

        assert_eq!(store.committed(original.id), Some(original));
    }
}
