//! Re-arming persisted timers after a restart.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::audit::AuditAction;
use crate::core::engine::record_audit;
use crate::core::{TimerEngine, TimerError, TimerStatus, TimerStore};

/// Loads an owner's persisted timers back into a running engine.
pub struct RecoveryCoordinator<S: TimerStore> {
    engine: Arc<TimerEngine<S>>,
}

impl<S: TimerStore> std::fmt::Debug for RecoveryCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator").finish_non_exhaustive()
    }
}

impl<S: TimerStore> RecoveryCoordinator<S> {
    /// Coordinator for `engine`.
    pub const fn new(engine: Arc<TimerEngine<S>>) -> Self {
        Self { engine }
    }

    /// Re-arm every non-terminal timer of `owner_id` and return how many
    /// were armed.
    ///
    /// Overdue timers are armed for immediate dispatch and fire once. Timers
    /// already armed or in flight are left alone, so calling this twice is
    /// harmless. When the owner has no invoker every record is persisted as
    /// Suspended and `RecoveryInconsistency` is returned.
    pub fn recover(&self, owner_id: &str) -> Result<usize, TimerError> {
        let engine = &self.engine;
        let now = engine.clock.now();
        let tx = engine.transactions.begin();
        let records = engine.store.load_all_active(&tx, owner_id)?;

        if !engine.directory.is_registered(owner_id) {
            let suspended = records.len();
            for mut record in records {
                if record.status != TimerStatus::Suspended {
                    record.status = TimerStatus::Suspended;
                    engine.store.save(&tx, &record)?;
                }
            }
            tx.commit()?;
            warn!(owner_id, suspended, "no invoker bound for owner, timers left suspended");
            return Err(TimerError::RecoveryInconsistency {
                owner_id: owner_id.to_string(),
                suspended,
            });
        }

        let mut to_arm = Vec::with_capacity(records.len());
        for mut record in records {
            if let Some(slot) = engine.registry.slot(record.id) {
                let guard = slot.lock();
                if guard.in_flight || guard.wakeup.is_some() {
                    debug!(timer_id = %record.id, "already live, skipping");
                    continue;
                }
            }

            let mut dirty = record.status != TimerStatus::Active;
            record.status = TimerStatus::Active;
            if record.next_fire_time.is_none() {
                let from = record.previous_run.unwrap_or(record.initial_date);
                record.next_fire_time = record.next_after(&engine.evaluator, from, now);
                dirty = true;
            }
            if record.next_fire_time.is_none() {
                debug!(timer_id = %record.id, "no occurrence left, removing");
                engine.store.delete(&tx, record.id)?;
                continue;
            }
            if dirty {
                engine.store.save(&tx, &record)?;
            }
            to_arm.push(record);
        }

        let count = to_arm.len();
        let registry = Arc::clone(&engine.registry);
        let wakeups = Arc::clone(&engine.wakeups);
        let audit = engine.audit.clone();
        tx.after_commit(move || {
            for record in to_arm {
                let (slot, _) = registry.insert(record.clone());
                let mut guard = slot.lock();
                if guard.in_flight || guard.wakeup.is_some() {
                    continue;
                }
                guard.record = record;
                guard.arm(&wakeups, None);
                record_audit(audit.as_ref(), &guard.record, AuditAction::Recovered, None);
            }
        });
        tx.commit()?;

        info!(owner_id, count, "timers recovered");
        Ok(count)
    }
}
