//! Timer lifecycle engine.
//!
//! The engine owns the registry and the wakeup queue and is the only writer of
//! timer state. Every change is staged in the store inside a transaction and
//! reflected in memory from an after-commit hook, so a rolled-back caller
//! leaves no trace. Dispatch claims a timer by setting its in-flight flag under
//! the slot lock, then calls the invoker with no lock held.
//!
//! ```rust,ignore
//! let engine = TimerEngine::new(InMemoryTimerStore::new(), directory);
//! let tx = engine.transactions().begin();
//! let record = engine.create_timer(&tx, NewTimer::interval("billing", TimeDelta::minutes(5)))?;
//! tx.commit()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::registry::{Registry, TimerSlot};
use crate::core::schedule::CalendarEvaluator;
use crate::core::timer::NewTimerSpec;
use crate::core::wakeup::WakeupQueue;
use crate::core::{
    InvokerDirectory, LocalTransactionManager, NewTimer, TimeoutEvent, TimerError, TimerHandle,
    TimerKind, TimerRecord, TimerStatus, TimerStore, Transaction, TransactionManager,
};
use crate::util::clock::{Clock, SystemClock};
use crate::util::serde::{new_timer_id, TimerId};

/// Shortest pause before retrying an occurrence whose failure could not be
/// persisted.
const PERSIST_RETRY_FLOOR: Duration = Duration::from_secs(1);

type SharedAudit = Arc<Mutex<Box<dyn AuditSink>>>;

/// Result of one [`TimerEngine::dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered and committed; the timer is re-armed.
    Fired,
    /// Delivered and committed; it was the last occurrence.
    Expired,
    /// The callback or its commit failed; the retry policy was applied.
    Failed,
    /// Another dispatch of this timer is still running.
    Deferred,
    /// The timer is not due yet.
    NotDue,
    /// Unknown, cancelled, expired or suspended timer.
    Inactive,
    /// No invoker for the owner; the timer was suspended.
    OwnerUnbound,
}

/// Timer lifecycle engine.
pub struct TimerEngine<S: TimerStore> {
    pub(crate) store: S,
    pub(crate) transactions: Arc<dyn TransactionManager>,
    pub(crate) directory: Arc<InvokerDirectory>,
    pub(crate) evaluator: CalendarEvaluator,
    pub(crate) retry: RetryPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) wakeups: Arc<WakeupQueue>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) audit: Option<SharedAudit>,
}

impl<S: TimerStore> std::fmt::Debug for TimerEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("timers", &self.registry.len())
            .field("armed", &self.wakeups.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<S: TimerStore> TimerEngine<S> {
    /// Engine over `store` delivering through `directory`, using the system
    /// clock and local transactions.
    pub fn new(store: S, directory: Arc<InvokerDirectory>) -> Self {
        Self {
            store,
            transactions: Arc::new(LocalTransactionManager),
            directory,
            evaluator: CalendarEvaluator::default(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            wakeups: Arc::new(WakeupQueue::new()),
            registry: Arc::new(Registry::default()),
            audit: None,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the transaction manager used for engine-initiated work.
    #[must_use]
    pub fn with_transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the failure policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the calendar evaluator.
    #[must_use]
    pub const fn with_evaluator(mut self, evaluator: CalendarEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(Mutex::new(audit)));
        self
    }

    /// Underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Owner directory.
    pub fn directory(&self) -> &Arc<InvokerDirectory> {
        &self.directory
    }

    /// Transaction manager.
    pub fn transactions(&self) -> &Arc<dyn TransactionManager> {
        &self.transactions
    }

    /// Clock the engine reads "now" from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wakeup queue the dispatch pool drains.
    pub fn wakeups(&self) -> &Arc<WakeupQueue> {
        &self.wakeups
    }

    /// Failure policy in force.
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether `id` currently has a wakeup armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.wakeups.is_armed(id)
    }

    /// Cached status of `id`, `None` once it has left the registry.
    pub fn status(&self, id: TimerId) -> Option<TimerStatus> {
        self.registry.slot(id).map(|slot| slot.lock().record.status)
    }

    /// Create a timer inside `tx`.
    ///
    /// The record is installed and armed only when `tx` commits. A schedule
    /// with no future occurrence comes back Expired and is not stored.
    pub fn create_timer(
        &self,
        tx: &Transaction,
        request: NewTimer,
    ) -> Result<TimerRecord, TimerError> {
        if !self.directory.is_registered(&request.owner_id) {
            return Err(TimerError::OwnerNotBound(request.owner_id));
        }
        let now = self.clock.now();
        let (kind, first) = match request.spec {
            NewTimerSpec::Calendar(spec) => {
                let schedule = spec.build()?;
                let first = self.evaluator.next_timeout(&schedule, now);
                (TimerKind::Calendar { schedule }, first)
            }
            NewTimerSpec::Interval {
                interval,
                initial_expiration,
            } => {
                let interval_ms = u64::try_from(interval.num_milliseconds())
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| {
                        TimerError::InvalidSchedule(format!(
                            "interval must be positive, got {interval}"
                        ))
                    })?;
                let first = initial_expiration.or_else(|| now.checked_add_signed(interval));
                (TimerKind::Interval { interval_ms }, first)
            }
        };

        let mut record = TimerRecord {
            id: new_timer_id(),
            owner_id: request.owner_id,
            kind,
            initial_date: now,
            next_fire_time: first,
            previous_run: None,
            status: TimerStatus::Active,
            auto_timer: request.auto_timer,
            timeout_method: request.timeout_method,
            info: request.info,
            failed_attempts: 0,
        };

        if first.is_none() {
            record.status = TimerStatus::Expired;
            info!(
                timer_id = %record.id,
                owner_id = %record.owner_id,
                "schedule has no future occurrence, timer created expired"
            );
            return Ok(record);
        }

        self.store.save(tx, &record)?;

        let registry = Arc::clone(&self.registry);
        let wakeups = Arc::clone(&self.wakeups);
        let audit = self.audit.clone();
        let installed = record.clone();
        tx.after_commit(move || {
            let (slot, _) = registry.insert(installed.clone());
            slot.lock().arm(&wakeups, None);
            record_audit(audit.as_ref(), &installed, AuditAction::Created, None);
            debug!(
                timer_id = %installed.id,
                owner_id = %installed.owner_id,
                next_fire_time = ?installed.next_fire_time,
                "timer armed"
            );
        });
        Ok(record)
    }

    /// Cancel `id` inside `tx`.
    ///
    /// Returns `false` for unknown or already terminal timers. A dispatch
    /// already running is allowed to finish but will not re-arm.
    pub fn cancel_timer(
        &self,
        tx: &Transaction,
        id: TimerId,
    ) -> Result<bool, TimerError> {
        let cached = self.registry.slot(id).map(|slot| slot.lock().record.clone());
        let record = match cached {
            Some(record) => Some(record),
            None => self.store.load(tx, id)?,
        };
        let Some(record) = record else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }

        self.store.delete(tx, id)?;

        let registry = Arc::clone(&self.registry);
        let wakeups = Arc::clone(&self.wakeups);
        let audit = self.audit.clone();
        tx.after_commit(move || {
            if let Some(slot) = registry.slot(id) {
                let mut guard = slot.lock();
                guard.disarm(&wakeups);
                guard.record.status = TimerStatus::Cancelled;
                guard.record.next_fire_time = None;
                let in_flight = guard.in_flight;
                drop(guard);
                if !in_flight {
                    registry.remove(id, &record.owner_id);
                }
            }
            record_audit(audit.as_ref(), &record, AuditAction::Cancelled, None);
            debug!(timer_id = %id, owner_id = %record.owner_id, "timer cancelled");
        });
        Ok(true)
    }

    /// Deliver the due occurrence of `id`.
    ///
    /// At most one dispatch per timer runs at a time. The advanced record is
    /// persisted in the same transaction as the callback, and in-memory state
    /// changes only after that transaction commits.
    pub async fn dispatch(&self, id: TimerId) -> DispatchOutcome {
        let Some(slot) = self.registry.slot(id) else {
            return DispatchOutcome::Inactive;
        };
        let now = self.clock.now();
        let (record, scheduled) = {
            let mut guard = slot.lock();
            if guard.record.status != TimerStatus::Active {
                return DispatchOutcome::Inactive;
            }
            let Some(scheduled) = guard.record.next_fire_time else {
                return DispatchOutcome::Inactive;
            };
            if guard.in_flight {
                guard.deferred = true;
                debug!(timer_id = %id, "dispatch deferred, previous one still running");
                return DispatchOutcome::Deferred;
            }
            if scheduled > now {
                if guard.wakeup.is_none() {
                    guard.arm(&self.wakeups, None);
                }
                return DispatchOutcome::NotDue;
            }
            guard.disarm(&self.wakeups);
            guard.in_flight = true;
            (guard.record.clone(), scheduled)
        };

        let Some(invoker) = self.directory.get(&record.owner_id) else {
            self.suspend_unbound(&slot, record);
            return DispatchOutcome::OwnerUnbound;
        };

        let event = TimeoutEvent {
            timer_id: id,
            owner_id: record.owner_id.clone(),
            scheduled_at: scheduled,
            info: record.info.clone(),
            timeout_method: record.timeout_method.clone(),
            attempt: record.failed_attempts.saturating_add(1),
        };
        debug!(timer_id = %id, owner_id = %record.owner_id, scheduled_at = %scheduled, attempt = event.attempt, "dispatching timeout");

        let tx = self.transactions.begin();
        let invoked = invoker.invoke_timeout(&tx, &event).await;
        let now = self.clock.now();

        let failure = match invoked {
            Ok(()) => {
                let mut advanced = record.clone();
                advanced.previous_run = Some(scheduled);
                advanced.failed_attempts = 0;
                advanced.next_fire_time = record.next_after(&self.evaluator, scheduled, now);
                if advanced.next_fire_time.is_none() {
                    advanced.status = TimerStatus::Expired;
                }
                let write = if advanced.status == TimerStatus::Expired {
                    self.store.delete(&tx, id)
                } else {
                    self.store.save(&tx, &advanced)
                };
                match write.and_then(|()| tx.commit()) {
                    Ok(()) => {
                        let expired = advanced.status == TimerStatus::Expired;
                        let action = if expired {
                            AuditAction::Expired
                        } else {
                            AuditAction::Fired
                        };
                        record_audit(self.audit.as_ref(), &advanced, action, None);
                        debug!(timer_id = %id, next_fire_time = ?advanced.next_fire_time, "timeout delivered");
                        self.settle(&slot, advanced, None);
                        return if expired {
                            DispatchOutcome::Expired
                        } else {
                            DispatchOutcome::Fired
                        };
                    }
                    Err(err) => err.to_string(),
                }
            }
            Err(err) => {
                tx.rollback();
                format!("{err:#}")
            }
        };

        let err = TimerError::Invocation {
            timer_id: id,
            reason: failure,
        };
        warn!(timer_id = %id, owner_id = %record.owner_id, error = %err, "timeout delivery failed");
        record_audit(self.audit.as_ref(), &record, AuditAction::Failed, Some(err.to_string()));
        self.apply_failure(&slot, record, scheduled, now);
        DispatchOutcome::Failed
    }

    fn apply_failure(
        &self,
        slot: &Arc<Mutex<TimerSlot>>,
        record: TimerRecord,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let mut decided = record.clone();
        let mut floor = None;
        match self.retry {
            RetryPolicy::Immediate { max_retries, .. } if record.failed_attempts < max_retries => {
                decided.failed_attempts += 1;
                floor = Some(after(now, self.retry.delay()));
            }
            _ => {
                decided.failed_attempts = 0;
                decided.next_fire_time = record.next_after(&self.evaluator, scheduled, now);
                if decided.next_fire_time.is_none() {
                    decided.status = TimerStatus::Expired;
                }
            }
        }

        match self.persist(&decided) {
            Ok(()) => {
                if decided.status == TimerStatus::Expired {
                    record_audit(self.audit.as_ref(), &decided, AuditAction::Expired, None);
                }
                self.settle(slot, decided, floor);
            }
            Err(err) => {
                error!(timer_id = %record.id, error = %err, "could not persist failed dispatch, retrying occurrence");
                let retry_at = after(now, self.retry.delay().max(PERSIST_RETRY_FLOOR));
                self.settle(slot, record, Some(retry_at));
            }
        }
    }

    fn suspend_unbound(&self, slot: &Arc<Mutex<TimerSlot>>, record: TimerRecord) {
        warn!(timer_id = %record.id, owner_id = %record.owner_id, "owner has no invoker, suspending timer");
        let mut suspended = record;
        suspended.status = TimerStatus::Suspended;
        match self.persist(&suspended) {
            Ok(()) => {
                record_audit(self.audit.as_ref(), &suspended, AuditAction::Suspended, None);
                self.settle(slot, suspended, None);
            }
            Err(err) => {
                error!(timer_id = %suspended.id, error = %err, "could not persist suspension");
                let mut guard = slot.lock();
                guard.in_flight = false;
                guard.deferred = false;
                guard.transitioned = false;
                let retry_at = after(self.clock.now(), PERSIST_RETRY_FLOOR);
                guard.arm(&self.wakeups, Some(retry_at));
            }
        }
    }

    /// Save or delete `record` in its own transaction.
    fn persist(&self, record: &TimerRecord) -> Result<(), TimerError> {
        let tx = self.transactions.begin();
        if record.status.is_terminal() {
            self.store.delete(&tx, record.id)?;
        } else {
            self.store.save(&tx, record)?;
        }
        tx.commit()
    }

    /// Release the in-flight claim and install `updated`, honouring a cancel
    /// or suspend that landed while the dispatch was running.
    fn settle(
        &self,
        slot: &Arc<Mutex<TimerSlot>>,
        updated: TimerRecord,
        floor: Option<DateTime<Utc>>,
    ) {
        let mut guard = slot.lock();
        guard.in_flight = false;
        if std::mem::take(&mut guard.deferred) {
            debug!(timer_id = %updated.id, "re-evaluating deferred wakeup");
        }
        // A bulk transition committed a pre-dispatch copy; the settled record
        // has to overwrite it.
        let transitioned = std::mem::take(&mut guard.transitioned);

        match guard.record.status {
            TimerStatus::Cancelled => {
                guard.disarm(&self.wakeups);
                let id = guard.record.id;
                let owner = guard.record.owner_id.clone();
                drop(guard);
                self.registry.remove(id, &owner);
                // The dispatch may have re-saved a record the cancel deleted.
                let tx = self.transactions.begin();
                if let Err(err) = self.store.delete(&tx, id).and_then(|()| tx.commit()) {
                    error!(timer_id = %id, error = %err, "failed to purge cancelled timer");
                }
                return;
            }
            TimerStatus::Suspended if updated.status == TimerStatus::Active => {
                let mut merged = updated;
                merged.status = TimerStatus::Suspended;
                guard.record = merged.clone();
                drop(guard);
                if let Err(err) = self.persist(&merged) {
                    error!(timer_id = %merged.id, error = %err, "failed to persist suspension after dispatch");
                }
                return;
            }
            _ => {}
        }

        guard.record = updated;
        let settled = transitioned.then(|| guard.record.clone());
        if guard.record.status.is_terminal() {
            guard.disarm(&self.wakeups);
            let id = guard.record.id;
            let owner = guard.record.owner_id.clone();
            drop(guard);
            self.registry.remove(id, &owner);
        } else {
            if guard.record.status == TimerStatus::Active {
                guard.arm(&self.wakeups, floor);
            }
            drop(guard);
        }
        if let Some(record) = settled {
            if let Err(err) = self.persist(&record) {
                error!(timer_id = %record.id, error = %err, "failed to persist settled record after transition");
            }
        }
    }

    /// Disarm and persist every Active timer of `owner_id` as Suspended.
    pub fn suspend_all(&self, owner_id: &str) -> Result<usize, TimerError> {
        let count = self.transition_all(
            owner_id,
            TimerStatus::Active,
            TimerStatus::Suspended,
            |slot| {
                slot.disarm(&self.wakeups);
                record_audit(self.audit.as_ref(), &slot.record, AuditAction::Suspended, None);
            },
        )?;
        info!(owner_id, count, "timers suspended");
        Ok(count)
    }

    /// Re-activate every Suspended timer of `owner_id`; overdue ones fire
    /// immediately.
    pub fn resume_all(&self, owner_id: &str) -> Result<usize, TimerError> {
        if !self.directory.is_registered(owner_id) {
            return Err(TimerError::OwnerNotBound(owner_id.to_string()));
        }
        let count = self.transition_all(
            owner_id,
            TimerStatus::Suspended,
            TimerStatus::Active,
            |slot| {
                if !slot.in_flight {
                    slot.arm(&self.wakeups, None);
                }
                record_audit(self.audit.as_ref(), &slot.record, AuditAction::Resumed, None);
            },
        )?;
        info!(owner_id, count, "timers resumed");
        Ok(count)
    }

    /// Persist `from -> to` for every matching timer of `owner_id` in one
    /// transaction, then run `apply` on each changed slot.
    ///
    /// The slot locks are held from selection through commit, so no dispatch
    /// can claim or settle these timers in between. A slot already in flight
    /// is flagged so its settle writes the final record over the copy
    /// committed here.
    fn transition_all<F>(
        &self,
        owner_id: &str,
        from: TimerStatus,
        to: TimerStatus,
        mut apply: F,
    ) -> Result<usize, TimerError>
    where
        F: FnMut(&mut TimerSlot),
    {
        let mut slots: Vec<_> = self
            .registry
            .owner_slots(owner_id)
            .into_iter()
            .map(|slot| {
                let id = slot.lock().record.id;
                (id, slot)
            })
            .collect();
        // Fixed lock order so overlapping bulk transitions cannot deadlock.
        slots.sort_by_key(|(id, _)| *id);

        let mut guards: Vec<_> = slots
            .iter()
            .map(|(_, slot)| slot.lock())
            .filter(|guard| guard.record.status == from)
            .collect();
        if guards.is_empty() {
            return Ok(0);
        }

        let tx = self.transactions.begin();
        for guard in &guards {
            let mut updated = guard.record.clone();
            updated.status = to;
            self.store.save(&tx, &updated)?;
        }
        tx.commit()?;

        for guard in &mut guards {
            guard.record.status = to;
            if guard.in_flight {
                guard.transitioned = true;
            }
            apply(&mut **guard);
        }
        Ok(guards.len())
    }

    /// Live Active record behind `handle`.
    pub fn timer(&self, handle: &TimerHandle) -> Result<TimerRecord, TimerError> {
        if !self.directory.is_registered(&handle.owner_id) {
            return Err(TimerError::OwnerNotBound(handle.owner_id.clone()));
        }
        self.registry
            .slot(handle.timer_id)
            .map(|slot| slot.lock().record.clone())
            .filter(|record| record.is_active() && record.owner_id == handle.owner_id)
            .ok_or(TimerError::NotActive(handle.timer_id))
    }

    /// Active timers of `owner_id`, soonest first.
    pub fn timers(&self, owner_id: &str) -> Vec<TimerRecord> {
        let mut records: Vec<_> = self
            .registry
            .owner_slots(owner_id)
            .iter()
            .map(|slot| slot.lock().record.clone())
            .filter(TimerRecord::is_active)
            .collect();
        records.sort_by_key(|r| (r.next_fire_time, r.id));
        records
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

pub(crate) fn record_audit(
    audit: Option<&SharedAudit>,
    record: &TimerRecord,
    action: AuditAction,
    detail: Option<String>,
) {
    if let Some(sink) = audit {
        sink.lock().record(build_audit_event(
            record.id,
            record.owner_id.clone(),
            action,
            detail,
        ));
    }
}
