//! In-memory cache of live timers, rebuilt from the store by recovery.
//!
//! Maps are behind `RwLock`s and each timer sits in its own
//! `Arc<Mutex<TimerSlot>>`, so work on different timers never contends.
//! A map lock is never held while a slot lock is taken.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::wakeup::{WakeupHandle, WakeupQueue};
use crate::core::TimerRecord;
use crate::util::serde::{OwnerId, TimerId};

/// Cached state of one timer.
#[derive(Debug)]
pub(crate) struct TimerSlot {
    pub(crate) record: TimerRecord,
    pub(crate) wakeup: Option<WakeupHandle>,
    /// A dispatch is running; no second one may start.
    pub(crate) in_flight: bool,
    /// A wakeup arrived while in flight; re-evaluated when it settles.
    pub(crate) deferred: bool,
    /// Status was changed by a bulk transition while in flight; the
    /// settled record must be written back.
    pub(crate) transitioned: bool,
}

impl TimerSlot {
    pub(crate) const fn new(record: TimerRecord) -> Self {
        Self {
            record,
            wakeup: None,
            in_flight: false,
            deferred: false,
            transitioned: false,
        }
    }

    /// Arm at the record's next fire time, or at `floor` if that is later.
    pub(crate) fn arm(&mut self, wakeups: &WakeupQueue, floor: Option<chrono::DateTime<chrono::Utc>>) {
        self.disarm(wakeups);
        if let Some(next) = self.record.next_fire_time {
            let due = floor.map_or(next, |floor| next.max(floor));
            self.wakeup = Some(wakeups.arm(self.record.id, due));
        }
    }

    pub(crate) fn disarm(&mut self, wakeups: &WakeupQueue) {
        if let Some(handle) = self.wakeup.take() {
            wakeups.disarm(&handle);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    timers: RwLock<HashMap<TimerId, Arc<Mutex<TimerSlot>>>>,
    owners: RwLock<HashMap<OwnerId, HashSet<TimerId>>>,
}

impl Registry {
    pub(crate) fn slot(&self, id: TimerId) -> Option<Arc<Mutex<TimerSlot>>> {
        self.timers.read().get(&id).cloned()
    }

    /// Return the slot for `record.id`, creating it from `record` if absent.
    /// The flag tells whether it was created.
    pub(crate) fn insert(&self, record: TimerRecord) -> (Arc<Mutex<TimerSlot>>, bool) {
        let id = record.id;
        let owner = record.owner_id.clone();
        let (slot, created) = {
            let mut timers = self.timers.write();
            if let Some(existing) = timers.get(&id) {
                (Arc::clone(existing), false)
            } else {
                let slot = Arc::new(Mutex::new(TimerSlot::new(record)));
                timers.insert(id, Arc::clone(&slot));
                (slot, true)
            }
        };
        if created {
            self.owners.write().entry(owner).or_default().insert(id);
        }
        (slot, created)
    }

    pub(crate) fn remove(&self, id: TimerId, owner_id: &str) {
        self.timers.write().remove(&id);
        let mut owners = self.owners.write();
        if let Some(ids) = owners.get_mut(owner_id) {
            ids.remove(&id);
            if ids.is_empty() {
                owners.remove(owner_id);
            }
        }
    }

    /// Slots of every cached timer of `owner_id`.
    pub(crate) fn owner_slots(&self, owner_id: &str) -> Vec<Arc<Mutex<TimerSlot>>> {
        let ids: Vec<TimerId> = self
            .owners
            .read()
            .get(owner_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let timers = self.timers.read();
        ids.iter().filter_map(|id| timers.get(id).cloned()).collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.timers.read().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.read().len()
    }
}
