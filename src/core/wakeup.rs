//! Deadline queue that wakes the dispatcher when timers come due.
//!
//! A min-heap of `(due, seq, id)` plus a map of the currently armed sequence
//! per id. Re-arming an id bumps its sequence; heap entries whose sequence no
//! longer matches are skipped when popped, and the heap is rebuilt once they
//! outnumber the live ones. Waiters park on a `Condvar` until the earliest
//! deadline, a newer earlier deadline, or shutdown.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::util::clock::Clock;
use crate::util::serde::TimerId;

/// Proof that a wakeup was armed, used to disarm exactly that wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupHandle {
    /// Armed timer.
    pub timer_id: TimerId,
    /// Arming sequence number.
    pub seq: u64,
    /// Instant the wakeup fires at.
    pub due: DateTime<Utc>,
}

/// State guarded by the queue mutex.
struct WakeState {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, TimerId)>>,
    armed: HashMap<TimerId, u64>,
    next_seq: u64,
    shutdown: bool,
    /// Bumped by every shutdown; a waiter from an older epoch never resumes.
    epoch: u64,
}

/// Heaps at or below this size are never rebuilt.
const COMPACT_MIN: usize = 64;

impl WakeState {
    fn discard_stale(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.heap.peek() {
            if self.armed.get(id) == Some(seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Drop stale entries once they outnumber the armed ones.
    fn compact_if_sparse(&mut self) {
        let stale = self.heap.len().saturating_sub(self.armed.len());
        if self.heap.len() > COMPACT_MIN && stale > self.armed.len() {
            let armed = &self.armed;
            self.heap.retain(|Reverse((_, seq, id))| armed.get(id) == Some(seq));
        }
    }
}

/// Condvar-backed wakeup queue.
pub struct WakeupQueue {
    state: Mutex<WakeState>,
    condvar: Condvar,
}

impl Default for WakeupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WakeupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeupQueue").field("armed", &self.len()).finish()
    }
}

impl WakeupQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WakeState {
                heap: BinaryHeap::new(),
                armed: HashMap::new(),
                next_seq: 0,
                shutdown: false,
                epoch: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Arm `timer_id` at `due`, replacing any wakeup it already had.
    pub fn arm(&self, timer_id: TimerId, due: DateTime<Utc>) -> WakeupHandle {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.armed.insert(timer_id, seq);
        state.heap.push(Reverse((due, seq, timer_id)));
        state.compact_if_sparse();
        drop(state);
        self.condvar.notify_all();
        WakeupHandle { timer_id, seq, due }
    }

    /// Disarm the wakeup behind `handle`. A newer arming of the same id is
    /// left alone. Returns whether anything was disarmed.
    pub fn disarm(&self, handle: &WakeupHandle) -> bool {
        let mut state = self.state.lock();
        if state.armed.get(&handle.timer_id) == Some(&handle.seq) {
            state.armed.remove(&handle.timer_id);
            state.compact_if_sparse();
            true
        } else {
            false
        }
    }

    /// Whether `timer_id` has a live wakeup.
    pub fn is_armed(&self, timer_id: TimerId) -> bool {
        self.state.lock().armed.contains_key(&timer_id)
    }

    /// Remove and return every wakeup due at or before `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<WakeupHandle> {
        let mut state = self.state.lock();
        Self::drain_due(&mut state, now)
    }

    fn drain_due(state: &mut WakeState, now: DateTime<Utc>) -> Vec<WakeupHandle> {
        let mut due = Vec::new();
        loop {
            state.discard_stale();
            match state.heap.peek() {
                Some(Reverse((at, _, _))) if *at <= now => {}
                _ => break,
            }
            if let Some(Reverse((at, seq, timer_id))) = state.heap.pop() {
                state.armed.remove(&timer_id);
                due.push(WakeupHandle {
                    timer_id,
                    seq,
                    due: at,
                });
            }
        }
        due
    }

    /// Earliest live deadline.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock();
        state.discard_stale();
        state.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Block until at least one wakeup is due and return the due batch.
    ///
    /// Parks at most `max_park` at a time so clocks that jump are noticed.
    /// Returns `None` once [`shutdown`](Self::shutdown) has been called,
    /// even if the queue was reopened meanwhile.
    pub fn wait_due(&self, clock: &dyn Clock, max_park: Duration) -> Option<Vec<WakeupHandle>> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        loop {
            if state.shutdown || state.epoch != epoch {
                return None;
            }
            let now = clock.now();
            let due = Self::drain_due(&mut state, now);
            if !due.is_empty() {
                return Some(due);
            }
            let park = state
                .heap
                .peek()
                .and_then(|Reverse((at, _, _))| (*at - now).to_std().ok())
                .map_or(max_park, |until| until.min(max_park));
            self.condvar.wait_for(&mut state, park);
        }
    }

    /// Wake every waiter and make them return `None`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.epoch += 1;
        drop(state);
        self.condvar.notify_all();
    }

    /// Accept waiters again after [`shutdown`](Self::shutdown). Armed
    /// wakeups are kept.
    pub fn reopen(&self) {
        self.state.lock().shutdown = false;
    }

    /// Number of live wakeups.
    pub fn len(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Whether nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use crate::util::serde::new_timer_id;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::Arc;
    use std::thread;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let queue = WakeupQueue::new();
        let (a, b, c) = (new_timer_id(), new_timer_id(), new_timer_id());
        queue.arm(b, t0() + TimeDelta::seconds(2));
        queue.arm(a, t0() + TimeDelta::seconds(1));
        queue.arm(c, t0() + TimeDelta::seconds(10));

        let due: Vec<_> = queue
            .pop_due(t0() + TimeDelta::seconds(5))
            .into_iter()
            .map(|h| h.timer_id)
            .collect();
        assert_eq!(due, vec![a, b]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(t0() + TimeDelta::seconds(10)));
    }

    #[test]
    fn test_rearm_replaces_previous() {
        let queue = WakeupQueue::new();
        let id = new_timer_id();
        let first = queue.arm(id, t0());
        let second = queue.arm(id, t0() + TimeDelta::hours(1));

        assert!(!queue.disarm(&first));
        assert!(queue.pop_due(t0()).is_empty());
        assert!(queue.disarm(&second));
        assert!(queue.is_empty());
        assert!(queue.pop_due(t0() + TimeDelta::days(1)).is_empty());
    }

    #[test]
    fn test_wait_due_returns_when_armed_from_other_thread() {
        let queue = Arc::new(WakeupQueue::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let id = new_timer_id();

        let q = queue.clone();
        let c = clock.clone();
        let waiter = thread::spawn(move || q.wait_due(c.as_ref(), Duration::from_millis(20)));

        thread::sleep(Duration::from_millis(30));
        queue.arm(id, t0());
        let due = waiter.join().unwrap().unwrap();
        assert_eq!(due[0].timer_id, id);
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WakeupQueue::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let q = queue.clone();
        let c = clock.clone();
        let waiter = thread::spawn(move || q.wait_due(c.as_ref(), Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_reopen_after_shutdown_serves_waiters_again() {
        let queue = WakeupQueue::new();
        let clock = ManualClock::new(t0());
        let id = new_timer_id();
        queue.arm(id, t0());

        queue.shutdown();
        assert!(queue.wait_due(&clock, Duration::from_millis(5)).is_none());

        queue.reopen();
        let due = queue.wait_due(&clock, Duration::from_millis(5)).unwrap();
        assert_eq!(due[0].timer_id, id);
    }

    #[test]
    fn test_disarmed_entries_do_not_accumulate() {
        let queue = WakeupQueue::new();
        let far = t0() + TimeDelta::days(365);
        let keep = queue.arm(new_timer_id(), far);

        for _ in 0..10_000 {
            let handle = queue.arm(new_timer_id(), far);
            assert!(queue.disarm(&handle));
        }
        let id = new_timer_id();
        for _ in 0..10_000 {
            queue.arm(id, far);
        }

        assert_eq!(queue.len(), 2);
        assert!(queue.state.lock().heap.len() <= 2 * COMPACT_MIN);
        assert!(queue.disarm(&keep));
        assert_eq!(queue.next_due(), Some(far));
    }
}
