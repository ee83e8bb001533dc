//! Audit sink implementations.
//!
//! The engine records one event per lifecycle transition when a sink is
//! attached.

use std::collections::VecDeque;
use std::fmt;

use crate::util::clock::now_ms;
use crate::util::serde::TimerId;

/// Lifecycle transition being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// Timer created and committed.
    Created,
    /// Timeout delivered and committed.
    Fired,
    /// Timeout delivery failed.
    Failed,
    /// Timer cancelled.
    Cancelled,
    /// No further occurrences.
    Expired,
    /// Timer disarmed.
    Suspended,
    /// Timer re-armed after suspension.
    Resumed,
    /// Timer re-armed by recovery.
    Recovered,
}

impl AuditAction {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Fired => "fired",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Recovered => "recovered",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related timer.
    pub timer_id: TimerId,
    /// Owning component.
    pub owner_id: String,
    /// Transition.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink that hands a shared buffer to the engine while the caller keeps a
/// reader. Clones share the buffer.
#[derive(Clone)]
pub struct SharedAuditSink {
    inner: std::sync::Arc<parking_lot::Mutex<InMemoryAuditSink>>,
}

impl SharedAuditSink {
    /// Create a shared sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(parking_lot::Mutex::new(InMemoryAuditSink::new(max_events))),
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().events()
    }

    /// Actions recorded for `timer_id`, oldest first.
    pub fn actions_for(&self, timer_id: TimerId) -> Vec<AuditAction> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.timer_id == timer_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for SharedAuditSink {
    fn record(&mut self, event: AuditEvent) {
        self.inner.lock().record(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    timer_id: TimerId,
    owner_id: impl Into<String>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{timer_id}-{action}-{created_at_ms}"),
        timer_id,
        owner_id: owner_id.into(),
        action,
        created_at_ms,
        detail,
    }
}
