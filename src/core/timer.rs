//! Timer records, handles and creation requests.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::schedule::{CalendarEvaluator, ScheduleExpression, ScheduleSpec};
use crate::core::{TimerEngine, TimerError, TimerStore};
use crate::util::serde::{millis, OwnerId, TimerId};

/// Lifecycle state of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerStatus {
    /// Armed and eligible to fire.
    Active,
    /// Disarmed, keeps its next fire time until resumed.
    Suspended,
    /// Cancelled by the owner.
    Cancelled,
    /// No further occurrences.
    Expired,
}

impl TimerStatus {
    /// Cancelled and Expired records never fire again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

/// What drives a timer's occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// Calendar schedule.
    Calendar {
        /// Parsed schedule.
        schedule: ScheduleExpression,
    },
    /// Fixed period after an initial expiration.
    Interval {
        /// Period in milliseconds, always positive.
        interval_ms: u64,
    },
}

/// Callback an automatic timer targets on its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutMethod {
    /// Method name.
    pub name: String,
    /// Parameter type names, empty for a no-arg callback.
    pub param_types: Vec<String>,
}

impl TimeoutMethod {
    /// Callback with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_types: Vec::new(),
        }
    }

    /// Append a parameter type.
    #[must_use]
    pub fn with_param(mut self, type_name: impl Into<String>) -> Self {
        self.param_types.push(type_name.into());
        self
    }
}

/// Durable description of one timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    /// Timer id.
    pub id: TimerId,
    /// Owning component.
    pub owner_id: OwnerId,
    /// Schedule or interval.
    pub kind: TimerKind,
    /// Creation instant.
    pub initial_date: DateTime<Utc>,
    /// Earliest unconsumed occurrence; `None` once terminal.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Occurrence most recently dispatched successfully.
    pub previous_run: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: TimerStatus,
    /// Created from owner metadata rather than programmatically.
    pub auto_timer: bool,
    /// Callback for automatic timers.
    pub timeout_method: Option<TimeoutMethod>,
    /// Opaque payload handed back on every timeout.
    pub info: Option<Value>,
    /// Consecutive failed dispatches of the current occurrence.
    pub failed_attempts: u32,
}

impl TimerRecord {
    /// Serializable handle to this timer.
    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            timer_id: self.id,
            owner_id: self.owner_id.clone(),
        }
    }

    /// Whether the timer is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TimerStatus::Active
    }

    /// Whether the timer is driven by a calendar schedule.
    #[must_use]
    pub const fn is_calendar_timer(&self) -> bool {
        matches!(self.kind, TimerKind::Calendar { .. })
    }

    /// Calendar schedule, `None` for interval timers.
    #[must_use]
    pub const fn schedule(&self) -> Option<&ScheduleExpression> {
        match &self.kind {
            TimerKind::Calendar { schedule } => Some(schedule),
            TimerKind::Interval { .. } => None,
        }
    }

    /// Period of an interval timer.
    #[must_use]
    pub fn interval(&self) -> Option<TimeDelta> {
        match self.kind {
            TimerKind::Interval { interval_ms } => millis(interval_ms),
            TimerKind::Calendar { .. } => None,
        }
    }

    /// Time left until the next occurrence, zero when overdue.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.next_fire_time
            .map(|next| (next - now).max(TimeDelta::zero()))
    }

    /// Occurrence following `scheduled`, skipping any that are already past
    /// `now` so an overdue timer fires once rather than replaying a backlog.
    #[must_use]
    pub fn next_after(
        &self,
        evaluator: &CalendarEvaluator,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match &self.kind {
            TimerKind::Calendar { schedule } => {
                evaluator.next_timeout(schedule, scheduled.max(now))
            }
            TimerKind::Interval { interval_ms } => {
                let step = i64::try_from(*interval_ms).ok().filter(|s| *s > 0)?;
                let behind = (now - scheduled).num_milliseconds().max(0);
                let periods = behind / step + 1;
                scheduled.checked_add_signed(TimeDelta::try_milliseconds(periods.checked_mul(step)?)?)
            }
        }
    }
}

/// Serializable reference to a timer, resolvable while the owner is bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle {
    /// Timer id.
    pub timer_id: TimerId,
    /// Owning component.
    pub owner_id: OwnerId,
}

impl TimerHandle {
    /// Look up the live record behind this handle.
    ///
    /// Fails with `OwnerNotBound` when the owner has no invoker and with
    /// `NotActive` when the timer is unknown or not Active.
    pub fn resolve<S: TimerStore>(&self, engine: &TimerEngine<S>) -> Result<TimerRecord, TimerError> {
        engine.timer(self)
    }
}

/// How a new timer produces occurrences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewTimerSpec {
    /// Calendar schedule, validated at creation.
    Calendar(ScheduleSpec),
    /// Fixed period.
    Interval {
        /// Period, must be positive.
        interval: TimeDelta,
        /// First occurrence; defaults to now + interval.
        initial_expiration: Option<DateTime<Utc>>,
    },
}

/// Request to create a timer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTimer {
    /// Owning component.
    pub owner_id: OwnerId,
    /// Occurrence source.
    pub spec: NewTimerSpec,
    /// Opaque payload.
    pub info: Option<Value>,
    /// Callback for automatic timers.
    pub timeout_method: Option<TimeoutMethod>,
    /// Whether the timer comes from owner metadata.
    pub auto_timer: bool,
}

impl NewTimer {
    /// Calendar timer from raw schedule fields.
    pub fn calendar(owner_id: impl Into<OwnerId>, spec: ScheduleSpec) -> Self {
        Self::from_spec(owner_id.into(), NewTimerSpec::Calendar(spec))
    }

    /// Calendar timer from an already validated expression.
    pub fn schedule(owner_id: impl Into<OwnerId>, schedule: ScheduleExpression) -> Self {
        Self::calendar(owner_id, schedule.into())
    }

    /// Interval timer whose first occurrence is one period from now.
    pub fn interval(owner_id: impl Into<OwnerId>, interval: TimeDelta) -> Self {
        Self::from_spec(
            owner_id.into(),
            NewTimerSpec::Interval {
                interval,
                initial_expiration: None,
            },
        )
    }

    const fn from_spec(owner_id: OwnerId, spec: NewTimerSpec) -> Self {
        Self {
            owner_id,
            spec,
            info: None,
            timeout_method: None,
            auto_timer: false,
        }
    }

    /// Attach an opaque payload.
    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Pin the first occurrence of an interval timer. Ignored for calendar timers.
    #[must_use]
    pub fn with_initial_expiration(mut self, at: DateTime<Utc>) -> Self {
        if let NewTimerSpec::Interval {
            initial_expiration, ..
        } = &mut self.spec
        {
            *initial_expiration = Some(at);
        }
        self
    }

    /// Mark as an automatic timer targeting `method`.
    #[must_use]
    pub fn auto(mut self, method: TimeoutMethod) -> Self {
        self.auto_timer = true;
        self.timeout_method = Some(method);
        self
    }
}

/// What the invoker receives for one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    /// Timer id.
    pub timer_id: TimerId,
    /// Owning component.
    pub owner_id: OwnerId,
    /// Occurrence being delivered.
    pub scheduled_at: DateTime<Utc>,
    /// Payload given at creation.
    pub info: Option<Value>,
    /// Callback for automatic timers.
    pub timeout_method: Option<TimeoutMethod>,
    /// 1 for the first delivery of this occurrence, higher on retries.
    pub attempt: u32,
}

impl TimeoutEvent {
    /// Handle to the firing timer.
    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            timer_id: self.timer_id,
            owner_id: self.owner_id.clone(),
        }
    }
}
