//! Flattened persistent row for a timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::schedule::ScheduleSpec;
use crate::core::{TimeoutMethod, TimerError, TimerKind, TimerRecord, TimerStatus};
use crate::util::serde::{OwnerId, TimerId};

/// Storage shape of a [`TimerRecord`].
///
/// Calendar timers carry all seven schedule strings and no `interval_ms`;
/// interval timers carry `interval_ms` and no schedule strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEntity {
    /// Timer id.
    pub id: TimerId,
    /// Owning component.
    pub owner_id: OwnerId,
    /// Second field.
    pub second: Option<String>,
    /// Minute field.
    pub minute: Option<String>,
    /// Hour field.
    pub hour: Option<String>,
    /// Day-of-month field.
    pub day_of_month: Option<String>,
    /// Month field.
    pub month: Option<String>,
    /// Day-of-week field.
    pub day_of_week: Option<String>,
    /// Year field.
    pub year: Option<String>,
    /// Schedule start bound.
    pub start_date: Option<DateTime<Utc>>,
    /// Schedule end bound.
    pub end_date: Option<DateTime<Utc>>,
    /// Interval period.
    pub interval_ms: Option<u64>,
    /// Creation instant.
    pub initial_date: DateTime<Utc>,
    /// Next occurrence.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Last successful occurrence.
    pub previous_run: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: TimerStatus,
    /// Automatic timer flag.
    pub auto_timer: bool,
    /// Callback for automatic timers.
    pub timeout_method: Option<TimeoutMethod>,
    /// Opaque payload.
    pub info: Option<Value>,
    /// Failed dispatches of the current occurrence.
    #[serde(default)]
    pub failed_attempts: u32,
}

impl From<&TimerRecord> for TimerEntity {
    fn from(record: &TimerRecord) -> Self {
        let (spec, interval_ms) = match &record.kind {
            TimerKind::Calendar { schedule } => (Some(schedule.spec().clone()), None),
            TimerKind::Interval { interval_ms } => (None, Some(*interval_ms)),
        };
        let field = |pick: fn(&ScheduleSpec) -> &String| spec.as_ref().map(|s| pick(s).clone());
        Self {
            id: record.id,
            owner_id: record.owner_id.clone(),
            second: field(|s| &s.second),
            minute: field(|s| &s.minute),
            hour: field(|s| &s.hour),
            day_of_month: field(|s| &s.day_of_month),
            month: field(|s| &s.month),
            day_of_week: field(|s| &s.day_of_week),
            year: field(|s| &s.year),
            start_date: spec.as_ref().and_then(|s| s.start),
            end_date: spec.as_ref().and_then(|s| s.end),
            interval_ms,
            initial_date: record.initial_date,
            next_fire_time: record.next_fire_time,
            previous_run: record.previous_run,
            status: record.status,
            auto_timer: record.auto_timer,
            timeout_method: record.timeout_method.clone(),
            info: record.info.clone(),
            failed_attempts: record.failed_attempts,
        }
    }
}

impl TryFrom<TimerEntity> for TimerRecord {
    type Error = TimerError;

    fn try_from(entity: TimerEntity) -> Result<Self, Self::Error> {
        let fields = [
            entity.second,
            entity.minute,
            entity.hour,
            entity.day_of_month,
            entity.month,
            entity.day_of_week,
            entity.year,
        ];
        let present = fields.iter().filter(|f| f.is_some()).count();

        let kind = match (present, entity.interval_ms) {
            (7, None) => {
                let [second, minute, hour, day_of_month, month, day_of_week, year] =
                    fields.map(Option::unwrap_or_default);
                let schedule = ScheduleSpec {
                    second,
                    minute,
                    hour,
                    day_of_month,
                    month,
                    day_of_week,
                    year,
                    start: entity.start_date,
                    end: entity.end_date,
                }
                .build()?;
                TimerKind::Calendar { schedule }
            }
            (0, Some(interval_ms)) if interval_ms > 0 => TimerKind::Interval { interval_ms },
            _ => {
                return Err(TimerError::InvalidSchedule(format!(
                    "timer {} must carry exactly one of a full schedule or a positive interval",
                    entity.id
                )))
            }
        };

        Ok(Self {
            id: entity.id,
            owner_id: entity.owner_id,
            kind,
            initial_date: entity.initial_date,
            next_fire_time: entity.next_fire_time,
            previous_run: entity.previous_run,
            status: entity.status,
            auto_timer: entity.auto_timer,
            timeout_method: entity.timeout_method,
            info: entity.info,
            failed_attempts: entity.failed_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::ScheduleExpression;

    fn calendar_record() -> TimerRecord {
        let schedule = ScheduleExpression::builder()
            .minute("*/5")
            .hour("*")
            .build()
            .unwrap();
        TimerRecord {
            id: crate::util::serde::new_timer_id(),
            owner_id: "reports".into(),
            kind: TimerKind::Calendar { schedule },
            initial_date: Utc::now(),
            next_fire_time: None,
            previous_run: None,
            status: TimerStatus::Active,
            auto_timer: true,
            timeout_method: Some(TimeoutMethod::new("rollup")),
            info: Some(serde_json::json!("weekly")),
            failed_attempts: 2,
        }
    }

    #[test]
    fn test_calendar_entity_keeps_all_fields() {
        let record = calendar_record();
        let entity = TimerEntity::from(&record);
        assert_eq!(entity.minute.as_deref(), Some("*/5"));
        assert_eq!(entity.interval_ms, None);
        assert_eq!(TimerRecord::try_from(entity).unwrap(), record);
    }

    #[test]
    fn test_both_schedule_and_interval_rejected() {
        let mut entity = TimerEntity::from(&calendar_record());
        entity.interval_ms = Some(1_000);
        assert!(matches!(
            TimerRecord::try_from(entity),
            Err(TimerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_partial_schedule_rejected() {
        let mut entity = TimerEntity::from(&calendar_record());
        entity.hour = None;
        assert!(TimerRecord::try_from(entity).is_err());
    }

    #[test]
    fn test_stored_schedule_is_revalidated() {
        let mut entity = TimerEntity::from(&calendar_record());
        entity.hour = Some("99".into());
        assert!(matches!(
            TimerRecord::try_from(entity),
            Err(TimerError::InvalidSchedule(_))
        ));
    }
}
