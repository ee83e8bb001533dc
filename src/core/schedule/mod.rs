//! Calendar schedule expressions.
//!
//! A [`ScheduleSpec`] is the raw, serializable form: seven field strings plus
//! optional inclusive `start`/`end` bounds. Building it yields a validated
//! [`ScheduleExpression`] whose fields are parsed once into tagged patterns.
//!
//! ```rust,ignore
//! let every_weekday_noon = ScheduleExpression::builder()
//!     .hour("12")
//!     .day_of_week("Mon-Fri")
//!     .build()?;
//! ```

mod calendar;
mod field;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::TimerError;

pub use calendar::{CalendarEvaluator, DEFAULT_MAX_LOOKAHEAD_YEARS};
pub use field::{DayOfMonth, FieldKind, FieldPattern, MonthContext};

/// Raw textual form of a calendar schedule.
///
/// Unset fields take the EJB defaults: `0` for second, minute and hour, `*`
/// for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSpec {
    /// Second field.
    pub second: String,
    /// Minute field.
    pub minute: String,
    /// Hour field.
    pub hour: String,
    /// Day-of-month field.
    pub day_of_month: String,
    /// Month field.
    pub month: String,
    /// Day-of-week field.
    pub day_of_week: String,
    /// Year field.
    pub year: String,
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub end: Option<DateTime<Utc>>,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            second: "0".into(),
            minute: "0".into(),
            hour: "0".into(),
            day_of_month: "*".into(),
            month: "*".into(),
            day_of_week: "*".into(),
            year: "*".into(),
            start: None,
            end: None,
        }
    }
}

impl ScheduleSpec {
    /// Spec with every field at its default (daily at midnight).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the second field.
    #[must_use]
    pub fn second(mut self, value: impl Into<String>) -> Self {
        self.second = value.into();
        self
    }

    /// Set the minute field.
    #[must_use]
    pub fn minute(mut self, value: impl Into<String>) -> Self {
        self.minute = value.into();
        self
    }

    /// Set the hour field.
    #[must_use]
    pub fn hour(mut self, value: impl Into<String>) -> Self {
        self.hour = value.into();
        self
    }

    /// Set the day-of-month field.
    #[must_use]
    pub fn day_of_month(mut self, value: impl Into<String>) -> Self {
        self.day_of_month = value.into();
        self
    }

    /// Set the month field.
    #[must_use]
    pub fn month(mut self, value: impl Into<String>) -> Self {
        self.month = value.into();
        self
    }

    /// Set the day-of-week field.
    #[must_use]
    pub fn day_of_week(mut self, value: impl Into<String>) -> Self {
        self.day_of_week = value.into();
        self
    }

    /// Set the year field.
    #[must_use]
    pub fn year(mut self, value: impl Into<String>) -> Self {
        self.year = value.into();
        self
    }

    /// Set the inclusive start bound.
    #[must_use]
    pub fn start(mut self, at: DateTime<Utc>) -> Self {
        self.start = Some(at);
        self
    }

    /// Set the inclusive end bound.
    #[must_use]
    pub fn end(mut self, at: DateTime<Utc>) -> Self {
        self.end = Some(at);
        self
    }

    /// Validate and parse into an expression.
    pub fn build(self) -> Result<ScheduleExpression, TimerError> {
        ScheduleExpression::try_from(self)
    }
}

/// Validated calendar schedule.
///
/// Serializes as its [`ScheduleSpec`]; deserializing re-validates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpec", into = "ScheduleSpec")]
pub struct ScheduleExpression {
    spec: ScheduleSpec,
    second: FieldPattern<u32>,
    minute: FieldPattern<u32>,
    hour: FieldPattern<u32>,
    day_of_month: FieldPattern<DayOfMonth>,
    month: FieldPattern<u32>,
    day_of_week: FieldPattern<u32>,
    year: FieldPattern<u32>,
}

impl TryFrom<ScheduleSpec> for ScheduleExpression {
    type Error = TimerError;

    fn try_from(spec: ScheduleSpec) -> Result<Self, Self::Error> {
        if let (Some(start), Some(end)) = (spec.start, spec.end) {
            if start > end {
                return Err(TimerError::InvalidSchedule(format!(
                    "start {start} is after end {end}"
                )));
            }
        }
        Ok(Self {
            second: field::parse_numeric(&spec.second, FieldKind::Second)?,
            minute: field::parse_numeric(&spec.minute, FieldKind::Minute)?,
            hour: field::parse_numeric(&spec.hour, FieldKind::Hour)?,
            day_of_month: field::parse_day_of_month(&spec.day_of_month)?,
            month: field::parse_numeric(&spec.month, FieldKind::Month)?,
            day_of_week: field::parse_numeric(&spec.day_of_week, FieldKind::DayOfWeek)?,
            year: field::parse_numeric(&spec.year, FieldKind::Year)?,
            spec,
        })
    }
}

impl From<ScheduleExpression> for ScheduleSpec {
    fn from(expression: ScheduleExpression) -> Self {
        expression.spec
    }
}

impl ScheduleExpression {
    /// Start a spec with default fields.
    #[must_use]
    pub fn builder() -> ScheduleSpec {
        ScheduleSpec::default()
    }

    /// Raw fields this expression was built from.
    #[must_use]
    pub const fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    /// Inclusive lower bound, if any.
    #[must_use]
    pub const fn start(&self) -> Option<DateTime<Utc>> {
        self.spec.start
    }

    /// Inclusive upper bound, if any.
    #[must_use]
    pub const fn end(&self) -> Option<DateTime<Utc>> {
        self.spec.end
    }

    /// Next fire instant strictly after `after`, using the default lookahead.
    #[must_use]
    pub fn next_timeout(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        CalendarEvaluator::default().next_timeout(self, after)
    }

    /// Day rule: when both day fields are constrained, either may match.
    fn day_matches(&self, month: &MonthContext, day: u32) -> bool {
        let by_month_day = || {
            self.day_of_month
                .matches_with(day, &|value: &DayOfMonth| value.resolve(month))
        };
        let by_week_day = || {
            let weekday = month.weekday_of(day);
            self.day_of_week.matches(weekday) || (weekday == 0 && self.day_of_week.matches(7))
        };
        match (self.day_of_month.is_wildcard(), self.day_of_week.is_wildcard()) {
            (true, true) => true,
            (false, true) => by_month_day(),
            (true, false) => by_week_day(),
            (false, false) => by_month_day() || by_week_day(),
        }
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.spec;
        write!(
            f,
            "sec={} min={} hour={} dom={} month={} dow={} year={}",
            s.second, s.minute, s.hour, s.day_of_month, s.month, s.day_of_week, s.year
        )?;
        if let Some(start) = s.start {
            write!(f, " start={start}")?;
        }
        if let Some(end) = s.end {
            write!(f, " end={end}")?;
        }
        Ok(())
    }
}
