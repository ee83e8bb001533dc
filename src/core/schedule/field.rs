//! Field grammar for calendar schedules.
//!
//! Every calendar field parses into a [`FieldPattern`]: wildcard, single
//! value, list, range or increment. Day-of-month values may additionally be
//! relative to the month they are evaluated in ([`DayOfMonth`]); those are
//! resolved against a concrete [`MonthContext`] at match time, never at parse
//! time.

use std::fmt;

use chrono::{Datelike, NaiveDate};

use crate::core::TimerError;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Calendar field a pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Second of the minute, 0-59.
    Second,
    /// Minute of the hour, 0-59.
    Minute,
    /// Hour of the day, 0-23.
    Hour,
    /// Day of the month, 1-31 or relative.
    DayOfMonth,
    /// Month of the year, 1-12 or `Jan`..`Dec`.
    Month,
    /// Day of the week, 0-7 (both 0 and 7 are Sunday) or `Sun`..`Sat`.
    DayOfWeek,
    /// Four-digit year.
    Year,
}

impl FieldKind {
    /// Field name as used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "dayOfMonth",
            Self::Month => "month",
            Self::DayOfWeek => "dayOfWeek",
            Self::Year => "year",
        }
    }

    /// Inclusive numeric bounds of the field.
    #[must_use]
    pub const fn bounds(self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
            Self::Year => (1000, 9999),
        }
    }

    const fn allows_increment(self) -> bool {
        matches!(self, Self::Second | Self::Minute | Self::Hour)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parsed form of one calendar field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPattern<V> {
    /// `*`, matches every value.
    Wildcard,
    /// A single value.
    Single(V),
    /// Comma separated singles and ranges.
    List(Vec<FieldPattern<V>>),
    /// Inclusive range; wraps around when the start resolves past the end.
    Range(V, V),
    /// `start/step`: start, start + step, ... up to the field maximum.
    Increment {
        /// First value.
        start: u32,
        /// Distance between values, at least 1.
        step: u32,
    },
}

impl<V> FieldPattern<V> {
    /// Whether this is the `*` pattern.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    /// Match `value`, turning pattern values into numbers with `resolve`.
    ///
    /// A value that does not resolve (e.g. the 31st in April) matches nothing.
    pub fn matches_with<F>(&self, value: u32, resolve: &F) -> bool
    where
        F: Fn(&V) -> Option<u32>,
    {
        match self {
            Self::Wildcard => true,
            Self::Single(v) => resolve(v) == Some(value),
            Self::List(items) => items.iter().any(|item| item.matches_with(value, resolve)),
            Self::Range(lo, hi) => match (resolve(lo), resolve(hi)) {
                (Some(lo), Some(hi)) if lo <= hi => (lo..=hi).contains(&value),
                (Some(lo), Some(hi)) => value >= lo || value <= hi,
                _ => false,
            },
            Self::Increment { start, step } => value >= *start && (value - start) % step == 0,
        }
    }
}

impl FieldPattern<u32> {
    /// Match a plain numeric value.
    #[must_use]
    pub fn matches(&self, value: u32) -> bool {
        self.matches_with(value, &|v: &u32| Some(*v))
    }

    /// Smallest matching value in `from..=max`.
    #[must_use]
    pub fn next_match(&self, from: u32, max: u32) -> Option<u32> {
        (from..=max).find(|v| self.matches(*v))
    }
}

/// A day-of-month value, possibly relative to the end of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOfMonth {
    /// Absolute day, 1-31.
    Day(u32),
    /// `Last`: the last day of the month.
    Last,
    /// `-n`: n days (1-7) before the last day.
    BeforeLast(u32),
    /// `1st Mon` .. `5th Fri`.
    Nth {
        /// Occurrence within the month, 1-5.
        ordinal: u32,
        /// Weekday, 0 = Sunday.
        weekday: u32,
    },
    /// `Last Fri`: the last occurrence of a weekday (0 = Sunday).
    LastWeekday(u32),
}

impl DayOfMonth {
    /// Absolute day this value denotes in `month`, if it exists there.
    #[must_use]
    pub fn resolve(self, month: &MonthContext) -> Option<u32> {
        match self {
            Self::Day(day) => (day <= month.days).then_some(day),
            Self::Last => Some(month.days),
            Self::BeforeLast(offset) => month.days.checked_sub(offset).filter(|day| *day >= 1),
            Self::Nth { ordinal, weekday } => {
                let first = 1 + (weekday + 7 - month.first_weekday) % 7;
                let day = first + 7 * ordinal.checked_sub(1)?;
                (day <= month.days).then_some(day)
            }
            Self::LastWeekday(weekday) => {
                let last = month.weekday_of(month.days);
                Some(month.days - (last + 7 - weekday) % 7)
            }
        }
    }
}

/// Shape of one concrete month: length and the weekday it starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthContext {
    /// Calendar year.
    pub year: i32,
    /// Month, 1-12.
    pub month: u32,
    /// Number of days in the month.
    pub days: u32,
    first_weekday: u32,
}

impl MonthContext {
    /// Build the context for `year`/`month`, `None` for an invalid month.
    #[must_use]
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        let days = u32::try_from((next - first).num_days()).ok()?;
        Some(Self {
            year,
            month,
            days,
            first_weekday: first.weekday().num_days_from_sunday(),
        })
    }

    /// Weekday (0 = Sunday) of `day`, which must be at least 1.
    #[must_use]
    pub const fn weekday_of(&self, day: u32) -> u32 {
        (self.first_weekday + day - 1) % 7
    }
}

/// Parse a numeric field (everything except day-of-month).
pub fn parse_numeric(raw: &str, kind: FieldKind) -> Result<FieldPattern<u32>, TimerError> {
    parse_pattern(raw, kind, |token| parse_number(token, kind))
}

/// Parse the day-of-month field.
pub fn parse_day_of_month(raw: &str) -> Result<FieldPattern<DayOfMonth>, TimerError> {
    parse_pattern(raw, FieldKind::DayOfMonth, parse_day_value)
}

fn invalid(kind: FieldKind, raw: &str, reason: &str) -> TimerError {
    TimerError::InvalidSchedule(format!("{kind} `{raw}`: {reason}"))
}

fn parse_pattern<V, F>(raw: &str, kind: FieldKind, value: F) -> Result<FieldPattern<V>, TimerError>
where
    F: Fn(&str) -> Option<V>,
{
    let text = raw.trim();
    if text.is_empty() {
        return Err(invalid(kind, raw, "empty field"));
    }
    if text == "*" {
        return Ok(FieldPattern::Wildcard);
    }

    if text.contains(',') {
        let items = text
            .split(',')
            .map(|item| {
                let item = item.trim();
                parse_range_or_single(item, &value)
                    .ok_or_else(|| invalid(kind, raw, &format!("bad list item `{item}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(FieldPattern::List(items));
    }

    if let Some((start, step)) = text.split_once('/') {
        if !kind.allows_increment() {
            return Err(invalid(
                kind,
                raw,
                "increments are only allowed for second, minute and hour",
            ));
        }
        let (min, max) = kind.bounds();
        let start = match start.trim() {
            "*" => min,
            s => s
                .parse::<u32>()
                .ok()
                .filter(|v| (min..=max).contains(v))
                .ok_or_else(|| invalid(kind, raw, "increment start out of range"))?,
        };
        let step = step
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| invalid(kind, raw, "increment step must be a positive integer"))?;
        return Ok(FieldPattern::Increment { start, step });
    }

    parse_range_or_single(text, &value).ok_or_else(|| invalid(kind, raw, "unrecognised value"))
}

fn parse_range_or_single<V, F>(text: &str, value: &F) -> Option<FieldPattern<V>>
where
    F: Fn(&str) -> Option<V>,
{
    if text.is_empty() || text == "*" {
        return None;
    }
    if let Some(single) = value(text) {
        return Some(FieldPattern::Single(single));
    }
    // A leading '-' belongs to a relative day ("-3"), so never split there.
    text.char_indices()
        .filter(|(idx, c)| *c == '-' && *idx > 0)
        .find_map(|(idx, _)| {
            let lo = value(text[..idx].trim())?;
            let hi = value(text[idx + 1..].trim())?;
            Some(FieldPattern::Range(lo, hi))
        })
}

fn parse_number(token: &str, kind: FieldKind) -> Option<u32> {
    let (min, max) = kind.bounds();
    if let Ok(n) = token.parse::<u32>() {
        return (min..=max).contains(&n).then_some(n);
    }
    match kind {
        FieldKind::Month => name_index(&MONTH_NAMES, token).map(|i| i + 1),
        FieldKind::DayOfWeek => name_index(&WEEKDAY_NAMES, token),
        _ => None,
    }
}

fn name_index(names: &[&str], token: &str) -> Option<u32> {
    names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .and_then(|i| u32::try_from(i).ok())
}

fn parse_day_value(token: &str) -> Option<DayOfMonth> {
    if token.eq_ignore_ascii_case("last") {
        return Some(DayOfMonth::Last);
    }
    if let Some(offset) = token.strip_prefix('-') {
        return offset
            .parse::<u32>()
            .ok()
            .filter(|k| (1..=7).contains(k))
            .map(DayOfMonth::BeforeLast);
    }
    if let Ok(day) = token.parse::<u32>() {
        return (1..=31).contains(&day).then_some(DayOfMonth::Day(day));
    }

    let mut parts = token.split_whitespace();
    let ordinal = parts.next()?.to_ascii_lowercase();
    let weekday = name_index(&WEEKDAY_NAMES, parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    let ordinal = match ordinal.as_str() {
        "1st" => 1,
        "2nd" => 2,
        "3rd" => 3,
        "4th" => 4,
        "5th" => 5,
        "last" => return Some(DayOfMonth::LastWeekday(weekday)),
        _ => return None,
    };
    Some(DayOfMonth::Nth { ordinal, weekday })
}
