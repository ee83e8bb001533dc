//! Next-fire-time search over a [`ScheduleExpression`].
//!
//! The search is an odometer: year, month, day, hour, minute, second. Each
//! level moves to the next matching value at or above the carried lower bound;
//! when a level runs out, the next coarser unit is bumped and every finer unit
//! resets to its minimum. All arithmetic is UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};

use super::{MonthContext, ScheduleExpression};

/// Default bound on how many years ahead a search may look.
pub const DEFAULT_MAX_LOOKAHEAD_YEARS: u32 = 100;

/// Pure calculator for calendar fire instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEvaluator {
    max_lookahead_years: u32,
}

impl Default for CalendarEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOOKAHEAD_YEARS)
    }
}

impl CalendarEvaluator {
    /// Evaluator that gives up after `max_lookahead_years` years.
    #[must_use]
    pub const fn new(max_lookahead_years: u32) -> Self {
        Self {
            max_lookahead_years,
        }
    }

    /// Configured lookahead bound.
    #[must_use]
    pub const fn max_lookahead_years(&self) -> u32 {
        self.max_lookahead_years
    }

    /// Earliest instant strictly after `after` that satisfies `schedule`.
    ///
    /// Returns `None` when the schedule has ended, no instant exists within
    /// the lookahead window, or the next candidate lies past `end`.
    #[must_use]
    pub fn next_timeout(
        &self,
        schedule: &ScheduleExpression,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if schedule.end().is_some_and(|end| after >= end) {
            return None;
        }
        // Searching from just before `start` makes `start` itself eligible.
        let lower = match schedule.start() {
            Some(start) if after < start => start - TimeDelta::nanoseconds(1),
            _ => after,
        };
        let first = lower
            .naive_utc()
            .with_nanosecond(0)?
            .checked_add_signed(TimeDelta::seconds(1))?;
        let horizon = first
            .year()
            .saturating_add(i32::try_from(self.max_lookahead_years).unwrap_or(i32::MAX));

        let candidate = search(schedule, first, horizon)?.and_utc();
        if schedule.end().is_some_and(|end| candidate > end) {
            return None;
        }
        Some(candidate)
    }
}

fn midnight(year: i32, month: u32, day: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
}

fn first_of_next_month(year: i32, month: u32) -> Option<NaiveDateTime> {
    if month == 12 {
        midnight(year.checked_add(1)?, 1, 1)
    } else {
        midnight(year, month + 1, 1)
    }
}

fn search(schedule: &ScheduleExpression, mut t: NaiveDateTime, horizon: i32) -> Option<NaiveDateTime> {
    loop {
        let year = t.year();
        if year > horizon {
            return None;
        }
        let wanted = schedule
            .year
            .next_match(u32::try_from(year).ok()?, u32::try_from(horizon).ok()?)?;
        let wanted = i32::try_from(wanted).ok()?;
        if wanted != year {
            t = midnight(wanted, 1, 1)?;
            continue;
        }

        let month = t.month();
        match schedule.month.next_match(month, 12) {
            None => {
                t = midnight(year.checked_add(1)?, 1, 1)?;
                continue;
            }
            Some(m) if m != month => {
                t = midnight(year, m, 1)?;
                continue;
            }
            Some(_) => {}
        }

        let context = MonthContext::new(year, month)?;
        let day = t.day();
        match (day..=context.days).find(|d| schedule.day_matches(&context, *d)) {
            None => {
                t = first_of_next_month(year, month)?;
                continue;
            }
            Some(d) if d != day => {
                t = midnight(year, month, d)?;
                continue;
            }
            Some(_) => {}
        }

        let date = t.date();
        let hour = t.hour();
        match schedule.hour.next_match(hour, 23) {
            None => {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            Some(h) if h != hour => {
                t = date.and_hms_opt(h, 0, 0)?;
                continue;
            }
            Some(_) => {}
        }

        let minute = t.minute();
        match schedule.minute.next_match(minute, 59) {
            None => {
                t = date
                    .and_hms_opt(hour, 0, 0)?
                    .checked_add_signed(TimeDelta::hours(1))?;
                continue;
            }
            Some(m) if m != minute => {
                t = date.and_hms_opt(hour, m, 0)?;
                continue;
            }
            Some(_) => {}
        }

        match schedule.second.next_match(t.second(), 59) {
            None => {
                t = date
                    .and_hms_opt(hour, minute, 0)?
                    .checked_add_signed(TimeDelta::minutes(1))?;
            }
            Some(s) => return date.and_hms_opt(hour, minute, s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_second_is_next_whole_second() {
        let expr = ScheduleExpression::builder()
            .second("*")
            .minute("*")
            .hour("*")
            .build()
            .unwrap();
        let after = at(2024, 5, 5, 10, 0, 0) + TimeDelta::milliseconds(250);
        assert_eq!(expr.next_timeout(after), Some(at(2024, 5, 5, 10, 0, 1)));
    }

    #[test]
    fn test_rolls_over_year_end() {
        let expr = ScheduleExpression::builder().hour("23").minute("59").second("59").build().unwrap();
        assert_eq!(
            expr.next_timeout(at(2024, 12, 31, 23, 59, 59)),
            Some(at(2025, 1, 1, 23, 59, 59))
        );
    }

    #[test]
    fn test_lookahead_bound() {
        let expr = ScheduleExpression::builder().year("2090").build().unwrap();
        let short = CalendarEvaluator::new(10);
        assert_eq!(short.next_timeout(&expr, at(2024, 1, 1, 0, 0, 0)), None);
        assert_eq!(
            CalendarEvaluator::default().next_timeout(&expr, at(2024, 1, 1, 0, 0, 0)),
            Some(at(2090, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_impossible_date_is_none() {
        let expr = ScheduleExpression::builder()
            .day_of_month("30")
            .month("Feb")
            .build()
            .unwrap();
        assert_eq!(expr.next_timeout(at(2024, 1, 1, 0, 0, 0)), None);
    }
}
