//! Tests for utility functions

use chrono::{TimeDelta, TimeZone, Utc};
use prometheus_timer_service::util::{millis, new_timer_id, now_ms, Clock, ManualClock, SystemClock};

#[test]
fn test_manual_clock_moves_only_when_told() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(TimeDelta::minutes(90));
    assert_eq!(clock.now(), start + TimeDelta::minutes(90));

    clock.set(start);
    assert_eq!(clock.now(), start);
}

#[test]
fn test_system_clock_is_close_to_now_ms() {
    let before = now_ms();
    let now = SystemClock.now();
    let after = now_ms();
    let ms = u128::try_from(now.timestamp_millis()).unwrap();
    assert!(before <= ms && ms <= after);
}

#[test]
fn test_millis() {
    assert_eq!(millis(1_500), Some(TimeDelta::milliseconds(1_500)));
    assert_eq!(millis(u64::MAX), None);
}

#[test]
fn test_timer_ids_are_unique_v4() {
    let a = new_timer_id();
    let b = new_timer_id();
    assert_ne!(a, b);
    assert_eq!(a.get_version_num(), 4);
}
