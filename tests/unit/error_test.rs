//! Tests for error types

use prometheus_timer_service::core::{AppResult, TimerError};
use uuid::Uuid;

#[test]
fn test_invalid_schedule_error() {
    let err = TimerError::InvalidSchedule("hour `25`: unrecognised value".to_string());
    assert_eq!(format!("{}", err), "invalid schedule: hour `25`: unrecognised value");
}

#[test]
fn test_owner_not_bound_error() {
    let err = TimerError::OwnerNotBound("billing".to_string());
    assert_eq!(format!("{}", err), "owner not bound: billing");
}

#[test]
fn test_not_active_error() {
    let id = Uuid::nil();
    let err = TimerError::NotActive(id);
    assert_eq!(format!("{}", err), format!("timer {id} is not active"));
}

#[test]
fn test_recovery_inconsistency_error() {
    let err = TimerError::RecoveryInconsistency {
        owner_id: "billing".to_string(),
        suspended: 3,
    };
    assert_eq!(
        format!("{}", err),
        "owner billing has no invoker; 3 timer(s) left suspended"
    );
}

#[test]
fn test_backend_error() {
    let err = TimerError::Backend("disk full".to_string());
    assert_eq!(format!("{}", err), "backend error: disk full");
}

#[test]
fn test_app_result_wraps_timer_error() {
    fn fails() -> AppResult<()> {
        Err(TimerError::RolledBack("marked rollback-only".into()).into())
    }
    let err = fails().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TimerError>(),
        Some(TimerError::RolledBack(_))
    ));
}
