//! Tests for audit sink

use prometheus_timer_service::core::{
    build_audit_event, AuditAction, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
use uuid::Uuid;

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let timer_id = Uuid::new_v4();

    let event = build_audit_event(
        timer_id,
        "billing",
        AuditAction::Created,
        Some("interval 5m".to_string()),
    );

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].timer_id, timer_id);
    assert_eq!(events[0].owner_id, "billing");
    assert_eq!(events[0].action, AuditAction::Created);
    assert!(events[0].event_id.contains("created"));
}

#[test]
fn test_in_memory_audit_sink_is_bounded() {
    let mut sink = InMemoryAuditSink::new(2);
    let timer_id = Uuid::new_v4();
    for action in [AuditAction::Created, AuditAction::Fired, AuditAction::Cancelled] {
        sink.record(build_audit_event(timer_id, "billing", action, None));
    }
    let actions: Vec<_> = sink.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Fired, AuditAction::Cancelled]);
}

#[test]
fn test_shared_audit_sink_clones_share_buffer() {
    let reader = SharedAuditSink::new(8);
    let mut writer: Box<dyn AuditSink> = Box::new(reader.clone());
    let timer_id = Uuid::new_v4();
    writer.record(build_audit_event(timer_id, "billing", AuditAction::Fired, None));
    writer.record(build_audit_event(Uuid::new_v4(), "billing", AuditAction::Fired, None));

    assert_eq!(reader.events().len(), 2);
    assert_eq!(reader.actions_for(timer_id), vec![AuditAction::Fired]);
}

#[test]
fn test_audit_action_names() {
    assert_eq!(AuditAction::Recovered.to_string(), "recovered");
    assert_eq!(AuditAction::Suspended.as_str(), "suspended");
}
