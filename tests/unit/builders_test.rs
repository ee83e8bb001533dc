//! Tests for builder modules

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use prometheus_timer_service::builders::TimerServiceBuilder;
use prometheus_timer_service::config::{RetryPolicy, StoreBackendConfig, TimerServiceConfig};
use prometheus_timer_service::core::{InvokerDirectory, SharedAuditSink};
use prometheus_timer_service::infra::InMemoryTimerStore;
use prometheus_timer_service::util::{Clock, ManualClock};

#[test]
fn test_builder_keeps_config() {
    let config = TimerServiceConfig::new().with_worker_count(2);
    let builder = TimerServiceBuilder::new(config.clone());
    assert_eq!(builder.config(), &config);
}

#[test]
fn test_build_engine_applies_config_and_collaborators() {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(at));
    let directory = Arc::new(InvokerDirectory::new());
    let retry = RetryPolicy::Immediate {
        max_retries: 2,
        delay_ms: 10,
    };

    let engine = TimerServiceBuilder::new(TimerServiceConfig::new().with_retry(retry))
        .with_clock(clock)
        .with_directory(Arc::clone(&directory))
        .with_audit(Box::new(SharedAuditSink::new(16)))
        .build_engine(InMemoryTimerStore::new())
        .unwrap();

    assert_eq!(engine.retry_policy(), retry);
    assert_eq!(engine.clock().now(), at);
    assert!(Arc::ptr_eq(engine.directory(), &directory));
}

#[test]
fn test_build_rejects_invalid_config() {
    let result = TimerServiceBuilder::new(TimerServiceConfig::new().with_worker_count(0))
        .build_engine(InMemoryTimerStore::new());
    assert!(result.is_err());

    let service = TimerServiceBuilder::new(TimerServiceConfig::new().with_max_park_ms(0)).build();
    assert!(service.is_err());
}

#[test]
fn test_build_in_memory_service_is_not_running_until_started() {
    let service = TimerServiceBuilder::new(TimerServiceConfig::default())
        .build()
        .unwrap();
    assert!(!service.is_running());
}

#[test]
fn test_build_file_backed_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = TimerServiceConfig::new().with_store(StoreBackendConfig::File {
        path: dir.path().to_path_buf(),
        stream: "unit".into(),
    });
    let service = TimerServiceBuilder::new(config).build().unwrap();
    assert!(!service.is_running());
    assert!(dir.path().join("unit.jsonl").exists());
}
