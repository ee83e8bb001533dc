//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;

use prometheus_timer_service::config::{RetryPolicy, StoreBackendConfig, TimerServiceConfig};

#[test]
fn test_default_config_is_valid() {
    let config = TimerServiceConfig::default();
    assert!(config.worker_count >= 1);
    assert_eq!(config.retry, RetryPolicy::NextInterval);
    assert_eq!(config.store, StoreBackendConfig::InMemory);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_worker_count() {
    let config = TimerServiceConfig::new().with_worker_count(0);
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_pending_dispatches() {
    let config = TimerServiceConfig::new().with_max_pending_dispatches(0);
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_lookahead() {
    let config = TimerServiceConfig::new().with_max_lookahead_years(0);
    assert!(config.validate().is_err());
}

#[test]
fn test_empty_file_store_path() {
    let config = TimerServiceConfig::new().with_store(StoreBackendConfig::File {
        path: PathBuf::new(),
        stream: "timers".into(),
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "worker_count": 2,
        "retry": { "mode": "immediate", "max_retries": 3, "delay_ms": 250 },
        "store": { "kind": "file", "path": "/var/lib/timers" }
    }"#;

    let config = TimerServiceConfig::from_json_str(json).unwrap();
    assert_eq!(config.worker_count, 2);
    assert_eq!(
        config.retry,
        RetryPolicy::Immediate {
            max_retries: 3,
            delay_ms: 250
        }
    );
    assert_eq!(
        config.store,
        StoreBackendConfig::File {
            path: PathBuf::from("/var/lib/timers"),
            stream: "timers".into()
        }
    );
    // Unset fields keep their defaults.
    assert_eq!(config.max_park_ms, 1_000);
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(TimerServiceConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
    assert!(TimerServiceConfig::from_json_str("not json").is_err());
}

#[test]
fn test_config_from_lookup() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("TIMER_SERVICE_WORKERS", "3"),
        ("TIMER_SERVICE_RETRY", "immediate"),
        ("TIMER_SERVICE_MAX_RETRIES", "2"),
        ("TIMER_SERVICE_STORE_PATH", "/tmp/timers"),
    ]);
    let config =
        TimerServiceConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap();
    assert_eq!(config.worker_count, 3);
    assert_eq!(
        config.retry,
        RetryPolicy::Immediate {
            max_retries: 2,
            delay_ms: 5_000
        }
    );
    assert!(matches!(config.store, StoreBackendConfig::File { .. }));
}

#[test]
fn test_config_from_lookup_rejects_garbage() {
    let bad_number = TimerServiceConfig::from_lookup(|key| {
        (key == "TIMER_SERVICE_WORKERS").then(|| "many".to_string())
    });
    assert!(bad_number.is_err());

    let bad_policy = TimerServiceConfig::from_lookup(|key| {
        (key == "TIMER_SERVICE_RETRY").then(|| "sometimes".to_string())
    });
    assert!(bad_policy.is_err());
}

#[test]
fn test_retry_delay() {
    assert_eq!(RetryPolicy::NextInterval.delay().as_millis(), 0);
    let retry = RetryPolicy::Immediate {
        max_retries: 1,
        delay_ms: 1_500,
    };
    assert_eq!(retry.delay().as_millis(), 1_500);
}
