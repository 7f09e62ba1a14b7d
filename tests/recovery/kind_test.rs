// Error Taxonomy Tests
// Kinds, severities, configuration and typed error classification

use crashlink::bus::BusError;
use crashlink::device::LinkError;
use crashlink::recovery::{
    Classify, ErrorKey, ErrorKind, ErrorRecord, RecoveryConfig, RecoveryError, Severity,
};
use crashlink::storage::StorageError;
use std::time::Duration;

// ============================================================================
// KINDS AND SEVERITIES
// ============================================================================

#[test]
fn test_every_kind_has_a_distinct_name() {
    let mut names: Vec<&str> = ErrorKind::ALL.iter().map(|k| k.as_str()).collect();
    names.sort();
    names.dedup();

    assert_eq!(names.len(), ErrorKind::ALL.len());
    assert_eq!(ErrorKind::ConnectionLost.to_string(), "CONNECTION_LOST");
}

#[test]
fn test_structural_kinds() {
    assert!(ErrorKind::PermissionDenied.is_structural());
    assert!(ErrorKind::Unknown.is_structural());
    assert!(!ErrorKind::ConnectionLost.is_structural());
    assert!(!ErrorKind::StorageOperationFailed.is_structural());
}

#[test]
fn test_battery_gets_one_attempt() {
    assert_eq!(ErrorKind::BatteryCritical.attempt_cap(3), 1);
    assert_eq!(ErrorKind::NetworkTimeout.attempt_cap(3), 3);
}

#[test]
fn test_severity_order_and_display() {
    assert!(Severity::Low < Severity::Medium);
    assert!(Severity::High < Severity::Critical);
    assert_eq!(Severity::default(), Severity::Medium);
    assert_eq!(Severity::Critical.to_string(), "CRITICAL");
}

// ============================================================================
// RECORDS
// ============================================================================

#[test]
fn test_record_id_format() {
    let record = ErrorRecord::new(ErrorKind::NetworkTimeout, "message_bus", "slow", Severity::Low);
    let parts: Vec<&str> = record.id.split('_').collect();

    assert_eq!(parts[0], "ERR");
    assert_eq!(parts[1], record.timestamp.timestamp_millis().to_string());
    let suffix: u32 = parts[2].parse().unwrap();
    assert!((1000..10000).contains(&suffix));
    assert_eq!(record.attempts, 0);
    assert!(!record.recovered);
}

#[test]
fn test_error_key_display() {
    let key = ErrorKey::new(ErrorKind::DeviceDisconnected, "transport_coordinator");

    assert_eq!(key.to_string(), "DEVICE_DISCONNECTED_transport_coordinator");
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn test_recovery_config_defaults() {
    let config = RecoveryConfig::default();

    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.retry_delay, Duration::from_secs(5));
    assert_eq!(config.error_window, Duration::from_secs(300));
    assert_eq!(config.max_errors_per_window, 10);
    assert_eq!(config.retention, Duration::from_secs(86_400));
    assert_eq!(config.monitor_interval, Duration::from_secs(60));
    assert!(config.validate().is_ok());
}

#[test]
fn test_recovery_config_rejects_bad_values() {
    assert!(RecoveryConfig::new().with_max_attempts(0).validate().is_err());
    assert!(RecoveryConfig::new()
        .with_error_window(Duration::ZERO)
        .validate()
        .is_err());
    assert!(RecoveryConfig::new()
        .with_monitor_interval(Duration::ZERO)
        .validate()
        .is_err());
    assert!(matches!(
        RecoveryConfig::new()
            .with_retention(Duration::from_secs(60))
            .validate(),
        Err(RecoveryError::InvalidConfig(_))
    ));
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[test]
fn test_bus_errors_classify() {
    assert_eq!(
        Classify::classify(&BusError::ConnectionLost("x".to_string())),
        (ErrorKind::ConnectionLost, Severity::High)
    );
    assert_eq!(
        Classify::classify(&BusError::PublishFailed("x".to_string())),
        (ErrorKind::MessagePublishFailed, Severity::Medium)
    );
    assert_eq!(
        Classify::classify(&BusError::Timeout),
        (ErrorKind::NetworkTimeout, Severity::Medium)
    );
    assert_eq!(
        Classify::classify(&BusError::InvalidTopic("x".to_string())),
        (ErrorKind::Unknown, Severity::Low)
    );
}

#[test]
fn test_link_errors_classify() {
    assert_eq!(
        Classify::classify(&LinkError::NotConnected),
        (ErrorKind::DeviceDisconnected, Severity::Medium)
    );
    assert_eq!(
        Classify::classify(&LinkError::Timeout),
        (ErrorKind::DeviceCommunicationFailed, Severity::Medium)
    );
    assert_eq!(
        Classify::classify(&LinkError::PermissionDenied("bt".to_string())),
        (ErrorKind::PermissionDenied, Severity::High)
    );
    assert_eq!(
        Classify::classify(&LinkError::RadioDisabled),
        (ErrorKind::HardwareUnavailable, Severity::Medium)
    );
}

#[test]
fn test_storage_errors_classify() {
    assert_eq!(
        Classify::classify(&StorageError::OpenFailed("locked".to_string())),
        (ErrorKind::StorageOperationFailed, Severity::High)
    );
    assert_eq!(
        Classify::classify(&StorageError::DeserializationFailed("bad".to_string())),
        (ErrorKind::StorageCorruption, Severity::High)
    );
}
