// Error Taxonomy
// Kinds and severities understood by the recovery engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionLost,
    MessagePublishFailed,
    DeviceCommunicationFailed,
    DeviceDisconnected,
    LocationServiceUnavailable,
    LocationFixFailed,
    StorageOperationFailed,
    StorageCorruption,
    NetworkTimeout,
    MemoryAllocationFailed,
    BatteryCritical,
    StorageFull,
    PermissionDenied,
    HardwareUnavailable,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 15] = [
        Self::ConnectionLost,
        Self::MessagePublishFailed,
        Self::DeviceCommunicationFailed,
        Self::DeviceDisconnected,
        Self::LocationServiceUnavailable,
        Self::LocationFixFailed,
        Self::StorageOperationFailed,
        Self::StorageCorruption,
        Self::NetworkTimeout,
        Self::MemoryAllocationFailed,
        Self::BatteryCritical,
        Self::StorageFull,
        Self::PermissionDenied,
        Self::HardwareUnavailable,
        Self::Unknown,
    ];

    /// Structural kinds are surfaced, never retried
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::HardwareUnavailable | Self::StorageCorruption | Self::Unknown
        )
    }

    /// Recovery attempts allowed before escalation
    pub fn attempt_cap(&self, default_cap: u32) -> u32 {
        match self {
            Self::BatteryCritical => 1,
            _ => default_cap,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::MessagePublishFailed => "MESSAGE_PUBLISH_FAILED",
            Self::DeviceCommunicationFailed => "DEVICE_COMMUNICATION_FAILED",
            Self::DeviceDisconnected => "DEVICE_DISCONNECTED",
            Self::LocationServiceUnavailable => "LOCATION_SERVICE_UNAVAILABLE",
            Self::LocationFixFailed => "LOCATION_FIX_FAILED",
            Self::StorageOperationFailed => "STORAGE_OPERATION_FAILED",
            Self::StorageCorruption => "STORAGE_CORRUPTION",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::MemoryAllocationFailed => "MEMORY_ALLOCATION_FAILED",
            Self::BatteryCritical => "BATTERY_CRITICAL",
            Self::StorageFull => "STORAGE_FULL",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::HardwareUnavailable => "HARDWARE_UNAVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Typed failures that can be fed into the recovery engine
pub trait Classify {
    fn classify(&self) -> (ErrorKind, Severity);
}

impl Classify for crate::bus::BusError {
    fn classify(&self) -> (ErrorKind, Severity) {
        crate::bus::BusError::classify(self)
    }
}

impl Classify for crate::device::LinkError {
    fn classify(&self) -> (ErrorKind, Severity) {
        crate::device::LinkError::classify(self)
    }
}

impl Classify for crate::storage::StorageError {
    fn classify(&self) -> (ErrorKind, Severity) {
        use crate::storage::StorageError;
        match self {
            StorageError::OpenFailed(_) => (ErrorKind::StorageOperationFailed, Severity::High),
            StorageError::DatabaseError(_) | StorageError::FlushFailed(_) => {
                (ErrorKind::StorageOperationFailed, Severity::Medium)
            }
            StorageError::SerializationFailed(_) | StorageError::DeserializationFailed(_) => {
                (ErrorKind::StorageCorruption, Severity::High)
            }
        }
    }
}
