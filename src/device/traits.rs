// Device Link Traits and Core Types
// Defines the DeviceLink trait and the types shared by every transport variant

use crate::device::SensorFrame;
use crate::recovery::{ErrorKind, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// LINK CONFIG
// ============================================================================

/// Configuration shared by the device transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Bluetooth (classic and low-energy) connect timeout in seconds
    pub bluetooth_connect_timeout_secs: u64,
    /// WiFi-direct socket connect timeout in seconds
    pub wifi_connect_timeout_secs: u64,
    /// TCP port the device listens on in WiFi-direct mode
    pub wifi_port: u16,
    /// Negotiated ATT MTU for low-energy command writes
    pub mtu: u16,
    pub gatt_service_uuid: String,
    pub gatt_characteristic_uuid: String,
    /// Serial-port profile UUID for the classic transport
    pub classic_service_uuid: String,
    pub impact_threshold: f32,
    /// Longest telemetry line accepted on stream transports; longer lines are dropped
    pub buffer_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bluetooth_connect_timeout_secs: 10,
            wifi_connect_timeout_secs: 5,
            wifi_port: 8888,
            mtu: 247,
            gatt_service_uuid: "4fafc201-1fb5-459e-8fcc-c5c9c331914b".to_string(),
            gatt_characteristic_uuid: "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string(),
            classic_service_uuid: "00001101-0000-1000-8000-00805f9b34fb".to_string(),
            impact_threshold: crate::device::IMPACT_THRESHOLD,
            buffer_size: 1024,
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bluetooth_connect_timeout(mut self, secs: u64) -> Self {
        self.bluetooth_connect_timeout_secs = secs;
        self
    }

    pub fn with_wifi_connect_timeout(mut self, secs: u64) -> Self {
        self.wifi_connect_timeout_secs = secs;
        self
    }

    pub fn with_wifi_port(mut self, port: u16) -> Self {
        self.wifi_port = port;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu.max(MIN_MTU);
        self
    }

    pub fn with_impact_threshold(mut self, threshold: f32) -> Self {
        self.impact_threshold = threshold;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Largest command that fits in one low-energy write
    pub fn max_write_len(&self) -> usize {
        (self.mtu as usize).saturating_sub(ATT_HEADER_LEN)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mtu < MIN_MTU {
            return Err(LinkError::InvalidConfig(format!("mtu must be at least {}", MIN_MTU)));
        }
        if self.wifi_port == 0 {
            return Err(LinkError::InvalidConfig("wifi_port cannot be 0".to_string()));
        }
        if !self.impact_threshold.is_finite() || self.impact_threshold <= 0.0 {
            return Err(LinkError::InvalidConfig(
                "impact_threshold must be a positive number".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(LinkError::InvalidConfig("buffer_size cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// BLE minimum ATT MTU
pub const MIN_MTU: u16 = 23;
const ATT_HEADER_LEN: usize = 3;

// ============================================================================
// TRANSPORT KIND
// ============================================================================

/// Physical transport a link or device uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Classic,
    LowEnergy,
    WifiDirect,
}

impl TransportKind {
    /// Classic and low-energy devices are the same radio peer
    pub fn is_short_range(&self) -> bool {
        matches!(self, Self::Classic | Self::LowEnergy)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Classic => "Bluetooth Classic",
            Self::LowEnergy => "Bluetooth BLE",
            Self::WifiDirect => "WiFi Direct",
        }
    }

    /// State a link of this kind reports once connected
    pub fn connected_state(&self) -> LinkState {
        match self {
            Self::Classic => LinkState::ConnectedClassic,
            Self::LowEnergy => LinkState::ConnectedLowEnergy,
            Self::WifiDirect => LinkState::ConnectedWifi,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// LINK STATE
// ============================================================================

/// Per-link connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    ConnectedClassic,
    ConnectedLowEnergy,
    ConnectedWifi,
    Error,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::ConnectedClassic | Self::ConnectedLowEnergy | Self::ConnectedWifi
        )
    }

    pub fn can_transition_to(&self, target: &LinkState) -> bool {
        match (self, target) {
            (Self::Disconnected | Self::Error, Self::Connecting) => true,
            (Self::Connecting, t) if t.is_connected() => true,
            (Self::Connecting, Self::Disconnected | Self::Error) => true,
            (s, Self::Disconnected | Self::Error) if s.is_connected() => true,
            (Self::Error, Self::Disconnected) => true,
            _ => false,
        }
    }
}

// ============================================================================
// DEVICE DESCRIPTOR
// ============================================================================

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: TransportKind,
    /// MAC address or peer identifier; the deduplication key
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub connected: bool,
}

impl DeviceDescriptor {
    pub fn new(kind: TransportKind, address: &str) -> Self {
        Self {
            kind,
            address: normalize_address(kind, address),
            name: None,
            rssi: None,
            connected: false,
        }
    }

    /// A Bluetooth peer (classic or low-energy; the coordinator decides)
    pub fn bluetooth(address: &str) -> Self {
        Self::new(TransportKind::LowEnergy, address)
    }

    pub fn wifi_peer(address: &str) -> Self {
        Self::new(TransportKind::WifiDirect, address)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

fn normalize_address(kind: TransportKind, address: &str) -> String {
    if kind.is_short_range() {
        address.trim().to_uppercase()
    } else {
        address.trim().to_string()
    }
}

/// Keep the first entry per address, in discovery order
pub(crate) fn dedup_by_address(found: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut unique: Vec<DeviceDescriptor> = Vec::with_capacity(found.len());
    for device in found {
        if !unique.iter().any(|d| d.address == device.address) {
            unique.push(device);
        }
    }
    unique
}

// ============================================================================
// LINK ERRORS
// ============================================================================

/// Errors that can occur on a device link
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("Radio disabled or unavailable")]
    RadioDisabled,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl LinkError {
    /// Check if the operation can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout | Self::NotConnected | Self::Io(_)
        )
    }

    /// Map this failure onto the recovery taxonomy
    pub fn classify(&self) -> (ErrorKind, Severity) {
        match self {
            Self::RadioDisabled => (ErrorKind::HardwareUnavailable, Severity::Medium),
            Self::PermissionDenied(_) => (ErrorKind::PermissionDenied, Severity::High),
            Self::NotConnected | Self::Io(_) => (ErrorKind::DeviceDisconnected, Severity::Medium),
            Self::ConnectionFailed(_) | Self::ServiceNotFound(_) | Self::Timeout => {
                (ErrorKind::DeviceCommunicationFailed, Severity::Medium)
            }
            Self::DeviceNotFound(_) | Self::PayloadTooLarge { .. } => {
                (ErrorKind::DeviceCommunicationFailed, Severity::Low)
            }
            Self::InvalidAddress(_) | Self::InvalidConfig(_) => (ErrorKind::Unknown, Severity::Low),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionFailed(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

// ============================================================================
// DEVICE LINK TRAIT
// ============================================================================

/// One transport to the vehicle sensor device
#[async_trait]
pub trait DeviceLink: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the underlying radio is switched on
    fn is_enabled(&self) -> bool;

    /// Clear previous results, scan, and return the deduplicated device set
    async fn start_discovery(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    async fn stop_discovery(&self);

    fn discovered(&self) -> Vec<DeviceDescriptor>;

    /// Connect and start the telemetry read loop
    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), LinkError>;

    async fn send_command(&self, command: &str) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    fn state(&self) -> LinkState;

    fn subscribe_state(&self) -> watch::Receiver<LinkState>;

    /// Most recent frame from this link; superseded by each new frame
    fn telemetry(&self) -> watch::Receiver<Option<SensorFrame>>;

    fn latest_frame(&self) -> Option<SensorFrame> {
        *self.telemetry().borrow()
    }

    /// The device this link is connected to, if any
    fn connected_device(&self) -> Option<DeviceDescriptor>;
}
