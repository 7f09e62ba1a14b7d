// Bluetooth Low Energy Link
// GATT notifications carry telemetry; commands are characteristic writes bounded by the MTU

use crate::device::link_core::LinkCore;
use crate::device::{
    DeviceDescriptor, DeviceLink, LinkConfig, LinkError, LinkState, SensorFrame, TransportKind,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

// ============================================================================
// GATT RADIO
// ============================================================================

/// Notification payloads; an `Err` or a closed channel ends the session
pub type NotificationStream = mpsc::Receiver<Result<Vec<u8>, LinkError>>;

/// An open GATT connection with notifications enabled on the data characteristic
pub struct GattSession {
    pub notifications: NotificationStream,
    pub writes: mpsc::Sender<Vec<u8>>,
    /// Negotiated ATT MTU
    pub mtu: u16,
}

/// Platform low-energy adapter
#[async_trait]
pub trait GattRadio: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    async fn cancel_scan(&self) {}

    /// Connect, discover `service_uuid` and subscribe to `characteristic_uuid`
    async fn connect(
        &self,
        address: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<GattSession, LinkError>;

    async fn disconnect(&self, _address: &str) {}
}

// ============================================================================
// MOCK GATT RADIO
// ============================================================================

/// Device side of a mock GATT session
pub struct MockGattPeer {
    pub notify: mpsc::Sender<Result<Vec<u8>, LinkError>>,
    pub writes: mpsc::Receiver<Vec<u8>>,
}

/// In-memory GATT radio with connect fault injection
pub struct MockGattRadio {
    enabled: AtomicBool,
    fail_connect: AtomicBool,
    connect_calls: AtomicUsize,
    mtu: u16,
    devices: Mutex<Vec<DeviceDescriptor>>,
    peers: Mutex<Vec<MockGattPeer>>,
}

impl MockGattRadio {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            mtu: 247,
            devices: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_devices(self, devices: Vec<DeviceDescriptor>) -> Self {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = devices;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Make every connect attempt fail
    pub fn with_connect_failure(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Device side of the most recent session
    pub fn take_peer(&self) -> Option<MockGattPeer> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }
}

impl Default for MockGattRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GattRadio for MockGattRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn connect(
        &self,
        address: &str,
        _service_uuid: &str,
        _characteristic_uuid: &str,
    ) -> Result<GattSession, LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionFailed(format!("Mock GATT failure for {}", address)));
        }
        let (notify, notifications) = mpsc::channel(32);
        let (writes, peer_writes) = mpsc::channel(32);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockGattPeer {
                notify,
                writes: peer_writes,
            });
        Ok(GattSession {
            notifications,
            writes,
            mtu: self.mtu,
        })
    }
}

// ============================================================================
// BLE LINK
// ============================================================================

struct ActiveGatt {
    address: String,
    writes: mpsc::Sender<Vec<u8>>,
    max_write: usize,
}

pub struct BleLink {
    config: LinkConfig,
    radio: Arc<dyn GattRadio>,
    core: Arc<LinkCore>,
    session: tokio::sync::Mutex<Option<ActiveGatt>>,
}

impl BleLink {
    pub fn new(config: LinkConfig, radio: Arc<dyn GattRadio>) -> Self {
        Self {
            config,
            radio,
            core: LinkCore::new(TransportKind::LowEnergy),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Largest command accepted on the current session
    pub async fn max_command_len(&self) -> Option<usize> {
        self.session.lock().await.as_ref().map(|s| s.max_write)
    }
}

#[async_trait]
impl DeviceLink for BleLink {
    fn kind(&self) -> TransportKind {
        TransportKind::LowEnergy
    }

    fn is_enabled(&self) -> bool {
        self.radio.is_enabled()
    }

    async fn start_discovery(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        if !self.radio.is_enabled() {
            return Err(LinkError::RadioDisabled);
        }
        self.core.clear_discovered();
        let found = self
            .radio
            .scan()
            .await?
            .into_iter()
            .map(|d| DeviceDescriptor { kind: TransportKind::LowEnergy, ..d })
            .collect();
        Ok(self.core.record_discovered(found))
    }

    async fn stop_discovery(&self) {
        self.radio.cancel_scan().await;
    }

    fn discovered(&self) -> Vec<DeviceDescriptor> {
        self.core.discovered()
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), LinkError> {
        if !device.kind.is_short_range() {
            return Err(LinkError::InvalidAddress(format!(
                "{} is not a Bluetooth device",
                device.address
            )));
        }
        if !self.radio.is_enabled() {
            return Err(LinkError::RadioDisabled);
        }

        self.core.begin_connect()?;
        debug!(address = %device.address, "connecting GATT");

        let wait = Duration::from_secs(self.config.bluetooth_connect_timeout_secs);
        let connected = match timeout(
            wait,
            self.radio.connect(
                &device.address,
                &self.config.gatt_service_uuid,
                &self.config.gatt_characteristic_uuid,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };

        let gatt = match connected {
            Ok(gatt) => gatt,
            Err(e) => {
                warn!(address = %device.address, error = %e, "GATT connection failed");
                self.core.mark_failed();
                return Err(e);
            }
        };

        let negotiated = LinkConfig {
            mtu: gatt.mtu.min(self.config.mtu),
            ..self.config.clone()
        };
        *self.session.lock().await = Some(ActiveGatt {
            address: device.address.clone(),
            writes: gatt.writes,
            max_write: negotiated.max_write_len(),
        });
        self.core.mark_connected(device);
        self.core
            .spawn_notification_reader(gatt.notifications, LinkState::ConnectedLowEnergy);
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<(), LinkError> {
        if !self.core.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(LinkError::NotConnected)?;

        let bytes = command.as_bytes();
        if bytes.len() > session.max_write {
            return Err(LinkError::PayloadTooLarge {
                size: bytes.len(),
                max: session.max_write,
            });
        }

        session
            .writes
            .send(bytes.to_vec())
            .await
            .map_err(|_| LinkError::NotConnected)?;
        debug!(%command, "command written to GATT characteristic");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(session) = self.session.lock().await.take() {
            self.radio.disconnect(&session.address).await;
        }
        self.core.mark_disconnected();
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.core.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.core.subscribe_state()
    }

    fn telemetry(&self) -> watch::Receiver<Option<SensorFrame>> {
        self.core.telemetry()
    }

    fn connected_device(&self) -> Option<DeviceDescriptor> {
        self.core.connected_device()
    }
}
