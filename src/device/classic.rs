// Classic Bluetooth Link
// Serial-port-profile stream to the device with newline-framed telemetry

use crate::device::link_core::LinkCore;
use crate::device::{
    DeviceDescriptor, DeviceLink, LinkConfig, LinkError, LinkState, SensorFrame, TransportKind,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

// ============================================================================
// SERIAL RADIO
// ============================================================================

/// Bidirectional byte stream opened over the serial-port profile
pub trait SerialStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialStream for T {}

/// Platform classic-Bluetooth adapter
#[async_trait]
pub trait SerialRadio: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Run one inquiry scan
    async fn scan(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    async fn cancel_scan(&self) {}

    /// Open an RFCOMM stream to `address` for the given service
    async fn open(&self, address: &str, service_uuid: &str) -> Result<Box<dyn SerialStream>, LinkError>;
}

// ============================================================================
// MOCK SERIAL RADIO
// ============================================================================

/// In-memory serial radio. Each successful `open` creates a duplex pipe; the
/// device end is handed to the test through `take_device_end`.
pub struct MockSerialRadio {
    enabled: AtomicBool,
    fail_open: AtomicBool,
    open_calls: AtomicUsize,
    devices: Mutex<Vec<DeviceDescriptor>>,
    device_ends: Mutex<Vec<DuplexStream>>,
}

impl MockSerialRadio {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            fail_open: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            devices: Mutex::new(Vec::new()),
            device_ends: Mutex::new(Vec::new()),
        }
    }

    /// Devices returned by every scan
    pub fn with_devices(self, devices: Vec<DeviceDescriptor>) -> Self {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = devices;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Device side of the most recently opened stream
    pub fn take_device_end(&self) -> Option<DuplexStream> {
        self.device_ends.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }
}

impl Default for MockSerialRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialRadio for MockSerialRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn scan(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn open(&self, address: &str, _service_uuid: &str) -> Result<Box<dyn SerialStream>, LinkError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionFailed(format!("Mock open failure for {}", address)));
        }
        let (ours, theirs) = tokio::io::duplex(4096);
        self.device_ends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(theirs);
        Ok(Box::new(ours))
    }
}

// ============================================================================
// CLASSIC LINK
// ============================================================================

pub struct ClassicLink {
    config: LinkConfig,
    radio: Arc<dyn SerialRadio>,
    core: Arc<LinkCore>,
    writer: tokio::sync::Mutex<Option<WriteHalf<Box<dyn SerialStream>>>>,
}

impl ClassicLink {
    pub fn new(config: LinkConfig, radio: Arc<dyn SerialRadio>) -> Self {
        Self {
            config,
            radio,
            core: LinkCore::new(TransportKind::Classic),
            writer: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl DeviceLink for ClassicLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Classic
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
            .map(|d| DeviceDescriptor { kind: TransportKind::Classic, ..d })
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
        debug!(address = %device.address, "opening classic serial stream");

        let wait = Duration::from_secs(self.config.bluetooth_connect_timeout_secs);
        let opened = match timeout(
            wait,
            self.radio.open(&device.address, &self.config.classic_service_uuid),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(address = %device.address, error = %e, "classic connection failed");
                self.core.mark_failed();
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.core.mark_connected(device);
        self.core
            .spawn_line_reader(reader, LinkState::ConnectedClassic, self.config.buffer_size);
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<(), LinkError> {
        if !self.core.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotConnected)?;

        let mut frame = command.as_bytes().to_vec();
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;
        debug!(%command, "command sent over classic link");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
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
