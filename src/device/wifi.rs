// WiFi-Direct Link
// Peer discovery through the platform directory, telemetry over a TCP socket to the group owner

use crate::device::link_core::LinkCore;
use crate::device::{
    DeviceDescriptor, DeviceLink, LinkConfig, LinkError, LinkState, SensorFrame, TransportKind,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// PEER DIRECTORY
// ============================================================================

/// Platform peer-to-peer WiFi service
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn discover_peers(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    async fn stop_peer_discovery(&self) {}

    /// Form a group with `device` and return the group owner's IP address
    async fn join_group(&self, device: &DeviceDescriptor) -> Result<String, LinkError>;

    async fn leave_group(&self) {}
}

// ============================================================================
// STATIC PEER DIRECTORY
// ============================================================================

/// Devices already on the local network, addressed by IP
pub struct StaticPeerDirectory {
    peers: Vec<DeviceDescriptor>,
}

impl StaticPeerDirectory {
    pub fn new(hosts: &[String]) -> Self {
        Self {
            peers: hosts
                .iter()
                .map(|host| DeviceDescriptor::wifi_peer(host).with_name(host))
                .collect(),
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    fn is_enabled(&self) -> bool {
        !self.peers.is_empty()
    }

    async fn discover_peers(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(self.peers.clone())
    }

    async fn join_group(&self, device: &DeviceDescriptor) -> Result<String, LinkError> {
        self.peers
            .iter()
            .find(|p| p.address == device.address)
            .map(|p| p.address.clone())
            .ok_or_else(|| LinkError::DeviceNotFound(device.address.clone()))
    }
}

// ============================================================================
// MOCK PEER DIRECTORY
// ============================================================================

/// Peer directory that resolves every group to a fixed host
pub struct MockPeerDirectory {
    enabled: AtomicBool,
    fail_join: AtomicBool,
    join_calls: AtomicUsize,
    host: Mutex<String>,
    peers: Mutex<Vec<DeviceDescriptor>>,
}

impl MockPeerDirectory {
    pub fn new(host: &str) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            fail_join: AtomicBool::new(false),
            join_calls: AtomicUsize::new(0),
            host: Mutex::new(host.to_string()),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_peers(self, peers: Vec<DeviceDescriptor>) -> Self {
        *self.peers.lock().unwrap_or_else(|e| e.into_inner()) = peers;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::SeqCst);
    }

    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDirectory for MockPeerDirectory {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn discover_peers(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn join_group(&self, device: &DeviceDescriptor) -> Result<String, LinkError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionFailed(format!(
                "Mock group formation failed for {}",
                device.address
            )));
        }
        Ok(self.host.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

// ============================================================================
// WIFI-DIRECT LINK
// ============================================================================

pub struct WifiDirectLink {
    config: LinkConfig,
    directory: Arc<dyn PeerDirectory>,
    core: Arc<LinkCore>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl WifiDirectLink {
    pub fn new(config: LinkConfig, directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            config,
            directory,
            core: LinkCore::new(TransportKind::WifiDirect),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    async fn open_socket(&self, host: &str) -> Result<TcpStream, LinkError> {
        let addr = format!("{}:{}", host, self.config.wifi_port);
        let wait = Duration::from_secs(self.config.wifi_connect_timeout_secs);
        let stream = timeout(wait, TcpStream::connect(&addr))
            .await
            .map_err(|_| LinkError::Timeout)??;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

#[async_trait]
impl DeviceLink for WifiDirectLink {
    fn kind(&self) -> TransportKind {
        TransportKind::WifiDirect
    }

    fn is_enabled(&self) -> bool {
        self.directory.is_enabled()
    }

    async fn start_discovery(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        if !self.directory.is_enabled() {
            return Err(LinkError::RadioDisabled);
        }
        self.core.clear_discovered();
        let found = self
            .directory
            .discover_peers()
            .await?
            .into_iter()
            .map(|d| DeviceDescriptor { kind: TransportKind::WifiDirect, ..d })
            .collect();
        Ok(self.core.record_discovered(found))
    }

    async fn stop_discovery(&self) {
        self.directory.stop_peer_discovery().await;
    }

    fn discovered(&self) -> Vec<DeviceDescriptor> {
        self.core.discovered()
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<(), LinkError> {
        if device.kind != TransportKind::WifiDirect {
            return Err(LinkError::InvalidAddress(format!(
                "{} is not a WiFi-direct peer",
                device.address
            )));
        }
        if !self.directory.is_enabled() {
            return Err(LinkError::RadioDisabled);
        }

        self.core.begin_connect()?;

        let result = match self.directory.join_group(device).await {
            Ok(host) => {
                debug!(%host, port = self.config.wifi_port, "connecting to group owner");
                self.open_socket(&host).await
            }
            Err(e) => Err(e),
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(address = %device.address, error = %e, "WiFi-direct connection failed");
                self.core.mark_failed();
                return Err(e);
            }
        };

        if let Ok(peer) = stream.peer_addr() {
            info!(%peer, "WiFi-direct socket open");
        }
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.core.mark_connected(device);
        self.core
            .spawn_line_reader(reader, LinkState::ConnectedWifi, self.config.buffer_size);
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
        debug!(%command, "command sent over WiFi-direct");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            self.directory.leave_group().await;
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
