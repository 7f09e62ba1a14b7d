// Transport Coordinator
// Owns the device links, aggregates discovery, picks the active transport and merges telemetry

use crate::device::traits::dedup_by_address;
use crate::device::{
    DeviceDescriptor, DeviceLink, LinkConfig, LinkError, LinkState, SensorFrame, TransportKind,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// COORDINATOR STATE
// ============================================================================

/// Aggregate state across all links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Error,
}

/// The latest frame from any link, tagged with where it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedFrame {
    pub frame: SensorFrame,
    pub source: TransportKind,
}

const KIND_ORDER: [TransportKind; 3] = [
    TransportKind::Classic,
    TransportKind::LowEnergy,
    TransportKind::WifiDirect,
];

// ============================================================================
// TRANSPORT COORDINATOR
// ============================================================================

struct CoordInner {
    links: Vec<Arc<dyn DeviceLink>>,
    threshold: f32,
    state: watch::Sender<CoordinatorState>,
    active: watch::Sender<Option<TransportKind>>,
    devices: watch::Sender<Vec<DeviceDescriptor>>,
    merged: watch::Sender<Option<MergedFrame>>,
    pending_discovery: watch::Sender<usize>,
    errors: broadcast::Sender<LinkError>,
    last_device: Mutex<Option<DeviceDescriptor>>,
    discovery_tasks: Mutex<Vec<JoinHandle<()>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CoordInner {
    fn link(&self, kind: TransportKind) -> Option<&Arc<dyn DeviceLink>> {
        self.links.iter().find(|l| l.kind() == kind)
    }

    fn active(&self) -> Option<TransportKind> {
        *self.active.borrow()
    }

    fn settle_state(&self) {
        let next = if self.active().is_some() {
            CoordinatorState::Connected
        } else {
            CoordinatorState::Disconnected
        };
        self.state.send_replace(next);
    }

    fn merge_devices(&self, found: Vec<DeviceDescriptor>) {
        self.devices.send_modify(|devices| {
            let mut all = std::mem::take(devices);
            all.extend(found);
            *devices = dedup_by_address(all);
        });
    }

    fn on_link_state(&self, kind: TransportKind, state: LinkState) {
        if self.active() != Some(kind) {
            return;
        }
        if matches!(state, LinkState::Disconnected | LinkState::Error) {
            warn!(link = %kind, "active device link dropped");
            self.active.send_replace(None);
            self.state.send_replace(CoordinatorState::Disconnected);
            let _ = self.errors.send(LinkError::NotConnected);
        }
    }
}

/// Single owner of every device link
///
/// Cheap to clone. Exactly one transport is reported active at a time.
#[derive(Clone)]
pub struct TransportCoordinator {
    inner: Arc<CoordInner>,
}

impl TransportCoordinator {
    pub fn new(config: &LinkConfig, links: Vec<Arc<dyn DeviceLink>>) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Disconnected);
        let (active, _) = watch::channel(None);
        let (devices, _) = watch::channel(Vec::new());
        let (merged, _) = watch::channel(None);
        let (pending_discovery, _) = watch::channel(0);
        let (errors, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordInner {
                links,
                threshold: config.impact_threshold,
                state,
                active,
                devices,
                merged,
                pending_discovery,
                errors,
                last_device: Mutex::new(None),
                discovery_tasks: Mutex::new(Vec::new()),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the per-link telemetry and state watchers. Idempotent.
    pub fn start(&self) {
        let mut watchers = lock(&self.inner.watchers);
        if !watchers.is_empty() {
            return;
        }
        for link in &self.inner.links {
            watchers.push(spawn_link_watcher(link.as_ref(), Arc::downgrade(&self.inner)));
        }
        debug!(links = self.inner.links.len(), "transport coordinator started");
    }

    pub fn links(&self) -> &[Arc<dyn DeviceLink>] {
        &self.inner.links
    }

    pub fn link(&self, kind: TransportKind) -> Option<Arc<dyn DeviceLink>> {
        self.inner.link(kind).cloned()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        self.inner.active()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<TransportKind>> {
        self.inner.active.subscribe()
    }

    /// Failures the coordinator could not absorb, for the recovery engine
    pub fn errors(&self) -> broadcast::Receiver<LinkError> {
        self.inner.errors.subscribe()
    }

    fn report(&self, error: LinkError) {
        let _ = self.inner.errors.send(error);
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Start discovery on every enabled link. Returns how many were started.
    pub fn start_discovery(&self) -> usize {
        self.abort_discovery();
        self.inner.devices.send_replace(Vec::new());

        let enabled: Vec<Arc<dyn DeviceLink>> = self
            .inner
            .links
            .iter()
            .filter(|l| l.is_enabled())
            .cloned()
            .collect();

        if enabled.is_empty() {
            warn!("no transport radio is enabled, discovery not started");
            self.report(LinkError::RadioDisabled);
            return 0;
        }

        self.inner.state.send_replace(CoordinatorState::Discovering);
        self.inner.pending_discovery.send_replace(enabled.len());

        let mut tasks = lock(&self.inner.discovery_tasks);
        for link in enabled {
            let weak = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(async move {
                let kind = link.kind();
                let result = link.start_discovery().await;
                let Some(inner) = weak.upgrade() else { return };
                match result {
                    Ok(found) => {
                        debug!(link = %kind, count = found.len(), "devices discovered");
                        inner.merge_devices(found);
                    }
                    Err(e) => {
                        warn!(link = %kind, error = %e, "discovery failed");
                        let _ = inner.errors.send(e);
                    }
                }
                let mut finished = false;
                inner.pending_discovery.send_modify(|n| {
                    *n = n.saturating_sub(1);
                    finished = *n == 0;
                });
                if finished && *inner.state.borrow() == CoordinatorState::Discovering {
                    inner.settle_state();
                }
            }));
        }

        info!(count = tasks.len(), "started device discovery on all available methods");
        tasks.len()
    }

    /// Wait until every discovery started by `start_discovery` has finished
    pub async fn wait_for_discovery(&self) {
        let mut pending = self.inner.pending_discovery.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    fn abort_discovery(&self) {
        for task in lock(&self.inner.discovery_tasks).drain(..) {
            task.abort();
        }
        self.inner.pending_discovery.send_replace(0);
    }

    /// Cancel discovery scheduling; in-flight radio I/O is not interrupted
    pub async fn stop_discovery(&self) {
        self.abort_discovery();
        for link in &self.inner.links {
            link.stop_discovery().await;
        }
        if self.state() == CoordinatorState::Discovering {
            self.inner.settle_state();
        }
        info!("stopped device discovery");
    }

    pub fn discovered_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.devices.borrow().clone()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DeviceDescriptor>> {
        self.inner.devices.subscribe()
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect to a discovered device.
    ///
    /// Bluetooth devices try low-energy first and fall back to classic;
    /// WiFi peers connect directly. A previously active link is left open.
    pub async fn connect_to_device(&self, device: &DeviceDescriptor) -> Result<TransportKind, LinkError> {
        self.inner.state.send_replace(CoordinatorState::Connecting);
        let previous = self.active_transport();

        let result = if device.kind.is_short_range() {
            self.connect_short_range(device).await
        } else {
            self.connect_with(TransportKind::WifiDirect, device).await
        };

        match result {
            Ok(kind) => {
                if let Some(prev) = previous.filter(|p| *p != kind) {
                    if self.inner.link(prev).is_some_and(|l| l.state().is_connected()) {
                        warn!(previous = %prev, active = %kind, "previous device link left open");
                    }
                }
                self.inner.active.send_replace(Some(kind));
                *lock(&self.inner.last_device) = Some(device.clone());
                self.inner.state.send_replace(CoordinatorState::Connected);
                info!(device = %device.display_name(), transport = %kind, "device connected");
                Ok(kind)
            }
            Err(e) => {
                self.inner.state.send_replace(CoordinatorState::Error);
                self.report(e.clone());
                Err(e)
            }
        }
    }

    async fn connect_with(&self, kind: TransportKind, device: &DeviceDescriptor) -> Result<TransportKind, LinkError> {
        let link = self.inner.link(kind).ok_or(LinkError::RadioDisabled)?;
        link.connect(device).await.map(|_| kind)
    }

    async fn connect_short_range(&self, device: &DeviceDescriptor) -> Result<TransportKind, LinkError> {
        let ble_error = match self.inner.link(TransportKind::LowEnergy) {
            Some(link) if link.is_enabled() => match link.connect(device).await {
                Ok(()) => return Ok(TransportKind::LowEnergy),
                Err(e) => {
                    warn!(address = %device.address, error = %e, "BLE connection failed, trying classic");
                    Some(e)
                }
            },
            _ => None,
        };

        match self.inner.link(TransportKind::Classic) {
            Some(_) => self
                .connect_with(TransportKind::Classic, device)
                .await
                .map_err(|e| {
                    error!(address = %device.address, error = %e, "both Bluetooth methods failed");
                    e
                }),
            None => Err(ble_error.unwrap_or(LinkError::RadioDisabled)),
        }
    }

    /// Reconnect to the last device that connected successfully
    pub async fn reconnect_last(&self) -> Result<TransportKind, LinkError> {
        let device = lock(&self.inner.last_device)
            .clone()
            .ok_or_else(|| LinkError::DeviceNotFound("no previous device".to_string()))?;
        self.connect_to_device(&device).await
    }

    pub async fn send_command(&self, command: &str) -> Result<(), LinkError> {
        let link = self
            .active_transport()
            .and_then(|kind| self.inner.link(kind))
            .ok_or(LinkError::NotConnected)?;
        link.send_command(command).await.map_err(|e| {
            warn!(error = %e, "command not delivered to device");
            self.report(e.clone());
            e
        })
    }

    /// Disconnect every link
    pub async fn disconnect(&self) {
        self.inner.active.send_replace(None);
        for link in &self.inner.links {
            if let Err(e) = link.disconnect().await {
                debug!(link = %link.kind(), error = %e, "disconnect failed");
            }
        }
        self.inner.state.send_replace(CoordinatorState::Disconnected);
        info!("disconnected from device");
    }

    /// Stop discovery, disconnect, and join the watcher tasks
    pub async fn shutdown(&self) {
        self.stop_discovery().await;
        self.disconnect().await;
        let watchers: Vec<JoinHandle<()>> = lock(&self.inner.watchers).drain(..).collect();
        for handle in watchers {
            handle.abort();
            let _ = handle.await;
        }
    }

    // ------------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------------

    /// Most recent frame from any link (last write wins)
    pub fn latest_frame(&self) -> Option<MergedFrame> {
        *self.inner.merged.borrow()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<Option<MergedFrame>> {
        self.inner.merged.subscribe()
    }

    pub fn impact_threshold(&self) -> f32 {
        self.inner.threshold
    }

    pub fn is_impact_detected(&self) -> bool {
        self.latest_frame()
            .is_some_and(|m| m.frame.exceeds(self.inner.threshold))
    }

    pub fn gps_coordinates(&self) -> Option<(f64, f64)> {
        self.latest_frame().and_then(|m| m.frame.gps())
    }

    pub fn has_gps_data(&self) -> bool {
        self.gps_coordinates().is_some()
    }

    pub fn sensor_data_status(&self) -> String {
        match self.latest_frame() {
            Some(m) => m.frame.summary(),
            None => "No sensor data".to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------------

    pub fn available_methods(&self) -> Vec<&'static str> {
        KIND_ORDER
            .iter()
            .filter(|kind| self.inner.link(**kind).is_some_and(|l| l.is_enabled()))
            .map(|kind| kind.label())
            .collect()
    }

    pub fn is_communication_available(&self) -> bool {
        self.inner.links.iter().any(|l| l.is_enabled())
    }

    pub fn connection_status(&self) -> String {
        match self.active_transport() {
            Some(kind) => format!("Connected via {}", kind.label()),
            None => "Not connected".to_string(),
        }
    }
}

fn spawn_link_watcher(link: &dyn DeviceLink, inner: Weak<CoordInner>) -> JoinHandle<()> {
    let kind = link.kind();
    let mut telemetry = link.telemetry();
    let mut state = link.subscribe_state();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = telemetry.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let frame = *telemetry.borrow_and_update();
                    let Some(inner) = inner.upgrade() else { break };
                    if let Some(frame) = frame {
                        inner.merged.send_replace(Some(MergedFrame { frame, source: kind }));
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    let Some(inner) = inner.upgrade() else { break };
                    inner.on_link_state(kind, current);
                }
            }
        }
    })
}
