// Recovery Ports
// What recovery strategies are allowed to touch, and the adapters for the
// components this crate owns

use crate::bus::MessageBus;
use crate::device::TransportCoordinator;
use crate::recovery::RecoveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// MESSAGE BUS CONTROL
// ============================================================================

#[async_trait]
pub trait BusControl: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), RecoveryError>;

    /// Disconnect, pause, connect
    async fn restart(&self, pause: Duration) -> Result<(), RecoveryError>;

    /// Prove the session can publish
    async fn probe(&self) -> Result<(), RecoveryError>;

    /// Reissue remembered subscriptions; returns how many were restored
    async fn verify_subscriptions(&self) -> usize;

    fn release_buffers(&self);
}

#[async_trait]
impl BusControl for MessageBus {
    fn is_connected(&self) -> bool {
        MessageBus::is_connected(self)
    }

    async fn reconnect(&self) -> Result<(), RecoveryError> {
        self.connect()
            .await
            .map_err(|e| RecoveryError::Collaborator(e.to_string()))
    }

    async fn restart(&self, pause: Duration) -> Result<(), RecoveryError> {
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "disconnect before restart failed");
        }
        sleep(pause).await;
        self.reconnect().await
    }

    async fn probe(&self) -> Result<(), RecoveryError> {
        MessageBus::probe(self)
            .await
            .map_err(|e| RecoveryError::Collaborator(e.to_string()))
    }

    async fn verify_subscriptions(&self) -> usize {
        if !MessageBus::is_connected(self) {
            return 0;
        }
        self.resubscribe().await
    }

    fn release_buffers(&self) {
        self.queue().shrink();
    }
}

// ============================================================================
// DEVICE DISCOVERY CONTROL
// ============================================================================

#[async_trait]
pub trait DiscoveryControl: Send + Sync {
    /// Run discovery for at most `settle`; returns devices known afterwards
    async fn discover(&self, settle: Duration) -> usize;

    async fn stop_discovery(&self);

    /// Stop, pause, then discover again
    async fn restart_discovery(&self, pause: Duration, settle: Duration) -> usize {
        self.stop_discovery().await;
        sleep(pause).await;
        self.discover(settle).await
    }

    /// Reconnect the last connected device
    async fn reconnect_device(&self) -> Result<(), RecoveryError>;
}

#[async_trait]
impl DiscoveryControl for TransportCoordinator {
    async fn discover(&self, settle: Duration) -> usize {
        if self.start_discovery() > 0 && timeout(settle, self.wait_for_discovery()).await.is_err() {
            debug!("discovery still running after settle time");
        }
        self.discovered_devices().len()
    }

    async fn stop_discovery(&self) {
        TransportCoordinator::stop_discovery(self).await;
    }

    async fn reconnect_device(&self) -> Result<(), RecoveryError> {
        self.reconnect_last()
            .await
            .map(|_| ())
            .map_err(|e| RecoveryError::Collaborator(e.to_string()))
    }
}

// ============================================================================
// LOCATION PROVIDER
// ============================================================================

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn stop_updates(&self);

    async fn start_updates(&self) -> Result<(), RecoveryError>;

    fn current_fix(&self) -> Option<(f64, f64)>;
}

/// The vehicle device reports GPS in its telemetry, so the coordinator
/// doubles as a location source.
#[async_trait]
impl LocationProvider for TransportCoordinator {
    async fn stop_updates(&self) {}

    async fn start_updates(&self) -> Result<(), RecoveryError> {
        if self.active_transport().is_none() {
            return Err(RecoveryError::Collaborator("no device link for GPS".to_string()));
        }
        Ok(())
    }

    fn current_fix(&self) -> Option<(f64, f64)> {
        self.gps_coordinates()
    }
}

/// Location source with a settable fix
pub struct MockLocationProvider {
    fix: Mutex<Option<(f64, f64)>>,
    fail_start: AtomicBool,
    restarts: AtomicUsize,
}

impl MockLocationProvider {
    pub fn new() -> Self {
        Self {
            fix: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn with_fix(self, latitude: f64, longitude: f64) -> Self {
        self.set_fix(Some((latitude, longitude)));
        self
    }

    pub fn set_fix(&self, fix: Option<(f64, f64)>) {
        *self.fix.lock().unwrap_or_else(|e| e.into_inner()) = fix;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Default for MockLocationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn stop_updates(&self) {}

    async fn start_updates(&self) -> Result<(), RecoveryError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RecoveryError::Collaborator("Mock location start failed".to_string()));
        }
        Ok(())
    }

    fn current_fix(&self) -> Option<(f64, f64)> {
        *self.fix.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// INCIDENT STORE
// ============================================================================

/// Incident repository consulted by storage recovery
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn record_incident(&self, incident_id: &str, at: DateTime<Utc>) -> Result<(), RecoveryError>;

    /// Write, read back and delete a probe entry
    async fn health_check(&self) -> Result<(), RecoveryError>;

    /// Delete up to `limit` incidents created before `cutoff`, oldest first
    async fn prune_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, RecoveryError>;

    async fn incident_count(&self) -> Result<usize, RecoveryError>;
}

/// Process-local incident store
pub struct InMemoryIncidentStore {
    incidents: Mutex<HashMap<String, DateTime<Utc>>>,
    fail_operations: AtomicBool,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self {
            incidents: Mutex::new(HashMap::new()),
            fail_operations: AtomicBool::new(false),
        }
    }

    pub fn set_fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, incident_id: &str) -> bool {
        self.incidents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(incident_id)
    }

    fn check(&self) -> Result<(), RecoveryError> {
        if self.fail_operations.load(Ordering::SeqCst) {
            return Err(RecoveryError::Collaborator("incident store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryIncidentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncidentStore for InMemoryIncidentStore {
    async fn record_incident(&self, incident_id: &str, at: DateTime<Utc>) -> Result<(), RecoveryError> {
        self.check()?;
        self.incidents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(incident_id.to_string(), at);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RecoveryError> {
        self.check()?;
        let mut incidents = self.incidents.lock().unwrap_or_else(|e| e.into_inner());
        let probe = format!("probe_{}", Utc::now().timestamp_millis());
        incidents.insert(probe.clone(), Utc::now());
        let found = incidents.remove(&probe).is_some();
        if !found {
            return Err(RecoveryError::Collaborator("probe entry vanished".to_string()));
        }
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, RecoveryError> {
        self.check()?;
        let mut incidents = self.incidents.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired: Vec<(String, DateTime<Utc>)> = incidents
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        expired.sort_by_key(|(_, at)| *at);
        expired.truncate(limit);
        for (id, _) in &expired {
            incidents.remove(id);
        }
        Ok(expired.len())
    }

    async fn incident_count(&self) -> Result<usize, RecoveryError> {
        self.check()?;
        Ok(self.incidents.lock().unwrap_or_else(|e| e.into_inner()).len())
    }
}

// ============================================================================
// SYSTEM CONTROL
// ============================================================================

/// Host resources and power policy
#[async_trait]
pub trait SystemControl: Send + Sync {
    /// Used memory in percent, if the host reports it
    fn memory_usage_percent(&self) -> Option<f64>;

    async fn reclaim_memory(&self);

    async fn enable_power_saving(&self);

    fn is_power_saving(&self) -> bool;
}

/// Reads memory pressure from /proc/meminfo
pub struct HostSystem {
    power_saving: AtomicBool,
}

impl HostSystem {
    pub fn new() -> Self {
        Self {
            power_saving: AtomicBool::new(false),
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn meminfo_field(meminfo: &str, field: &str) -> Option<f64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
        .and_then(|kb| kb.parse::<f64>().ok())
}

#[async_trait]
impl SystemControl for HostSystem {
    fn memory_usage_percent(&self) -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let total = meminfo_field(&meminfo, "MemTotal")?;
        let available = meminfo_field(&meminfo, "MemAvailable")?;
        if total <= 0.0 {
            return None;
        }
        Some((1.0 - available / total) * 100.0)
    }

    async fn reclaim_memory(&self) {
        debug!("memory reclaim requested");
    }

    async fn enable_power_saving(&self) {
        if !self.power_saving.swap(true, Ordering::SeqCst) {
            info!("power saving enabled");
        }
    }

    fn is_power_saving(&self) -> bool {
        self.power_saving.load(Ordering::SeqCst)
    }
}

/// System control with scripted memory readings
pub struct MockSystemControl {
    memory_usage: Mutex<Option<f64>>,
    usage_after_reclaim: Mutex<Option<f64>>,
    reclaims: AtomicUsize,
    power_saving: AtomicBool,
}

impl MockSystemControl {
    pub fn new() -> Self {
        Self {
            memory_usage: Mutex::new(Some(50.0)),
            usage_after_reclaim: Mutex::new(None),
            reclaims: AtomicUsize::new(0),
            power_saving: AtomicBool::new(false),
        }
    }

    pub fn set_memory_usage(&self, usage: Option<f64>) {
        *self.memory_usage.lock().unwrap_or_else(|e| e.into_inner()) = usage;
    }

    /// Usage reported once `reclaim_memory` has run
    pub fn set_usage_after_reclaim(&self, usage: f64) {
        *self.usage_after_reclaim.lock().unwrap_or_else(|e| e.into_inner()) = Some(usage);
    }

    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl Default for MockSystemControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemControl for MockSystemControl {
    fn memory_usage_percent(&self) -> Option<f64> {
        *self.memory_usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn reclaim_memory(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        let after = *self.usage_after_reclaim.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(usage) = after {
            self.set_memory_usage(Some(usage));
        }
    }

    async fn enable_power_saving(&self) {
        self.power_saving.store(true, Ordering::SeqCst);
    }

    fn is_power_saving(&self) -> bool {
        self.power_saving.load(Ordering::SeqCst)
    }
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Everything recovery may act on
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn BusControl>,
    pub discovery: Arc<dyn DiscoveryControl>,
    pub location: Arc<dyn LocationProvider>,
    pub incidents: Arc<dyn IncidentStore>,
    pub system: Arc<dyn SystemControl>,
}

impl Collaborators {
    pub fn new(
        bus: Arc<dyn BusControl>,
        discovery: Arc<dyn DiscoveryControl>,
        location: Arc<dyn LocationProvider>,
        incidents: Arc<dyn IncidentStore>,
        system: Arc<dyn SystemControl>,
    ) -> Self {
        Self {
            bus,
            discovery,
            location,
            incidents,
            system,
        }
    }

    /// Wire the crate's own bus and coordinator, with the device as location source
    pub fn for_components(
        bus: MessageBus,
        coordinator: TransportCoordinator,
        incidents: Arc<dyn IncidentStore>,
        system: Arc<dyn SystemControl>,
    ) -> Self {
        if coordinator.links().is_empty() {
            warn!("recovery wired to a coordinator without links");
        }
        Self {
            bus: Arc::new(bus),
            discovery: Arc::new(coordinator.clone()),
            location: Arc::new(coordinator),
            incidents,
            system,
        }
    }
}
