// Recovery Strategies
// One strategy per recoverable error kind

use crate::recovery::{Collaborators, ErrorKind, ErrorRecord, RecoveryConfig};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

// ============================================================================
// OUTCOMES
// ============================================================================

/// Work scheduled after a successful recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FollowUpAction {
    RestartMessageBus,
    RestartDiscovery,
    RestartLocation,
    VerifySubscriptions,
    FreeMemory,
    CheckStorage,
    ReduceBackgroundWork,
    EnablePowerSaving,
}

impl FollowUpAction {
    /// Essential actions still run in emergency mode
    pub fn is_essential(&self) -> bool {
        matches!(self, Self::RestartMessageBus | Self::VerifySubscriptions)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub message: String,
    pub elapsed: Duration,
    pub follow_ups: Vec<FollowUpAction>,
}

impl RecoveryOutcome {
    pub fn success(message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: true,
            message: message.into(),
            elapsed: started.elapsed(),
            follow_ups: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            message: message.into(),
            elapsed: started.elapsed(),
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_ups(mut self, actions: &[FollowUpAction]) -> Self {
        self.follow_ups.extend_from_slice(actions);
        self
    }
}

// ============================================================================
// STRATEGY TRAIT
// ============================================================================

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relative urgency, lower is more urgent. Informational: recoveries run
    /// in arrival order and this value only appears in logs.
    fn priority(&self) -> u8;

    fn max_attempts(&self) -> u32;

    fn can_attempt(&self, record: &ErrorRecord) -> bool {
        record.attempts < self.max_attempts()
    }

    async fn attempt(&self, record: &ErrorRecord) -> RecoveryOutcome;
}

/// Built-in strategies for every recoverable kind
pub fn default_strategies(
    collaborators: &Collaborators,
    config: &RecoveryConfig,
) -> HashMap<ErrorKind, Arc<dyn RecoveryStrategy>> {
    let cap = config.max_attempts;
    let location: Arc<dyn RecoveryStrategy> = Arc::new(LocationRestart {
        c: collaborators.clone(),
        pause: config.restart_pause,
        settle: config.settle_time,
        cap,
    });

    let mut strategies: HashMap<ErrorKind, Arc<dyn RecoveryStrategy>> = HashMap::new();
    strategies.insert(
        ErrorKind::ConnectionLost,
        Arc::new(BrokerReconnect {
            c: collaborators.clone(),
            cap,
        }),
    );
    strategies.insert(
        ErrorKind::MessagePublishFailed,
        Arc::new(PublishProbe {
            c: collaborators.clone(),
            name: "publish_probe",
            priority: 2,
            cap,
        }),
    );
    strategies.insert(
        ErrorKind::DeviceCommunicationFailed,
        Arc::new(DiscoveryRestart {
            c: collaborators.clone(),
            pause: config.restart_pause,
            settle: config.settle_time,
            cap,
        }),
    );
    strategies.insert(
        ErrorKind::DeviceDisconnected,
        Arc::new(DeviceReconnect {
            c: collaborators.clone(),
            settle: config.settle_time * 2,
            cap,
        }),
    );
    strategies.insert(ErrorKind::LocationServiceUnavailable, location.clone());
    strategies.insert(ErrorKind::LocationFixFailed, location);
    strategies.insert(
        ErrorKind::StorageOperationFailed,
        Arc::new(StorageProbe {
            c: collaborators.clone(),
            cap,
        }),
    );
    strategies.insert(
        ErrorKind::NetworkTimeout,
        Arc::new(PublishProbe {
            c: collaborators.clone(),
            name: "network_probe",
            priority: 7,
            cap,
        }),
    );
    strategies.insert(
        ErrorKind::MemoryAllocationFailed,
        Arc::new(MemoryReclaim {
            c: collaborators.clone(),
            pause: config.restart_pause,
            target_percent: config.memory_target_percent,
            cap,
        }),
    );
    strategies.insert(ErrorKind::BatteryCritical, Arc::new(PowerSaving));
    strategies.insert(
        ErrorKind::StorageFull,
        Arc::new(StoragePrune {
            c: collaborators.clone(),
            age: config.prune_age,
            batch: config.prune_batch,
            cap,
        }),
    );
    strategies
}

// ============================================================================
// BUILT-IN STRATEGIES
// ============================================================================

struct BrokerReconnect {
    c: Collaborators,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for BrokerReconnect {
    fn name(&self) -> &'static str {
        "broker_reconnect"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        if self.c.bus.is_connected() {
            return RecoveryOutcome::success("broker already connected", started);
        }
        match self.c.bus.reconnect().await {
            Ok(()) => RecoveryOutcome::success("broker reconnected", started)
                .with_follow_ups(&[FollowUpAction::VerifySubscriptions]),
            Err(e) => RecoveryOutcome::failure(format!("reconnect failed: {}", e), started),
        }
    }
}

struct PublishProbe {
    c: Collaborators,
    name: &'static str,
    priority: u8,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for PublishProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        match self.c.bus.probe().await {
            Ok(()) => RecoveryOutcome::success("probe publish succeeded", started),
            Err(e) => RecoveryOutcome::failure(format!("probe publish failed: {}", e), started),
        }
    }
}

struct DiscoveryRestart {
    c: Collaborators,
    pause: Duration,
    settle: Duration,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for DiscoveryRestart {
    fn name(&self) -> &'static str {
        "discovery_restart"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        let found = self.c.discovery.restart_discovery(self.pause, self.settle).await;
        if found > 0 {
            RecoveryOutcome::success(format!("{} devices found after restart", found), started)
        } else {
            RecoveryOutcome::failure("no devices found after restart", started)
        }
    }
}

struct DeviceReconnect {
    c: Collaborators,
    settle: Duration,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for DeviceReconnect {
    fn name(&self) -> &'static str {
        "device_reconnect"
    }

    fn priority(&self) -> u8 {
        4
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        match self.c.discovery.reconnect_device().await {
            Ok(()) => return RecoveryOutcome::success("device reconnected", started),
            Err(e) => debug!(error = %e, "direct reconnect failed, rediscovering"),
        }
        let found = self.c.discovery.discover(self.settle).await;
        if found > 0 {
            RecoveryOutcome::success(format!("{} devices available for reconnection", found), started)
        } else {
            RecoveryOutcome::failure("no devices available", started)
        }
    }
}

struct LocationRestart {
    c: Collaborators,
    pause: Duration,
    settle: Duration,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for LocationRestart {
    fn name(&self) -> &'static str {
        "location_restart"
    }

    fn priority(&self) -> u8 {
        5
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        self.c.location.stop_updates().await;
        sleep(self.pause).await;
        if let Err(e) = self.c.location.start_updates().await {
            return RecoveryOutcome::failure(format!("location restart failed: {}", e), started);
        }
        sleep(self.settle).await;
        match self.c.location.current_fix() {
            Some(_) => RecoveryOutcome::success("location fix available", started),
            None => RecoveryOutcome::failure("no location fix after restart", started),
        }
    }
}

struct StorageProbe {
    c: Collaborators,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for StorageProbe {
    fn name(&self) -> &'static str {
        "storage_probe"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        match self.c.incidents.health_check().await {
            Ok(()) => RecoveryOutcome::success("storage responding", started),
            Err(e) => RecoveryOutcome::failure(format!("storage probe failed: {}", e), started),
        }
    }
}

struct MemoryReclaim {
    c: Collaborators,
    pause: Duration,
    target_percent: f64,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for MemoryReclaim {
    fn name(&self) -> &'static str {
        "memory_reclaim"
    }

    fn priority(&self) -> u8 {
        8
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        self.c.bus.release_buffers();
        self.c.system.reclaim_memory().await;
        sleep(self.pause).await;
        match self.c.system.memory_usage_percent() {
            Some(usage) if usage < self.target_percent => {
                RecoveryOutcome::success(format!("memory usage at {:.1}%", usage), started)
            }
            Some(usage) => {
                RecoveryOutcome::failure(format!("memory usage still {:.1}%", usage), started)
            }
            None => RecoveryOutcome::failure("memory usage unavailable", started),
        }
    }
}

struct PowerSaving;

#[async_trait]
impl RecoveryStrategy for PowerSaving {
    fn name(&self) -> &'static str {
        "power_saving"
    }

    fn priority(&self) -> u8 {
        9
    }

    fn max_attempts(&self) -> u32 {
        ErrorKind::BatteryCritical.attempt_cap(1)
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        RecoveryOutcome::success("power saving requested", Instant::now()).with_follow_ups(&[
            FollowUpAction::ReduceBackgroundWork,
            FollowUpAction::EnablePowerSaving,
        ])
    }
}

struct StoragePrune {
    c: Collaborators,
    age: Duration,
    batch: usize,
    cap: u32,
}

#[async_trait]
impl RecoveryStrategy for StoragePrune {
    fn name(&self) -> &'static str {
        "storage_prune"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        let age = match chrono::Duration::from_std(self.age) {
            Ok(age) => age,
            Err(e) => return RecoveryOutcome::failure(format!("bad prune age: {}", e), started),
        };
        match self.c.incidents.prune_before(Utc::now() - age, self.batch).await {
            Ok(removed) => RecoveryOutcome::success(format!("pruned {} old incidents", removed), started)
                .with_follow_ups(&[FollowUpAction::CheckStorage]),
            Err(e) => RecoveryOutcome::failure(format!("prune failed: {}", e), started),
        }
    }
}

// ============================================================================
// MOCK STRATEGY
// ============================================================================

/// Strategy with a scripted sequence of results
pub struct MockRecoveryStrategy {
    cap: u32,
    script: Mutex<Vec<bool>>,
    fallback: bool,
    calls: AtomicUsize,
    follow_ups: Vec<FollowUpAction>,
    priority: u8,
    delay: Duration,
}

impl MockRecoveryStrategy {
    /// Always succeeds
    pub fn succeeding() -> Self {
        Self::new(true)
    }

    /// Always fails
    pub fn failing() -> Self {
        Self::new(false)
    }

    fn new(fallback: bool) -> Self {
        Self {
            cap: 3,
            script: Mutex::new(Vec::new()),
            fallback,
            calls: AtomicUsize::new(0),
            follow_ups: Vec::new(),
            priority: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, cap: u32) -> Self {
        self.cap = cap;
        self
    }

    /// Results for the first calls, in order; later calls use the fallback
    pub fn with_script(self, results: &[bool]) -> Self {
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = results.iter().rev().copied().collect();
        self
    }

    pub fn with_follow_ups(mut self, actions: &[FollowUpAction]) -> Self {
        self.follow_ups = actions.to_vec();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Time each attempt takes before reporting
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoveryStrategy for MockRecoveryStrategy {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn max_attempts(&self) -> u32 {
        self.cap
    }

    async fn attempt(&self, _record: &ErrorRecord) -> RecoveryOutcome {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop();
        if next.unwrap_or(self.fallback) {
            RecoveryOutcome::success("mock recovery", started).with_follow_ups(&self.follow_ups)
        } else {
            RecoveryOutcome::failure("mock failure", started)
        }
    }
}
