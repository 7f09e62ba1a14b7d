// Application Context
// Owns the long-lived components and every background task they start

use crate::bus::MessageBus;
use crate::device::TransportCoordinator;
use crate::dispatch::{CrashDispatcher, DispatchConfig};
use crate::recovery::{
    Classify, Collaborators, ErrorRecoveryEngine, IncidentStore, RecoveryConfig, RecoveryError,
    SystemControl,
};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const BUS_COMPONENT: &str = "message_bus";
pub const DEVICE_COMPONENT: &str = "transport_coordinator";
pub const QUEUE_COMPONENT: &str = "offline_queue";

/// Explicit owner of the bus, device coordinator, recovery engine and dispatcher
pub struct CrashLinkContext {
    bus: MessageBus,
    coordinator: TransportCoordinator,
    engine: ErrorRecoveryEngine,
    dispatcher: CrashDispatcher,
    incidents: Arc<dyn IncidentStore>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl CrashLinkContext {
    pub fn new(
        bus: MessageBus,
        coordinator: TransportCoordinator,
        recovery: RecoveryConfig,
        dispatch: DispatchConfig,
        incidents: Arc<dyn IncidentStore>,
        system: Arc<dyn SystemControl>,
    ) -> Result<Self, RecoveryError> {
        let collaborators = Collaborators::for_components(
            bus.clone(),
            coordinator.clone(),
            incidents.clone(),
            system,
        );
        let engine = ErrorRecoveryEngine::new(recovery, collaborators)?;
        let dispatcher = CrashDispatcher::new(dispatch, bus.clone(), coordinator.clone(), incidents.clone());
        Ok(Self {
            bus,
            coordinator,
            engine,
            dispatcher,
            incidents,
            forwarders: Mutex::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &TransportCoordinator {
        &self.coordinator
    }

    pub fn engine(&self) -> &ErrorRecoveryEngine {
        &self.engine
    }

    pub fn dispatcher(&self) -> &CrashDispatcher {
        &self.dispatcher
    }

    pub fn incidents(&self) -> &Arc<dyn IncidentStore> {
        &self.incidents
    }

    /// Start link watchers, the recovery monitor, the dispatcher and the
    /// error forwarding from bus, coordinator and offline queue into the
    /// engine. Journal failures from the queue's restore are reported first.
    pub fn start(&self) {
        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        if !forwarders.is_empty() {
            return;
        }

        self.coordinator.start();
        self.engine.start_monitor();
        self.dispatcher.start();

        forwarders.push(forward_errors(
            self.bus.errors(),
            Vec::new(),
            self.engine.clone(),
            BUS_COMPONENT,
        ));
        forwarders.push(forward_errors(
            self.coordinator.errors(),
            Vec::new(),
            self.engine.clone(),
            DEVICE_COMPONENT,
        ));
        let queue = self.bus.queue();
        forwarders.push(forward_errors(
            queue.errors(),
            queue.take_restore_errors(),
            self.engine.clone(),
            QUEUE_COMPONENT,
        ));
        info!("crashlink context started");
    }

    /// Stop everything and wait for the background tasks to finish
    pub async fn shutdown(&self) {
        let forwarders: Vec<JoinHandle<()>> = self
            .forwarders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in forwarders {
            handle.abort();
            let _ = handle.await;
        }

        self.dispatcher.shutdown().await;
        self.engine.shutdown().await;
        self.coordinator.shutdown().await;
        self.bus.shutdown().await;
        info!("crashlink context stopped");
    }
}

fn forward_errors<E>(
    mut errors: broadcast::Receiver<E>,
    backlog: Vec<E>,
    engine: ErrorRecoveryEngine,
    component: &'static str,
) -> JoinHandle<()>
where
    E: Classify + Display + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        for err in backlog {
            engine.report(component, &err).await;
        }
        loop {
            match errors.recv().await {
                Ok(err) => {
                    engine.report(component, &err).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(component, skipped, "error stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
