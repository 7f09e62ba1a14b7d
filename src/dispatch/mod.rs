// Dispatch module - CRASH ALERTS
// Turns an impact in the merged telemetry into a published emergency alert

use crate::bus::{
    now_millis, topics, BusError, EmergencyAlert, Location, MedicalInfo, MessageBus, QoS,
};
use crate::device::{MergedFrame, TransportCoordinator};
use crate::recovery::IncidentStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Who the alerts are about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub victim_id: String,
    pub victim_name: String,
    pub severity: String,
    pub medical_info: MedicalInfo,
    /// Used when the frame carries no GPS fix
    pub fallback_location: Option<Location>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            victim_id: "unknown".to_string(),
            victim_name: "Unknown".to_string(),
            severity: "HIGH".to_string(),
            medical_info: MedicalInfo::default(),
            fallback_location: None,
        }
    }
}

impl DispatchConfig {
    pub fn new(victim_id: &str, victim_name: &str) -> Self {
        Self {
            victim_id: victim_id.to_string(),
            victim_name: victim_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_severity(mut self, severity: &str) -> Self {
        self.severity = severity.to_string();
        self
    }

    pub fn with_medical_info(mut self, info: MedicalInfo) -> Self {
        self.medical_info = info;
        self
    }

    pub fn with_fallback_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.fallback_location = Some(Location {
            latitude,
            longitude,
        });
        self
    }
}

struct DispatchInner {
    config: DispatchConfig,
    bus: MessageBus,
    coordinator: TransportCoordinator,
    incidents: Arc<dyn IncidentStore>,
    alerts: broadcast::Sender<EmergencyAlert>,
    raised: AtomicUsize,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Publishes an emergency alert on each rising edge of impact detection
#[derive(Clone)]
pub struct CrashDispatcher {
    inner: Arc<DispatchInner>,
}

impl CrashDispatcher {
    pub fn new(
        config: DispatchConfig,
        bus: MessageBus,
        coordinator: TransportCoordinator,
        incidents: Arc<dyn IncidentStore>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(DispatchInner {
                config,
                bus,
                coordinator,
                incidents,
                alerts,
                raised: AtomicUsize::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Alerts raised so far
    pub fn alerts(&self) -> broadcast::Receiver<EmergencyAlert> {
        self.inner.alerts.subscribe()
    }

    pub fn alerts_raised(&self) -> usize {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Watch merged telemetry. Idempotent.
    pub fn start(&self) {
        let mut slot = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut telemetry = self.inner.coordinator.subscribe_telemetry();
        let threshold = self.inner.coordinator.impact_threshold();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut in_impact = false;
            while telemetry.changed().await.is_ok() {
                let merged = *telemetry.borrow_and_update();
                let impact = merged.is_some_and(|m| m.frame.exceeds(threshold));
                let rising = impact && !in_impact;
                in_impact = impact;
                if !rising {
                    continue;
                }

                let Some(inner) = weak.upgrade() else { break };
                let dispatcher = CrashDispatcher { inner };
                if let Some(merged) = merged {
                    if let Err(e) = dispatcher.raise(&merged).await {
                        error!(error = %e, "failed to raise crash alert");
                    }
                }
            }
            debug!("telemetry closed, dispatcher stopping");
        }));
    }

    /// Build and publish an alert for `merged`
    pub async fn raise(&self, merged: &MergedFrame) -> Result<EmergencyAlert, BusError> {
        let config = &self.inner.config;
        let incident_id = format!("incident_{}", now_millis());

        let location = match merged.frame.gps() {
            Some((latitude, longitude)) => Location {
                latitude,
                longitude,
            },
            None => {
                warn!(%incident_id, "no GPS fix in impact frame");
                config.fallback_location.unwrap_or(Location {
                    latitude: 0.0,
                    longitude: 0.0,
                })
            }
        };

        let alert = EmergencyAlert::new(&incident_id, &config.victim_id, &config.victim_name, location)
            .with_severity(&config.severity)
            .with_medical_info(config.medical_info.clone());

        info!(
            %incident_id,
            impact = merged.frame.impact_force,
            source = %merged.source,
            "impact detected, raising alert"
        );

        let payload = alert.to_json()?;
        let direct = self.inner.bus.publish(
            &topics::alert_incident(&incident_id),
            payload.clone(),
            QoS::AtLeastOnce,
            false,
        );
        let fanout = self
            .inner
            .bus
            .publish(topics::ALERT_BROADCAST, payload, QoS::AtLeastOnce, false);

        for (topic, handle) in [("incident", direct), ("broadcast", fanout)] {
            let outcome = handle.outcome().await;
            debug!(topic, ?outcome, "alert publish outcome");
        }

        if let Err(e) = self.inner.incidents.record_incident(&incident_id, Utc::now()).await {
            warn!(%incident_id, error = %e, "failed to record incident");
        }

        self.inner.raised.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.alerts.send(alert.clone());
        Ok(alert)
    }

    pub async fn shutdown(&self) {
        let task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = task {
            handle.abort();
            let _ = handle.await;
        }
    }
}
