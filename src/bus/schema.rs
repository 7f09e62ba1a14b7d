// Alert and Acknowledgement Payloads
// JSON bodies exchanged on the emergency topics (camelCase on the wire)

use crate::bus::BusError;
use serde::{Deserialize, Serialize};

pub const ALERT_TYPE: &str = "emergency_alert";
pub const ACK_TYPE: &str = "response_ack";

fn alert_type() -> String {
    ALERT_TYPE.to_string()
}

fn ack_type() -> String {
    ACK_TYPE.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalInfo {
    pub blood_type: String,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// Published on `emergency/alerts/<incidentId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlert {
    #[serde(rename = "type", default = "alert_type")]
    pub kind: String,
    pub incident_id: String,
    pub victim_id: String,
    pub victim_name: String,
    pub location: Location,
    /// Epoch millis
    pub timestamp: i64,
    pub severity: String,
    pub medical_info: MedicalInfo,
}

impl EmergencyAlert {
    pub fn new(incident_id: &str, victim_id: &str, victim_name: &str, location: Location) -> Self {
        Self {
            kind: alert_type(),
            incident_id: incident_id.to_string(),
            victim_id: victim_id.to_string(),
            victim_name: victim_name.to_string(),
            location,
            timestamp: chrono::Utc::now().timestamp_millis(),
            severity: "HIGH".to_string(),
            medical_info: MedicalInfo::default(),
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

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Published on `emergency/response/<incidentId>` or the ack channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAck {
    #[serde(rename = "type", default = "ack_type")]
    pub kind: String,
    pub incident_id: String,
    pub responder_id: String,
    pub responder_name: String,
    pub status: String,
    /// Seconds until arrival
    pub eta: i32,
    pub timestamp: i64,
}

impl ResponseAck {
    pub fn new(incident_id: &str, responder_id: &str, responder_name: &str, status: &str, eta: i32) -> Self {
        Self {
            kind: ack_type(),
            incident_id: incident_id.to_string(),
            responder_id: responder_id.to_string(),
            responder_name: responder_name.to_string(),
            status: status.to_string(),
            eta,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
