// Topic Namespace
// Builders for every topic under `emergency/` and the per-role subscription sets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const EMERGENCY_ALERTS: &str = "emergency/alerts";
pub const EMERGENCY_STATUS: &str = "emergency/status";
pub const EMERGENCY_RESPONSE: &str = "emergency/response";
pub const RESPONSE_ACK: &str = "emergency/response/ack";

pub const ALERT_BROADCAST: &str = "emergency/alerts/broadcast";
pub const STATUS_SYSTEM: &str = "emergency/status/system";
pub const RESPONSE_BROADCAST: &str = "emergency/response/broadcast";

pub fn alert_incident(incident_id: &str) -> String {
    format!("{}/{}", EMERGENCY_ALERTS, incident_id)
}

pub fn status_incident(incident_id: &str) -> String {
    format!("{}/{}", EMERGENCY_STATUS, incident_id)
}

pub fn response_incident(incident_id: &str) -> String {
    format!("{}/{}", EMERGENCY_RESPONSE, incident_id)
}

pub fn response_ack(incident_id: &str) -> String {
    format!("{}/{}", RESPONSE_ACK, incident_id)
}

/// Whether a topic carries emergency alerts
pub fn is_alert_topic(topic: &str) -> bool {
    topic == EMERGENCY_ALERTS || topic.starts_with("emergency/alerts/")
}

/// Whether a topic carries responder acknowledgements
pub fn is_ack_topic(topic: &str) -> bool {
    topic == RESPONSE_ACK || topic.starts_with("emergency/response/ack/")
}

/// Which side of the emergency exchange this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Vehicle side: raises alerts, listens for responses
    Publisher,
    /// Responder side: listens for every alert
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Topics a client in `role` should subscribe to
pub fn subscriptions_for_role(role: Role, incident_id: Option<&str>) -> Vec<String> {
    match role {
        Role::Publisher => {
            let mut topics = Vec::with_capacity(3);
            if let Some(id) = incident_id {
                topics.push(alert_incident(id));
            }
            topics.push(STATUS_SYSTEM.to_string());
            topics.push(RESPONSE_BROADCAST.to_string());
            topics
        }
        Role::Subscriber => vec![
            ALERT_BROADCAST.to_string(),
            format!("{}/+", EMERGENCY_ALERTS),
            format!("{}/+", EMERGENCY_STATUS),
            format!("{}/+", EMERGENCY_RESPONSE),
            format!("{}/+", RESPONSE_ACK),
        ],
    }
}
