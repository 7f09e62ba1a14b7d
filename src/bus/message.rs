// Message Types
// Broker-bound messages, delivery levels and connection state shared by the bus

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// QUALITY OF SERVICE
// ============================================================================

/// Delivery guarantee requested for a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// Fire-and-forget
    AtMostOnce,
    /// Retried until acknowledged; duplicates possible
    AtLeastOnce,
    /// Protocol-level exactly-once (passed through, not exercised by the bus)
    ExactlyOnce,
}

impl QoS {
    /// Map a numeric level (0/1/2). Anything above 2 is clamped to 2.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Only QoS >= 1 messages are retried from the offline queue
    pub fn is_retried(&self) -> bool {
        !matches!(self, Self::AtMostOnce)
    }
}

impl Default for QoS {
    fn default() -> Self {
        Self::AtLeastOnce
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// A message bound for the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
    enqueued_at: u64,
}

impl Message {
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QoS::default(),
            retained: false,
            enqueued_at: now_millis(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn is_retained(&self) -> bool {
        self.retained
    }

    /// Epoch millis at which the message was created or last queued
    pub fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }

    pub(crate) fn touch(&mut self) {
        self.enqueued_at = now_millis();
    }
}

/// A message delivered to us by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        match (self, target) {
            (Self::Disconnected, Self::Connecting) => true,
            (Self::Connecting, Self::Connected) => true,
            (Self::Connecting, Self::Disconnected) => true,
            (Self::Connected, Self::Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
