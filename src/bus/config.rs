// Bus Configuration and Errors

use crate::bus::queue::DEFAULT_QUEUE_CAPACITY;
use crate::recovery::{ErrorKind, Severity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// BUS CONFIG
// ============================================================================

/// Broker connection and queueing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Prefix for generated client identifiers
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connection_timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Only topics under this prefix may be published or subscribed
    pub topic_prefix: String,
    pub queue_capacity: usize,
    /// Reissue remembered subscriptions after every successful connect
    pub resubscribe_on_reconnect: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_host: "192.168.0.101".to_string(),
            broker_port: 1883,
            client_id_prefix: "android_client_".to_string(),
            keep_alive_secs: 60,
            connection_timeout_secs: 30,
            username: None,
            password: None,
            topic_prefix: "emergency/".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            resubscribe_on_reconnect: true,
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, host: &str, port: u16) -> Self {
        self.broker_host = host.to_string();
        self.broker_port = port;
        self
    }

    pub fn with_client_id_prefix(mut self, prefix: &str) -> Self {
        self.client_id_prefix = prefix.to_string();
        self
    }

    pub fn with_keep_alive(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_topic_prefix(mut self, prefix: &str) -> Self {
        self.topic_prefix = prefix.to_string();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_resubscribe_on_reconnect(mut self, enabled: bool) -> Self {
        self.resubscribe_on_reconnect = enabled;
        self
    }

    /// Generate a fresh client identifier
    pub fn client_id(&self) -> String {
        use rand::Rng;
        let suffix: u16 = rand::thread_rng().gen_range(0..1000);
        format!(
            "{}{}_{}",
            self.client_id_prefix,
            chrono::Utc::now().timestamp_millis(),
            suffix
        )
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.broker_host, self.broker_port)
    }

    pub fn has_authentication(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Check whether a topic may be used on this bus
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        topic.starts_with(&self.topic_prefix) && topic.len() > self.topic_prefix.len()
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.broker_host.trim().is_empty() {
            return Err(BusError::InvalidConfig("broker_host cannot be empty".to_string()));
        }
        if self.broker_port == 0 {
            return Err(BusError::InvalidConfig("broker_port cannot be 0".to_string()));
        }
        if self.connection_timeout_secs == 0 {
            return Err(BusError::InvalidConfig(
                "connection_timeout_secs cannot be 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::InvalidConfig("queue_capacity cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// BUS ERRORS
// ============================================================================

/// Errors produced by the message bus and its broker session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Broker operation timed out")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BusError {
    /// Check if the operation can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::ConnectFailed(_)
                | Self::ConnectionLost(_)
                | Self::PublishFailed(_)
                | Self::SubscribeFailed(_)
                | Self::Timeout
        )
    }

    /// Map this failure onto the recovery taxonomy
    pub fn classify(&self) -> (ErrorKind, Severity) {
        match self {
            Self::NotConnected | Self::ConnectFailed(_) | Self::ConnectionLost(_) => {
                (ErrorKind::ConnectionLost, Severity::High)
            }
            Self::SubscribeFailed(_) => (ErrorKind::ConnectionLost, Severity::Medium),
            Self::PublishFailed(_) => (ErrorKind::MessagePublishFailed, Severity::Medium),
            Self::Timeout => (ErrorKind::NetworkTimeout, Severity::Medium),
            Self::Storage(_) => (ErrorKind::StorageOperationFailed, Severity::Medium),
            Self::InvalidTopic(_) | Self::InvalidConfig(_) | Self::Serialization(_) => {
                (ErrorKind::Unknown, Severity::Low)
            }
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
