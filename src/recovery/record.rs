// Error Records

use crate::recovery::{ErrorKind, Severity};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One reported error and what recovery made of it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub component: String,
    pub message: String,
    pub severity: Severity,
    pub recovered: bool,
    /// Failed recovery attempts so far
    pub attempts: u32,
    pub recovery_duration: Option<Duration>,
    pub escalated: bool,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, component: &str, message: &str, severity: Severity) -> Self {
        Self::at(Utc::now(), kind, component, message, severity)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        kind: ErrorKind,
        component: &str,
        message: &str,
        severity: Severity,
    ) -> Self {
        Self {
            id: generate_id(timestamp),
            timestamp,
            kind,
            component: component.to_string(),
            message: message.to_string(),
            severity,
            recovered: false,
            attempts: 0,
            recovery_duration: None,
            escalated: false,
        }
    }

    pub fn key(&self) -> ErrorKey {
        ErrorKey::new(self.kind, &self.component)
    }
}

fn generate_id(timestamp: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
    format!("ERR_{}_{}", timestamp.timestamp_millis(), suffix)
}

/// Rate-limiting key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorKey {
    pub kind: ErrorKind,
    pub component: String,
}

impl ErrorKey {
    pub fn new(kind: ErrorKind, component: &str) -> Self {
        Self {
            kind,
            component: component.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.kind, self.component)
    }
}

/// Snapshot of the error history
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    /// Errors inside the rolling window
    pub recent: usize,
    pub recovered: usize,
    pub critical: usize,
    /// Percentage of recorded errors that recovered
    pub recovery_rate: f64,
    /// Newest first
    pub history: Vec<ErrorRecord>,
}
