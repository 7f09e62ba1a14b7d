// Recovery Configuration and Errors

use crate::recovery::{Classify, ErrorKind, Severity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// RECOVERY CONFIG
// ============================================================================

/// Tuning for the recovery engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Recovery attempts per error before escalation (battery errors get one)
    pub max_attempts: u32,
    /// Fixed backoff before a failed recovery is retried
    pub retry_delay: Duration,
    /// Rolling window for the per-(kind, component) error rate
    pub error_window: Duration,
    /// More errors than this inside the window enters emergency mode
    pub max_errors_per_window: usize,
    /// Records older than this are purged
    pub retention: Duration,
    /// Cadence of the rate monitor and retention purge
    pub monitor_interval: Duration,
    /// Time allowed for discovery or a location fix to settle
    pub settle_time: Duration,
    /// Pause between stopping and restarting a service
    pub restart_pause: Duration,
    /// Incidents older than this may be pruned when storage is full
    pub prune_age: Duration,
    /// Incidents removed per prune
    pub prune_batch: usize,
    /// Memory usage (percent) below which memory recovery counts as successful
    pub memory_target_percent: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            error_window: Duration::from_secs(5 * 60),
            max_errors_per_window: 10,
            retention: Duration::from_secs(24 * 60 * 60),
            monitor_interval: Duration::from_secs(60),
            settle_time: Duration::from_secs(5),
            restart_pause: Duration::from_secs(1),
            prune_age: Duration::from_secs(7 * 24 * 60 * 60),
            prune_batch: 10,
            memory_target_percent: 80.0,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_error_window(mut self, window: Duration) -> Self {
        self.error_window = window;
        self
    }

    pub fn with_max_errors_per_window(mut self, max: usize) -> Self {
        self.max_errors_per_window = max;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle_time = settle;
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    pub fn validate(&self) -> Result<(), RecoveryError> {
        if self.max_attempts == 0 {
            return Err(RecoveryError::InvalidConfig("max_attempts cannot be 0".to_string()));
        }
        if self.error_window.is_zero() {
            return Err(RecoveryError::InvalidConfig("error_window cannot be 0".to_string()));
        }
        if self.monitor_interval.is_zero() {
            return Err(RecoveryError::InvalidConfig("monitor_interval cannot be 0".to_string()));
        }
        if self.retention < self.error_window {
            return Err(RecoveryError::InvalidConfig(
                "retention must cover the error window".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// RECOVERY ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("No recovery strategy for {0}")]
    NoStrategy(ErrorKind),

    #[error("Recovery attempts exhausted for {0}")]
    AttemptsExhausted(String),

    #[error("Collaborator failed: {0}")]
    Collaborator(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Classify for RecoveryError {
    fn classify(&self) -> (ErrorKind, Severity) {
        match self {
            Self::Collaborator(_) => (ErrorKind::Unknown, Severity::Medium),
            _ => (ErrorKind::Unknown, Severity::Low),
        }
    }
}
