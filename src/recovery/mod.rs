// Recovery Module - Error intake, automatic recovery and escalation
// Transient failures are retried with fixed backoff, the rest escalate

mod config;
mod engine;
mod kind;
mod ports;
mod record;
mod strategy;

pub use config::{RecoveryConfig, RecoveryError};
pub use engine::{EmergencyReason, ErrorRecoveryEngine, RecoveryEvent};
pub use kind::{Classify, ErrorKind, Severity};
pub use ports::{
    BusControl, Collaborators, DiscoveryControl, HostSystem, InMemoryIncidentStore, IncidentStore,
    LocationProvider, MockLocationProvider, MockSystemControl, SystemControl,
};
pub use record::{ErrorKey, ErrorRecord, ErrorStatistics};
pub use strategy::{
    default_strategies, FollowUpAction, MockRecoveryStrategy, RecoveryOutcome, RecoveryStrategy,
};
