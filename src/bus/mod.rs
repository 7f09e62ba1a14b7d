// Bus Module - Broker messaging with offline queueing
// Publishes through a broker session, buffers while disconnected, drains on reconnect

mod config;
mod message;
mod message_bus;
mod mqtt;
mod queue;
mod session;
pub mod schema;
pub mod topics;

pub use config::{BusConfig, BusError};
pub use message::{ConnectionState, InboundMessage, Message, QoS};
pub(crate) use message::now_millis;
pub use message_bus::{MessageBus, PublishHandle, PublishOutcome};
pub use mqtt::MqttSession;
pub use queue::{OfflineMessageQueue, QueueStats, RetryReport, DEFAULT_QUEUE_CAPACITY};
pub use schema::{EmergencyAlert, Location, MedicalInfo, ResponseAck};
pub use session::{BrokerSession, MockBrokerSession, SessionEvent};
pub use topics::Role;
