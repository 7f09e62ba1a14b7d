// Broker Session
// The seam between the message bus and whatever actually talks to the broker

use crate::bus::{BusError, InboundMessage, Message, QoS};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Events a session reports back to the bus
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message arrived on a subscribed topic
    Message(InboundMessage),
    /// The underlying session dropped
    ConnectionLost { reason: String },
}

// ============================================================================
// BROKER SESSION TRAIT
// ============================================================================

/// A connection to a publish/subscribe broker
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Establish the session
    async fn connect(&self) -> Result<(), BusError>;

    /// Tear the session down
    async fn disconnect(&self) -> Result<(), BusError>;

    /// Send one message
    async fn publish(&self, message: &Message) -> Result<(), BusError>;

    /// Subscribe to one topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError>;

    /// Whether the session currently believes it is connected
    fn is_connected(&self) -> bool;

    /// Stream of inbound messages and connection-loss notifications
    fn events(&self) -> broadcast::Receiver<SessionEvent>;
}

// ============================================================================
// MOCK BROKER SESSION
// ============================================================================

/// In-memory broker session with fault injection, for tests and dry runs
pub struct MockBrokerSession {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    fail_publish: AtomicBool,
    publish_failures_remaining: AtomicUsize,
    connect_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    publish_delay: Mutex<Option<Duration>>,
    fail_topics: Mutex<Vec<String>>,
    published: Mutex<Vec<Message>>,
    subscriptions: Mutex<Vec<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MockBrokerSession {
    /// Create a mock that accepts connections and publishes
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            publish_failures_remaining: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            publish_delay: Mutex::new(None),
            fail_topics: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Refuse (or accept again) connection attempts
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Fail every publish until switched off
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes, then succeed
    pub fn fail_next_publishes(&self, n: usize) {
        self.publish_failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every publish to this exact topic
    pub fn fail_topic(&self, topic: &str) {
        lock(&self.fail_topics).push(topic.to_string());
    }

    /// Delay each publish, to widen race windows in tests
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *lock(&self.publish_delay) = delay;
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    /// Simulate a message arriving from the broker
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let _ = self.events.send(SessionEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }));
    }

    /// Messages the broker accepted, in arrival order
    pub fn published(&self) -> Vec<Message> {
        lock(&self.published).clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.published)
            .iter()
            .map(|m| m.topic().to_string())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockBrokerSession {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl BrokerSession for MockBrokerSession {
    async fn connect(&self) -> Result<(), BusError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(BusError::ConnectFailed("Mock broker refused connection".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.publish_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::PublishFailed("Mock failure".to_string()));
        }
        let remaining = self.publish_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.publish_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::PublishFailed("Mock failure".to_string()));
        }
        if lock(&self.fail_topics).iter().any(|t| t == message.topic()) {
            return Err(BusError::PublishFailed(format!(
                "Mock failure on {}",
                message.topic()
            )));
        }

        lock(&self.published).push(message.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        lock(&self.subscriptions).push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
