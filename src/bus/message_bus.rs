// Message Bus
// Session lifecycle, publish/subscribe and reconnect-driven offline queue drain

use crate::bus::{
    now_millis, topics, BrokerSession, BusConfig, BusError, ConnectionState, InboundMessage,
    Message, OfflineMessageQueue, QoS, RetryReport, SessionEvent,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// PUBLISH OUTCOME
// ============================================================================

/// How a publish request ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker session
    Delivered,
    /// Held in the offline queue until the next drain
    Queued,
    /// Refused outright and not queued
    Rejected(BusError),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Completion handle returned by `MessageBus::publish`
///
/// Dropping the handle does not cancel the publish.
pub struct PublishHandle {
    rx: oneshot::Receiver<PublishOutcome>,
}

impl PublishHandle {
    fn ready(outcome: PublishOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Wait for the outcome
    pub async fn outcome(self) -> PublishOutcome {
        // The sender only disappears if the publish task was torn down, in
        // which case the message was already handed to the queue.
        self.rx.await.unwrap_or(PublishOutcome::Queued)
    }
}

// ============================================================================
// MESSAGE BUS
// ============================================================================

struct BusInner {
    config: BusConfig,
    session: Arc<dyn BrokerSession>,
    queue: OfflineMessageQueue,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    inbound: broadcast::Sender<InboundMessage>,
    errors: broadcast::Sender<BusError>,
    connect_gate: tokio::sync::Mutex<()>,
    drain_gate: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Publish/subscribe front end over a broker session
///
/// Cheap to clone; all clones share one session, queue and state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig, session: Arc<dyn BrokerSession>) -> Result<Self, BusError> {
        let queue = OfflineMessageQueue::new(config.queue_capacity);
        Self::with_queue(config, session, queue)
    }

    /// Build a bus around an existing (possibly journal-backed) queue
    pub fn with_queue(
        config: BusConfig,
        session: Arc<dyn BrokerSession>,
        queue: OfflineMessageQueue,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(256);
        let (errors, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                session,
                queue,
                state,
                subscriptions: Mutex::new(Vec::new()),
                inbound,
                errors,
                connect_gate: tokio::sync::Mutex::new(()),
                drain_gate: tokio::sync::Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Messages received on subscribed topics
    pub fn inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.inbound.subscribe()
    }

    /// Typed failures observed by the bus, for the recovery engine
    pub fn errors(&self) -> broadcast::Receiver<BusError> {
        self.inner.errors.subscribe()
    }

    pub fn queue(&self) -> &OfflineMessageQueue {
        &self.inner.queue
    }

    /// Topics that will be reissued after reconnect
    pub fn remembered_subscriptions(&self) -> Vec<String> {
        self.subscriptions().iter().map(|(t, _)| t.clone()).collect()
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<(String, QoS)>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                debug!(from = %current, to = %next, "unexpected bus state transition");
            }
            *current = next;
            true
        });
    }

    fn report(&self, error: BusError) {
        let _ = self.inner.errors.send(error);
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Connect to the broker, then reissue subscriptions and drain the queue.
    ///
    /// Concurrent callers wait for the attempt already in flight.
    pub async fn connect(&self) -> Result<(), BusError> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.ensure_watcher();
        self.set_state(ConnectionState::Connecting);
        info!(broker = %self.inner.config.broker_url(), "connecting to broker");

        let wait = Duration::from_secs(self.inner.config.connection_timeout_secs);
        let result = match timeout(wait, self.inner.session.connect()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout),
        };

        if let Err(e) = result {
            warn!(error = %e, "broker connection failed");
            self.set_state(ConnectionState::Disconnected);
            self.report(e.clone());
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        drop(_gate);

        if self.inner.config.resubscribe_on_reconnect {
            self.resubscribe().await;
        }

        let report = self.drain_queue().await;
        if report.attempted > 0 {
            info!(
                delivered = report.delivered,
                requeued = report.requeued,
                discarded = report.discarded,
                "offline queue drained after connect"
            );
        }

        Ok(())
    }

    /// Close the session. Queued messages stay queued.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let _gate = self.inner.connect_gate.lock().await;
        let result = self.inner.session.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected from broker");
        result
    }

    /// Network came back: connect unless connected or already connecting.
    ///
    /// Returns true if a connection attempt was started.
    pub fn on_network_available(&self) -> bool {
        if self.state() != ConnectionState::Disconnected {
            return false;
        }
        debug!("network available, scheduling broker connect");
        let bus = self.clone();
        tokio::spawn(async move {
            let _ = bus.connect().await;
        });
        true
    }

    /// Stop background work. The bus can still be reconnected afterwards.
    pub async fn shutdown(&self) {
        let _ = self.disconnect().await;
        if let Some(handle) = self.take_watcher() {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn take_watcher(&self) -> Option<JoinHandle<()>> {
        self.inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn ensure_watcher(&self) {
        let mut slot = self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut events = self.inner.session.events();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                let bus = MessageBus { inner };
                match event {
                    SessionEvent::Message(message) => {
                        let _ = bus.inner.inbound.send(message);
                    }
                    SessionEvent::ConnectionLost { reason } => {
                        warn!(%reason, "broker session lost");
                        bus.set_state(ConnectionState::Disconnected);
                        bus.report(BusError::ConnectionLost(reason));
                    }
                }
            }
        }));
    }

    // ------------------------------------------------------------------------
    // Publish / subscribe
    // ------------------------------------------------------------------------

    /// Publish without blocking. Anything that cannot be sent right now is
    /// queued; only invalid topics are rejected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retained: bool,
    ) -> PublishHandle {
        if !self.inner.config.is_valid_topic(topic) {
            warn!(%topic, "rejecting publish to invalid topic");
            return PublishHandle::ready(PublishOutcome::Rejected(BusError::InvalidTopic(
                topic.to_string(),
            )));
        }

        let message = Message::new(topic, payload)
            .with_qos(qos)
            .with_retained(retained);

        if !self.is_connected() {
            debug!(%topic, "not connected, queueing message");
            self.inner.queue.enqueue(message);
            return PublishHandle::ready(PublishOutcome::Queued);
        }

        let (tx, rx) = oneshot::channel();
        let bus = self.clone();
        tokio::spawn(async move {
            let outcome = match bus.inner.session.publish(&message).await {
                Ok(()) => {
                    debug!(topic = %message.topic(), "message published");
                    PublishOutcome::Delivered
                }
                Err(e) => {
                    warn!(topic = %message.topic(), error = %e, "publish failed, queueing message");
                    bus.inner.queue.enqueue(message);
                    bus.report(e);
                    PublishOutcome::Queued
                }
            };
            let _ = tx.send(outcome);
        });
        PublishHandle { rx }
    }

    /// Serialize `value` as JSON and publish it
    pub fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retained: bool,
    ) -> Result<PublishHandle, BusError> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(topic, payload, qos, retained))
    }

    /// Subscribe to each topic once. While disconnected the request is
    /// logged and dropped.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<(), BusError> {
        if let Some(bad) = topics.iter().find(|t| !self.inner.config.is_valid_topic(t)) {
            return Err(BusError::InvalidTopic(bad.to_string()));
        }

        if !self.is_connected() {
            info!(?topics, "not connected, dropping subscribe request");
            return Err(BusError::NotConnected);
        }

        let mut first_error = None;
        for topic in topics {
            match self.inner.session.subscribe(topic, QoS::AtLeastOnce).await {
                Ok(()) => {
                    debug!(%topic, "subscribed");
                    let mut subs = self.subscriptions();
                    if !subs.iter().any(|(t, _)| t == topic) {
                        subs.push((topic.to_string(), QoS::AtLeastOnce));
                    }
                }
                Err(e) => {
                    warn!(%topic, error = %e, "subscribe failed");
                    self.report(e.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reissue every remembered subscription; returns how many succeeded
    pub async fn resubscribe(&self) -> usize {
        let remembered: Vec<(String, QoS)> = self.subscriptions().clone();
        let mut restored = 0;
        for (topic, qos) in remembered {
            match self.inner.session.subscribe(&topic, qos).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(%topic, error = %e, "resubscribe failed");
                    self.report(e);
                }
            }
        }
        if restored > 0 {
            debug!(restored, "subscriptions reissued");
        }
        restored
    }

    /// Send a liveness probe on the system status topic. Never queued.
    pub async fn probe(&self) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let payload = serde_json::to_vec(&serde_json::json!({
            "type": "probe",
            "timestamp": now_millis(),
        }))?;
        let message = Message::new(topics::STATUS_SYSTEM, payload).with_qos(QoS::AtMostOnce);
        let wait = Duration::from_secs(self.inner.config.connection_timeout_secs);
        match timeout(wait, self.inner.session.publish(&message)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Run one retry pass over the offline queue
    pub async fn drain_queue(&self) -> RetryReport {
        let _gate = self.inner.drain_gate.lock().await;
        let session = self.inner.session.clone();
        self.inner
            .queue
            .retry_all(|message| {
                let session = session.clone();
                async move {
                    match session.publish(&message).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(topic = %message.topic(), error = %e, "retry failed");
                            false
                        }
                    }
                }
            })
            .await
    }
}
