// MQTT Session
// BrokerSession backed by rumqttc. One event-loop pump task per connection;
// the pump stops on the first connection error instead of reconnecting.
// A publish completes only once the broker has acknowledged it.

use crate::bus::{BrokerSession, BusConfig, BusError, InboundMessage, Message, QoS, SessionEvent};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

type AckSender = oneshot::Sender<Result<(), BusError>>;

// ============================================================================
// ACK TRACKING
// ============================================================================

/// Publishes waiting to be confirmed by the broker.
///
/// Packet ids are assigned inside the event loop, so waiters queue in request
/// order and are bound to an id when the loop reports the outgoing publish.
/// QoS 0 completes on send, QoS 1 on PUBACK, QoS 2 on PUBCOMP.
#[derive(Default)]
struct PendingAcks {
    unsent: VecDeque<(QoS, AckSender)>,
    inflight: HashMap<u16, AckSender>,
}

impl PendingAcks {
    fn register(&mut self, qos: QoS) -> oneshot::Receiver<Result<(), BusError>> {
        let (tx, rx) = oneshot::channel();
        self.unsent.push_back((qos, tx));
        rx
    }

    /// Undo the latest `register` when its request never reached the loop
    fn cancel_last(&mut self) {
        self.unsent.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        let Some((qos, tx)) = self.unsent.pop_front() else {
            debug!(pkid, "outgoing publish without a waiter");
            return;
        };
        if qos.is_retried() {
            self.inflight.insert(pkid, tx);
        } else {
            let _ = tx.send(Ok(()));
        }
    }

    fn on_ack(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let waiters = self
            .unsent
            .drain(..)
            .map(|(_, tx)| tx)
            .chain(self.inflight.drain().map(|(_, tx)| tx));
        for tx in waiters {
            let _ = tx.send(Err(BusError::ConnectionLost(reason.to_string())));
        }
    }

    fn len(&self) -> usize {
        self.unsent.len() + self.inflight.len()
    }
}

fn lock_acks(acks: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    acks.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// SESSION
// ============================================================================

pub struct MqttSession {
    config: BusConfig,
    client: Mutex<Option<AsyncClient>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
    acks: Arc<Mutex<PendingAcks>>,
    send_order: tokio::sync::Mutex<()>,
}

impl MqttSession {
    pub fn new(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            client: Mutex::new(None),
            pump: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            acks: Arc::new(Mutex::new(PendingAcks::default())),
            send_order: tokio::sync::Mutex::new(()),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id(),
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let mut acks = lock_acks(&self.acks);
        if acks.len() > 0 {
            debug!(pending = acks.len(), "failing unacknowledged publishes");
        }
        acks.fail_all("session stopped");
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn connect(&self) -> Result<(), BusError> {
        self.stop_pump();

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let connected = self.connected.clone();
        let events = self.events.clone();
        let acks = self.acks.clone();

        let pump = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                        let _ = events.send(SessionEvent::Message(InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        }));
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        lock_acks(&acks).on_outgoing(pkid);
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        lock_acks(&acks).on_ack(ack.pkid);
                    }
                    Ok(Event::Incoming(Packet::PubComp(comp))) => {
                        lock_acks(&acks).on_ack(comp.pkid);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected = connected.swap(false, Ordering::SeqCst);
                        lock_acks(&acks).fail_all(&e.to_string());
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(e.to_string()));
                        } else if was_connected {
                            warn!(error = %e, "broker session lost");
                            let _ = events.send(SessionEvent::ConnectionLost {
                                reason: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        });

        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);

        let wait = Duration::from_secs(self.config.connection_timeout_secs);
        match timeout(wait, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
                info!(broker = %self.config.broker_url(), "connected to broker");
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                self.stop_pump();
                Err(BusError::ConnectFailed(reason))
            }
            Ok(Err(_)) => {
                self.stop_pump();
                Err(BusError::ConnectFailed("event loop ended before acknowledgement".to_string()))
            }
            Err(_) => {
                self.stop_pump();
                Err(BusError::Timeout)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "disconnect request not delivered");
            }
        }
        self.stop_pump();
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let client = self.client().ok_or(BusError::NotConnected)?;

        // Waiters must enter the ack queue in the same order their requests
        // enter the rumqttc channel.
        let acked = {
            let _order = self.send_order.lock().await;
            let acked = lock_acks(&self.acks).register(message.qos());
            let sent = client
                .publish(
                    message.topic(),
                    message.qos().into(),
                    message.is_retained(),
                    message.payload().to_vec(),
                )
                .await;
            if let Err(e) = sent {
                lock_acks(&self.acks).cancel_last();
                return Err(BusError::PublishFailed(e.to_string()));
            }
            acked
        };

        let wait = Duration::from_secs(self.config.connection_timeout_secs);
        match timeout(wait, acked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ConnectionLost(
                "event loop ended before acknowledgement".to_string(),
            )),
            Err(_) => {
                warn!(topic = %message.topic(), "publish not acknowledged in time");
                Err(BusError::Timeout)
            }
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let client = self.client().ok_or(BusError::NotConnected)?;
        client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| BusError::SubscribeFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
