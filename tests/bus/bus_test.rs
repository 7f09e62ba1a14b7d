// Message Bus Tests
// Connect, publish, offline queueing and reconnect behaviour against the mock session

use crashlink::bus::{
    topics, BusConfig, BusError, ConnectionState, MessageBus, MockBrokerSession, PublishOutcome,
    QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn setup() -> (MessageBus, Arc<MockBrokerSession>) {
    let session = Arc::new(MockBrokerSession::new());
    let bus = MessageBus::new(BusConfig::default(), session.clone()).unwrap();
    (bus, session)
}

async fn wait_for_state(bus: &MessageBus, target: ConnectionState) {
    let mut rx = bus.subscribe_state();
    timeout(Duration::from_secs(1), rx.wait_for(|s| *s == target))
        .await
        .expect("state not reached")
        .unwrap();
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn test_bus_config_defaults() {
    let config = BusConfig::default();

    assert_eq!(config.broker_host, "192.168.0.101");
    assert_eq!(config.broker_port, 1883);
    assert_eq!(config.keep_alive_secs, 60);
    assert_eq!(config.connection_timeout_secs, 30);
    assert_eq!(config.topic_prefix, "emergency/");
    assert_eq!(config.queue_capacity, 1000);
    assert!(config.resubscribe_on_reconnect);
    assert!(config.validate().is_ok());
}

#[test]
fn test_bus_config_rejects_bad_values() {
    assert!(BusConfig::new().with_broker("", 1883).validate().is_err());
    assert!(BusConfig::new().with_broker("localhost", 0).validate().is_err());
    assert!(BusConfig::new().with_connection_timeout(0).validate().is_err());
    assert!(BusConfig::new().with_queue_capacity(0).validate().is_err());
}

#[test]
fn test_topic_validation() {
    let config = BusConfig::default();

    assert!(config.is_valid_topic("emergency/alerts/broadcast"));
    assert!(!config.is_valid_topic("emergency/"));
    assert!(!config.is_valid_topic("test/topic"));
    assert!(!config.is_valid_topic(""));
}

#[test]
fn test_client_id_uses_prefix() {
    let config = BusConfig::new().with_client_id_prefix("car_");

    assert!(config.client_id().starts_with("car_"));
    assert_eq!(config.broker_url(), "tcp://192.168.0.101:1883");
    assert!(!config.has_authentication());
    assert!(config.with_credentials("u", "p").has_authentication());
}

#[test]
fn test_bus_new_rejects_invalid_config() {
    let session = Arc::new(MockBrokerSession::new());
    let result = MessageBus::new(BusConfig::new().with_queue_capacity(0), session);

    assert!(matches!(result, Err(BusError::InvalidConfig(_))));
}

// ============================================================================
// CONNECT
// ============================================================================

#[tokio::test]
async fn test_connect_sets_connected() {
    let (bus, session) = setup();

    assert_eq!(bus.state(), ConnectionState::Disconnected);
    bus.connect().await.unwrap();

    assert!(bus.is_connected());
    assert_eq!(session.connect_calls(), 1);
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();
    bus.connect().await.unwrap();

    assert_eq!(session.connect_calls(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let (bus, session) = setup();
    session.set_refuse_connect(true);
    let mut errors = bus.errors();

    let result = bus.connect().await;

    assert!(matches!(result, Err(BusError::ConnectFailed(_))));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
    assert!(matches!(errors.recv().await.unwrap(), BusError::ConnectFailed(_)));
}

#[tokio::test]
async fn test_on_network_available_only_when_disconnected() {
    let (bus, _session) = setup();

    assert!(bus.on_network_available());
    wait_for_state(&bus, ConnectionState::Connected).await;

    assert!(!bus.on_network_available());
}

#[tokio::test]
async fn test_connection_loss_is_observed() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();
    let mut errors = bus.errors();

    session.drop_connection("keep-alive timeout");
    wait_for_state(&bus, ConnectionState::Disconnected).await;

    let err = timeout(Duration::from_secs(1), errors.recv()).await.unwrap().unwrap();
    assert_eq!(err, BusError::ConnectionLost("keep-alive timeout".to_string()));
}

// ============================================================================
// PUBLISH
// ============================================================================

#[tokio::test]
async fn test_publish_when_connected_is_delivered() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();

    let outcome = bus
        .publish(topics::ALERT_BROADCAST, "hello", QoS::AtLeastOnce, false)
        .outcome()
        .await;

    assert_eq!(outcome, PublishOutcome::Delivered);
    assert_eq!(session.published_topics(), vec![topics::ALERT_BROADCAST]);
}

#[tokio::test]
async fn test_publish_invalid_topic_is_rejected_not_queued() {
    let (bus, session) = setup();

    let outcome = bus.publish("test/topic", "x", QoS::AtLeastOnce, false).outcome().await;

    assert!(matches!(outcome, PublishOutcome::Rejected(BusError::InvalidTopic(_))));
    assert!(bus.queue().is_empty());
    assert_eq!(session.publish_calls(), 0);
}

#[tokio::test]
async fn test_publish_while_disconnected_is_queued() {
    let (bus, session) = setup();

    let outcome = bus
        .publish("emergency/alerts/1", "x", QoS::AtLeastOnce, false)
        .outcome()
        .await;

    assert_eq!(outcome, PublishOutcome::Queued);
    assert_eq!(bus.queue().len(), 1);
    assert_eq!(session.publish_calls(), 0);
}

#[tokio::test]
async fn test_queued_messages_delivered_in_order_after_connect() {
    let (bus, session) = setup();
    for i in 0..5 {
        bus.publish(&format!("emergency/alerts/{}", i), "x", QoS::AtLeastOnce, false);
    }

    bus.connect().await.unwrap();

    let expected: Vec<String> = (0..5).map(|i| format!("emergency/alerts/{}", i)).collect();
    assert_eq!(session.published_topics(), expected);
    assert!(bus.queue().is_empty());
}

#[tokio::test]
async fn test_publish_failure_queues_and_reports() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();
    session.set_fail_publish(true);
    let mut errors = bus.errors();

    let outcome = bus
        .publish("emergency/alerts/1", "x", QoS::AtLeastOnce, false)
        .outcome()
        .await;

    assert_eq!(outcome, PublishOutcome::Queued);
    assert_eq!(bus.queue().len(), 1);
    assert!(matches!(errors.recv().await.unwrap(), BusError::PublishFailed(_)));
}

#[tokio::test]
async fn test_failed_drain_keeps_message() {
    let (bus, session) = setup();
    bus.publish("emergency/alerts/a", "x", QoS::AtLeastOnce, false);
    bus.publish("emergency/alerts/b", "x", QoS::AtLeastOnce, false);
    session.fail_next_publishes(1);

    bus.connect().await.unwrap();

    assert_eq!(session.published_topics(), vec!["emergency/alerts/b"]);
    assert_eq!(bus.queue().topics(), vec!["emergency/alerts/a"]);

    let report = bus.drain_queue().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(
        session.published_topics(),
        vec!["emergency/alerts/b", "emergency/alerts/a"]
    );
}

#[tokio::test]
async fn test_publish_json() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();

    let handle = bus
        .publish_json(topics::STATUS_SYSTEM, &serde_json::json!({"ok": true}), QoS::AtMostOnce, false)
        .unwrap();

    assert!(handle.outcome().await.is_delivered());
    assert_eq!(session.published()[0].payload(), br#"{"ok":true}"#);
}

#[tokio::test]
async fn test_probe_goes_to_system_status() {
    let (bus, session) = setup();

    assert_eq!(bus.probe().await, Err(BusError::NotConnected));

    bus.connect().await.unwrap();
    bus.probe().await.unwrap();

    assert_eq!(session.published_topics(), vec![topics::STATUS_SYSTEM]);
    assert!(bus.queue().is_empty());
}

// ============================================================================
// SUBSCRIBE
// ============================================================================

#[tokio::test]
async fn test_subscribe_while_disconnected_is_dropped() {
    let (bus, session) = setup();

    let result = bus.subscribe(&[topics::ALERT_BROADCAST]).await;

    assert_eq!(result, Err(BusError::NotConnected));
    assert!(bus.remembered_subscriptions().is_empty());
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn test_subscribe_invalid_topic() {
    let (bus, _session) = setup();
    bus.connect().await.unwrap();

    let result = bus.subscribe(&["other/topic"]).await;

    assert!(matches!(result, Err(BusError::InvalidTopic(_))));
}

#[tokio::test]
async fn test_subscriptions_reissued_after_reconnect() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();
    bus.subscribe(&[topics::ALERT_BROADCAST, topics::ALERT_BROADCAST])
        .await
        .unwrap();
    assert_eq!(bus.remembered_subscriptions(), vec![topics::ALERT_BROADCAST]);

    session.drop_connection("broker restart");
    wait_for_state(&bus, ConnectionState::Disconnected).await;
    bus.connect().await.unwrap();

    let count = session
        .subscriptions()
        .iter()
        .filter(|t| t.as_str() == topics::ALERT_BROADCAST)
        .count();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_inbound_messages_are_forwarded() {
    let (bus, session) = setup();
    bus.connect().await.unwrap();
    let mut inbound = bus.inbound();

    session.deliver("emergency/response/ack/7", b"on my way");

    let message = timeout(Duration::from_secs(1), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "emergency/response/ack/7");
    assert_eq!(message.payload_str(), "on my way");
}
