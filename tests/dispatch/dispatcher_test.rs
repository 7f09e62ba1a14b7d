// Crash Dispatcher Tests
// Impact frames become published emergency alerts

use crashlink::bus::{topics, BusConfig, EmergencyAlert, MedicalInfo, MessageBus, MockBrokerSession};
use crashlink::device::{
    ClassicLink, DeviceDescriptor, DeviceLink, LinkConfig, MergedFrame, MockSerialRadio,
    SensorFrame, TransportCoordinator, TransportKind,
};
use crashlink::dispatch::{CrashDispatcher, DispatchConfig};
use crashlink::recovery::InMemoryIncidentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

struct Fixture {
    dispatcher: CrashDispatcher,
    bus: MessageBus,
    session: Arc<MockBrokerSession>,
    coordinator: TransportCoordinator,
    serial: Arc<MockSerialRadio>,
    incidents: Arc<InMemoryIncidentStore>,
}

fn fixture(config: DispatchConfig) -> Fixture {
    let session = Arc::new(MockBrokerSession::new());
    let bus = MessageBus::new(BusConfig::default(), session.clone()).unwrap();
    let serial = Arc::new(MockSerialRadio::new());
    let link_config = LinkConfig::default();
    let links: Vec<Arc<dyn DeviceLink>> =
        vec![Arc::new(ClassicLink::new(link_config.clone(), serial.clone()))];
    let coordinator = TransportCoordinator::new(&link_config, links);
    let incidents = Arc::new(InMemoryIncidentStore::new());
    let dispatcher = CrashDispatcher::new(config, bus.clone(), coordinator.clone(), incidents.clone());
    Fixture {
        dispatcher,
        bus,
        session,
        coordinator,
        serial,
        incidents,
    }
}

fn merged(line: &str) -> MergedFrame {
    MergedFrame {
        frame: SensorFrame::parse(line),
        source: TransportKind::LowEnergy,
    }
}

/// Connect the classic link and return the device end of the stream
async fn connect_device(f: &Fixture) -> DuplexStream {
    f.coordinator.start();
    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    f.serial.take_device_end().unwrap()
}

async fn send_frame(device: &mut DuplexStream, line: &str) {
    device.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
}

async fn next_alert(alerts: &mut broadcast::Receiver<EmergencyAlert>) -> EmergencyAlert {
    timeout(Duration::from_secs(1), alerts.recv())
        .await
        .expect("no alert raised")
        .unwrap()
}

// ============================================================================
// RAISE
// ============================================================================

#[tokio::test]
async fn test_raise_publishes_incident_and_broadcast() {
    let f = fixture(DispatchConfig::new("victim_456", "John Doe"));
    f.bus.connect().await.unwrap();

    let alert = f
        .dispatcher
        .raise(&merged("IMPACT:9.5|GPS:40.7128,-74.006"))
        .await
        .unwrap();

    assert!(alert.incident_id.starts_with("incident_"));
    assert_eq!(alert.victim_id, "victim_456");
    assert_eq!(alert.victim_name, "John Doe");
    assert_eq!(alert.severity, "HIGH");
    assert_eq!(alert.location.latitude, 40.7128);
    assert_eq!(alert.location.longitude, -74.006);
    assert_eq!(
        f.session.published_topics(),
        vec![
            topics::alert_incident(&alert.incident_id),
            topics::ALERT_BROADCAST.to_string(),
        ]
    );
    assert!(f.incidents.contains(&alert.incident_id));
    assert_eq!(f.dispatcher.alerts_raised(), 1);
}

#[tokio::test]
async fn test_alert_payload_round_trips() {
    let config = DispatchConfig::new("v1", "Jane").with_medical_info(MedicalInfo {
        blood_type: "AB+".to_string(),
        allergies: vec![],
        medications: vec!["Insulin".to_string()],
        conditions: vec![],
    });
    let f = fixture(config.with_severity("CRITICAL"));
    f.bus.connect().await.unwrap();

    let alert = f.dispatcher.raise(&merged("IMPACT:20.0|GPS:1.0,2.0")).await.unwrap();

    let published = EmergencyAlert::from_json(f.session.published()[1].payload()).unwrap();
    assert_eq!(published, alert);
    assert_eq!(published.severity, "CRITICAL");
    assert_eq!(published.medical_info.medications, vec!["Insulin"]);
}

#[tokio::test]
async fn test_missing_gps_uses_fallback() {
    let f = fixture(DispatchConfig::new("v1", "Jane").with_fallback_location(51.5, -0.12));
    f.bus.connect().await.unwrap();

    let alert = f.dispatcher.raise(&merged("IMPACT:9.0")).await.unwrap();

    assert_eq!(alert.location.latitude, 51.5);
    assert_eq!(alert.location.longitude, -0.12);
}

#[tokio::test]
async fn test_missing_gps_without_fallback_is_origin() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));
    f.bus.connect().await.unwrap();

    let alert = f.dispatcher.raise(&merged("IMPACT:9.0")).await.unwrap();

    assert_eq!(alert.location.latitude, 0.0);
    assert_eq!(alert.location.longitude, 0.0);
}

#[tokio::test]
async fn test_offline_alert_is_queued() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));

    let alert = f.dispatcher.raise(&merged("IMPACT:9.0|GPS:1.0,2.0")).await.unwrap();

    assert_eq!(f.bus.queue().len(), 2);
    assert_eq!(f.session.publish_calls(), 0);

    f.bus.connect().await.unwrap();
    assert_eq!(f.session.published_topics()[0], topics::alert_incident(&alert.incident_id));
    assert!(f.bus.queue().is_empty());
}

#[tokio::test]
async fn test_store_failure_does_not_block_alert() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));
    f.bus.connect().await.unwrap();
    f.incidents.set_fail_operations(true);

    let alert = f.dispatcher.raise(&merged("IMPACT:9.0")).await.unwrap();

    assert!(!f.incidents.contains(&alert.incident_id));
    assert_eq!(f.session.publish_calls(), 2);
}

// ============================================================================
// RISING EDGE
// ============================================================================

#[tokio::test]
async fn test_impact_frame_raises_one_alert() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));
    f.bus.connect().await.unwrap();
    let mut device = connect_device(&f).await;
    let mut alerts = f.dispatcher.alerts();
    f.dispatcher.start();
    f.dispatcher.start();

    send_frame(&mut device, "ACC:0.1,0.2,9.8|IMPACT:1.2").await;
    assert_eq!(f.dispatcher.alerts_raised(), 0);

    send_frame(&mut device, "ACC:3.0,4.0,9.8|IMPACT:7.5|GPS:40.7,-74.0").await;
    let alert = next_alert(&mut alerts).await;
    assert_eq!(alert.location.latitude, 40.7);
    assert_eq!(f.session.publish_calls(), 2);

    send_frame(&mut device, "IMPACT:8.0").await;
    assert_eq!(f.dispatcher.alerts_raised(), 1);
}

#[tokio::test]
async fn test_new_impact_after_calm_raises_again() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));
    f.bus.connect().await.unwrap();
    let mut device = connect_device(&f).await;
    let mut alerts = f.dispatcher.alerts();
    f.dispatcher.start();

    send_frame(&mut device, "IMPACT:7.0").await;
    next_alert(&mut alerts).await;
    send_frame(&mut device, "IMPACT:0.5").await;
    send_frame(&mut device, "IMPACT:6.0").await;
    next_alert(&mut alerts).await;

    assert_eq!(f.dispatcher.alerts_raised(), 2);
    assert_eq!(f.session.publish_calls(), 4);
}

#[tokio::test]
async fn test_shutdown_stops_watching() {
    let f = fixture(DispatchConfig::new("v1", "Jane"));
    f.bus.connect().await.unwrap();
    let mut device = connect_device(&f).await;
    f.dispatcher.start();

    f.dispatcher.shutdown().await;
    send_frame(&mut device, "IMPACT:9.0").await;

    assert_eq!(f.dispatcher.alerts_raised(), 0);
}
