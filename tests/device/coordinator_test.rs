// Transport Coordinator Tests
// Discovery merge, BLE-to-classic fallback and merged telemetry

use crashlink::device::{
    BleLink, ClassicLink, CoordinatorState, DeviceDescriptor, DeviceLink, LinkConfig, LinkError,
    MockGattRadio, MockPeerDirectory, MockSerialRadio, TransportCoordinator, TransportKind,
    WifiDirectLink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

struct Fixture {
    coordinator: TransportCoordinator,
    gatt: Arc<MockGattRadio>,
    serial: Arc<MockSerialRadio>,
    peers: Arc<MockPeerDirectory>,
}

fn fixture(gatt: MockGattRadio, serial: MockSerialRadio, peers: MockPeerDirectory) -> Fixture {
    let config = LinkConfig::default();
    let gatt = Arc::new(gatt);
    let serial = Arc::new(serial);
    let peers = Arc::new(peers);
    let links: Vec<Arc<dyn DeviceLink>> = vec![
        Arc::new(ClassicLink::new(config.clone(), serial.clone())),
        Arc::new(BleLink::new(config.clone(), gatt.clone())),
        Arc::new(WifiDirectLink::new(config.clone(), peers.clone())),
    ];
    let coordinator = TransportCoordinator::new(&config, links);
    coordinator.start();
    Fixture {
        coordinator,
        gatt,
        serial,
        peers,
    }
}

fn default_fixture() -> Fixture {
    fixture(
        MockGattRadio::new(),
        MockSerialRadio::new(),
        MockPeerDirectory::new("127.0.0.1"),
    )
}

async fn wait_for_impact(coordinator: &TransportCoordinator) {
    let mut rx = coordinator.subscribe_telemetry();
    timeout(Duration::from_secs(1), rx.wait_for(|m| m.is_some()))
        .await
        .expect("no merged telemetry")
        .unwrap();
}

// ============================================================================
// CONNECTION
// ============================================================================

#[tokio::test]
async fn test_ble_failure_falls_back_to_classic() {
    let f = fixture(
        MockGattRadio::new().with_connect_failure(),
        MockSerialRadio::new(),
        MockPeerDirectory::new("127.0.0.1"),
    );

    let kind = f
        .coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();

    assert_eq!(kind, TransportKind::Classic);
    assert_eq!(f.gatt.connect_calls(), 1);
    assert_eq!(f.serial.open_calls(), 1);
    assert_eq!(f.coordinator.active_transport(), Some(TransportKind::Classic));
    assert_eq!(f.coordinator.state(), CoordinatorState::Connected);
    assert_eq!(f.coordinator.connection_status(), "Connected via Bluetooth Classic");
}

#[tokio::test]
async fn test_ble_preferred_when_available() {
    let f = default_fixture();

    let kind = f
        .coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();

    assert_eq!(kind, TransportKind::LowEnergy);
    assert_eq!(f.serial.open_calls(), 0);
}

#[tokio::test]
async fn test_both_bluetooth_methods_failing_is_reported() {
    let serial = MockSerialRadio::new();
    serial.set_fail_open(true);
    let f = fixture(
        MockGattRadio::new().with_connect_failure(),
        serial,
        MockPeerDirectory::new("127.0.0.1"),
    );
    let mut errors = f.coordinator.errors();

    let result = f
        .coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await;

    assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
    assert_eq!(f.coordinator.state(), CoordinatorState::Error);
    assert_eq!(f.coordinator.active_transport(), None);
    assert!(matches!(errors.recv().await.unwrap(), LinkError::ConnectionFailed(_)));
}

#[tokio::test]
async fn test_reconnect_last_device() {
    let f = default_fixture();

    assert!(matches!(
        f.coordinator.reconnect_last().await,
        Err(LinkError::DeviceNotFound(_))
    ));

    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    f.coordinator.disconnect().await;
    assert_eq!(f.coordinator.connection_status(), "Not connected");

    let kind = f.coordinator.reconnect_last().await.unwrap();
    assert_eq!(kind, TransportKind::LowEnergy);
    assert_eq!(f.gatt.connect_calls(), 2);
}

#[tokio::test]
async fn test_send_command_needs_active_transport() {
    let f = default_fixture();

    assert_eq!(
        f.coordinator.send_command("PING").await,
        Err(LinkError::NotConnected)
    );

    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    let mut peer = f.gatt.take_peer().unwrap();
    f.coordinator.send_command("PING").await.unwrap();

    assert_eq!(peer.writes.recv().await.unwrap(), b"PING".to_vec());
}

// ============================================================================
// DISCOVERY
// ============================================================================

#[tokio::test]
async fn test_discovery_merges_and_dedups() {
    let f = fixture(
        MockGattRadio::new().with_devices(vec![DeviceDescriptor::bluetooth("aa:bb").with_name("Car")]),
        MockSerialRadio::new().with_devices(vec![DeviceDescriptor::bluetooth("AA:BB")]),
        MockPeerDirectory::new("127.0.0.1")
            .with_peers(vec![DeviceDescriptor::wifi_peer("dashcam")]),
    );

    assert_eq!(f.coordinator.start_discovery(), 3);
    f.coordinator.wait_for_discovery().await;

    let devices = f.coordinator.discovered_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().any(|d| d.address == "AA:BB"));
    assert!(devices.iter().any(|d| d.address == "dashcam"));
    assert_eq!(f.coordinator.state(), CoordinatorState::Disconnected);
}

#[tokio::test]
async fn test_discovery_skips_disabled_radios() {
    let f = default_fixture();
    f.serial.set_enabled(false);
    f.peers.set_enabled(false);

    assert_eq!(f.coordinator.start_discovery(), 1);
    f.coordinator.wait_for_discovery().await;

    assert_eq!(f.coordinator.available_methods(), vec!["Bluetooth BLE"]);
}

#[tokio::test]
async fn test_no_enabled_radio_starts_nothing() {
    let f = default_fixture();
    f.gatt.set_enabled(false);
    f.serial.set_enabled(false);
    f.peers.set_enabled(false);
    let mut errors = f.coordinator.errors();

    assert_eq!(f.coordinator.start_discovery(), 0);
    assert!(!f.coordinator.is_communication_available());
    assert!(f.coordinator.available_methods().is_empty());
    assert_eq!(errors.recv().await.unwrap(), LinkError::RadioDisabled);
}

#[tokio::test]
async fn test_stop_discovery_settles_state() {
    let f = default_fixture();

    f.coordinator.start_discovery();
    f.coordinator.stop_discovery().await;

    assert_ne!(f.coordinator.state(), CoordinatorState::Discovering);
}

// ============================================================================
// TELEMETRY
// ============================================================================

#[tokio::test]
async fn test_merged_frame_drives_impact_detection() {
    let f = fixture(
        MockGattRadio::new().with_connect_failure(),
        MockSerialRadio::new(),
        MockPeerDirectory::new("127.0.0.1"),
    );
    assert!(!f.coordinator.is_impact_detected());
    assert_eq!(f.coordinator.sensor_data_status(), "No sensor data");

    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    let mut device = f.serial.take_device_end().unwrap();
    device
        .write_all(b"ACC:0.0,0.0,9.8|IMPACT:7.2|GPS:40.7128,-74.006\n")
        .await
        .unwrap();
    wait_for_impact(&f.coordinator).await;

    let merged = f.coordinator.latest_frame().unwrap();
    assert_eq!(merged.source, TransportKind::Classic);
    assert!(f.coordinator.is_impact_detected());
    assert_eq!(f.coordinator.gps_coordinates(), Some((40.7128, -74.006)));
    assert!(f.coordinator.has_gps_data());
}

#[tokio::test]
async fn test_impact_at_threshold_is_not_detected() {
    let f = default_fixture();
    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    let peer = f.gatt.take_peer().unwrap();

    peer.notify.send(Ok(b"IMPACT:5.0\n".to_vec())).await.unwrap();
    wait_for_impact(&f.coordinator).await;

    assert!(!f.coordinator.is_impact_detected());
    assert!(!f.coordinator.has_gps_data());
}

#[tokio::test]
async fn test_active_link_drop_clears_transport() {
    let f = fixture(
        MockGattRadio::new().with_connect_failure(),
        MockSerialRadio::new(),
        MockPeerDirectory::new("127.0.0.1"),
    );
    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();
    let mut active = f.coordinator.subscribe_active();

    drop(f.serial.take_device_end());

    timeout(Duration::from_secs(1), active.wait_for(|a| a.is_none()))
        .await
        .expect("active transport not cleared")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let f = default_fixture();
    f.coordinator
        .connect_to_device(&DeviceDescriptor::bluetooth("aa:bb"))
        .await
        .unwrap();

    f.coordinator.shutdown().await;

    assert_eq!(f.coordinator.active_transport(), None);
    assert_eq!(f.coordinator.state(), CoordinatorState::Disconnected);
    assert!(f
        .coordinator
        .links()
        .iter()
        .all(|l| !l.state().is_connected()));
}
