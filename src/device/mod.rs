// Device module - THE SENSOR LINK
// Classic, low-energy and WiFi-direct transports to the vehicle device, plus their coordinator

mod ble;
mod classic;
mod coordinator;
mod link_core;
mod frame;
mod traits;
mod wifi;

pub use traits::{
    // Core trait
    DeviceLink,
    // Configuration
    LinkConfig, MIN_MTU,
    // Link types
    DeviceDescriptor, LinkState, TransportKind,
    // Errors
    LinkError,
};

pub use frame::{SensorFrame, IMPACT_THRESHOLD};

pub use classic::{ClassicLink, MockSerialRadio, SerialRadio, SerialStream};

pub use ble::{BleLink, GattRadio, GattSession, MockGattPeer, MockGattRadio, NotificationStream};

pub use wifi::{MockPeerDirectory, PeerDirectory, StaticPeerDirectory, WifiDirectLink};

pub use coordinator::{CoordinatorState, MergedFrame, TransportCoordinator};
