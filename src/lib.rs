// CrashLink - crash telemetry relay
// Reads impact telemetry from a vehicle device over Bluetooth or WiFi-direct,
// publishes emergency alerts through an MQTT broker with offline queueing,
// and recovers from transient failures automatically.

pub mod bus;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod recovery;
pub mod storage;

pub use context::CrashLinkContext;
