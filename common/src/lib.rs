pub mod attributes;
pub mod cloud;
pub mod config;
pub mod dht20;
pub mod error;
pub mod indicator;
pub mod network;
pub mod orchestrator;
pub mod ota;
pub mod status;
pub mod telemetry;
pub mod topics;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use attributes::{AttributeChannel, AttributeMap, SharedKeys, SubscriptionId};
pub use cloud::{CloudClient, CloudSession};
pub use config::{CloudConfig, FirmwareConfig, IntervalConfig, NodeConfig, WifiConfig};
pub use error::{ConfigError, InstallerError, OtaFailure};
pub use indicator::{BlinkTimer, StatusIndicator};
pub use network::{LinkMonitor, NetworkSession, WifiLink};
pub use orchestrator::{SessionOrchestrator, TickOutcome};
pub use ota::{FirmwareInstaller, OtaCallbacks, OtaDriver, OtaState};
pub use status::{Latch, StatusFlags, SubscriptionStatus};
pub use telemetry::{PowerSource, Sensor, SyntheticPower, TelemetryOutcome, TelemetryProducer};
pub use topics::*;
pub use transport::{InboundMessage, MqttTransport};
pub use types::{FirmwareState, LinkInfo, LinkState, LoopControl, SensorReading};
