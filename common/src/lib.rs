pub mod blink;
pub mod config;
pub mod link;
pub mod topics;
pub mod types;

pub use blink::{BlinkPattern, StatusBlinker};
pub use config::{BlinkConfig, BrokerConfig, ConnectivityConfig, NodeConfig, WifiConfig};
pub use link::{LinkAction, LinkHealth, LinkSupervisor};
pub use topics::NodeTopics;
pub use types::{LinkState, SensorPayload, SensorReading};
