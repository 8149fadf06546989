use serde::{Deserialize, Serialize};

use crate::blink::BlinkPattern;

/// Retry ceilings and timing intervals for the connectivity supervisor.
/// Everything here is fixed at build time; there is no runtime
/// configuration surface on this hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub broker_retry_cooldown_ms: u64,
    pub wifi_retry_cooldown_ms: u64,
    pub max_retries_before_reboot: u32,
    pub publish_interval_ms: u64,
    pub display_refresh_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            broker_retry_cooldown_ms: 30_000,
            wifi_retry_cooldown_ms: 300_000,
            max_retries_before_reboot: 5,
            publish_interval_ms: 120_000,
            display_refresh_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_connect_attempts: u32,
    pub attempt_delay_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            channel: 1,
            max_connect_attempts: 10,
            attempt_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.150".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlinkConfig {
    pub connected: BlinkPattern,
    pub waiting: BlinkPattern,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            connected: BlinkPattern {
                period_ms: 10_000,
                on_duration_ms: 100,
            },
            waiting: BlinkPattern {
                period_ms: 1_000,
                on_duration_ms: 100,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub base: String,
    pub area: String,
    pub wifi: WifiConfig,
    pub broker: BrokerConfig,
    pub connectivity: ConnectivityConfig,
    pub blink: BlinkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base: "home/test".to_string(),
            area: "freezer".to_string(),
            wifi: WifiConfig::default(),
            broker: BrokerConfig::default(),
            connectivity: ConnectivityConfig::default(),
            blink: BlinkConfig::default(),
        }
    }
}
