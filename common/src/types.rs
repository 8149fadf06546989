use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    WifiDown,
    WifiUpBrokerDown,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WifiDown => "WIFI_DOWN",
            Self::WifiUpBrokerDown => "WIFI_UP_BROKER_DOWN",
            Self::Connected => "CONNECTED",
        }
    }
}

/// Last-known sensor values. Only temperature and supply voltage are
/// measured on this hardware; the other fields stay at their defaults and
/// are published as-is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity: f32,
    pub moisture_pct: i32,
    pub supply_volts: f32,
}

/// Broker payload. Every field is a string on the wire; existing consumers
/// parse them that way, so the types must not change.
#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    temperature: String,
    humidity: String,
    moisture: String,
    voltage: String,
}

impl SensorPayload {
    pub fn from_reading(reading: &SensorReading) -> Self {
        Self {
            temperature: format!("{:.2}", reading.temperature_c),
            humidity: format!("{:.2}", reading.humidity),
            moisture: format!("{}", reading.moisture_pct),
            voltage: format!("{:.2}", reading.supply_volts),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
