//! Telemetry record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::GeoLocation;

/// Bounded size of the free-form extensions map; extra keys are dropped at
/// ingestion, they are forward-compat hints, not data the core acts on.
pub const MAX_EXTENSION_KEYS: usize = 16;

/// Ultrasonic distance pair in centimeters (0-1000)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UltrasonicReading {
    pub left_cm: f64,
    pub right_cm: f64,
}

impl UltrasonicReading {
    /// Closest obstacle on either side
    pub fn min_cm(&self) -> f64 {
        self.left_cm.min(self.right_cm)
    }
}

/// Battery state (level 0-100)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryReading {
    pub level: f64,
    #[serde(default)]
    pub charging: bool,
}

/// Inertial acceleration vector in m/s^2
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InertialVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl InertialVector {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// GPS reading; `fix` false means the receiver reported coordinates it does
/// not trust (stale or dead-reckoned)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsReading {
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_fix")]
    pub fix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

fn default_fix() -> bool {
    true
}

impl GpsReading {
    pub fn location(&self) -> GeoLocation {
        GeoLocation {
            lat: self.lat,
            lon: self.lon,
            accuracy_m: self.accuracy_m,
        }
    }
}

/// Sensor block of one telemetry message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ultrasonic: Option<UltrasonicReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel: Option<InertialVector>,
}

/// Connectivity/status snapshot carried alongside the sensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

fn default_online() -> bool {
    true
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            online: true,
            signal_strength: None,
            network: None,
        }
    }
}

/// One accepted telemetry record. Append-only; expired after the retention
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub sensors: SensorReadings,
    #[serde(default)]
    pub status: StatusSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsReading>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl TelemetryRecord {
    /// Whether this record carries a trusted GPS fix
    pub fn has_fix(&self) -> bool {
        self.gps.map(|g| g.fix).unwrap_or(false)
    }
}

/// Inbound telemetry payload (HTTP body and MQTT message share this shape)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRequest {
    pub device_id: String,
    #[serde(default)]
    pub sensors: SensorReadings,
    #[serde(default)]
    pub status: Option<StatusSnapshot>,
    #[serde(default)]
    pub gps: Option<GpsReading>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extensions: HashMap<String, serde_json::Value>,
}
