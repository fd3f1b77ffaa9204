//! Incident types and lifecycle records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{GeoLocation, Severity};

/// Alert subtype derived from telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    LowBattery,
    Obstacle,
    Fall,
    GpsLoss,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::LowBattery => "LOW_BATTERY",
            AlertType::Obstacle => "OBSTACLE",
            AlertType::Fall => "FALL",
            AlertType::GpsLoss => "GPS_LOSS",
        };
        write!(f, "{}", s)
    }
}

/// What kind of occurrence an incident tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "alertType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    Sos,
    Alert(AlertType),
    DeviceOnline,
    DeviceOffline,
    CommandSent,
    CommandReceived,
    SystemError,
}

impl IncidentType {
    pub fn label(&self) -> &'static str {
        match self {
            IncidentType::Sos => "SOS",
            IncidentType::Alert(_) => "ALERT",
            IncidentType::DeviceOnline => "DEVICE_ONLINE",
            IncidentType::DeviceOffline => "DEVICE_OFFLINE",
            IncidentType::CommandSent => "COMMAND_SENT",
            IncidentType::CommandReceived => "COMMAND_RECEIVED",
            IncidentType::SystemError => "SYSTEM_ERROR",
        }
    }
}

/// Lifecycle status. `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Acknowledged,
    Resolved,
    Ignored,
}

/// One acknowledgment entry; the list on an incident is append-only and
/// insertion-ordered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub acknowledged_by: String,
    pub acknowledged_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Resolution record, written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Ordered actions taken while resolving
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Escalation record; a later escalate call overwrites the previous one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub target: String,
    pub reason: String,
    /// Always within [1, 5]
    pub level: u8,
    pub escalated_at: DateTime<Utc>,
}

/// Notification delivery record kept for audit, never surfaced as a
/// request failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub sent: bool,
    pub sent_at: DateTime<Utc>,
    pub delivered: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A tracked occurrence with a lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    #[serde(flatten)]
    pub incident_type: IncidentType,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub status: IncidentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    /// Type-specific metadata
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    #[serde(default)]
    pub acknowledgments: Vec<Acknowledgment>,
}

/// Inputs for creating an incident
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub incident_type: IncidentType,
    pub device_id: String,
    pub user_id: Option<String>,
    pub severity: Severity,
    pub location: Option<GeoLocation>,
    pub metadata: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
}
