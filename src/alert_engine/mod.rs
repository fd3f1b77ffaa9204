//! AlertEngine - rule evaluation and cooldown suppression
//!
//! ## Responsibilities
//!
//! - Evaluate alert rules over one telemetry record (plus the device's
//!   last record with a GPS fix for the GPS-loss rule)
//! - Suppress repeats of the same (device, type) inside a per-type
//!   cooldown window
//!
//! Rules are independent: one record may yield several candidates. The
//! cooldown check reads the incident store and decides without a lock, so
//! near-simultaneous duplicates of the same record can, rarely, both pass.
//! That race is accepted (see DESIGN.md), not worked around with global
//! locking.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::incident::{AlertType, IncidentService};
use crate::models::{GeoLocation, Severity};
use crate::telemetry::types::TelemetryRecord;

/// Battery level below this raises an alert (exclusive: 20.0 is fine)
pub const BATTERY_ALERT_BELOW: f64 = 20.0;
/// Battery level below this upgrades the alert to high
pub const BATTERY_HIGH_BELOW: f64 = 10.0;
/// Obstacle distance below this raises an alert (cm)
pub const OBSTACLE_ALERT_BELOW_CM: f64 = 30.0;
/// Obstacle distance below this upgrades the alert to high (cm)
pub const OBSTACLE_HIGH_BELOW_CM: f64 = 15.0;
/// Acceleration magnitude above this indicates a fall (m/s^2)
pub const FALL_ALERT_ABOVE: f64 = 20.0;
/// Acceleration magnitude above this upgrades the fall to critical
pub const FALL_CRITICAL_ABOVE: f64 = 28.0;

/// Per-type cooldown windows
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub low_battery: Duration,
    pub obstacle: Duration,
    pub fall: Duration,
    pub gps_loss: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        // Defaults follow the field behavior each alert needs: battery
        // drains slowly, obstacles repeat while walking, falls and fix
        // loss sit in between.
        Self {
            low_battery: Duration::seconds(3600),
            obstacle: Duration::seconds(5),
            fall: Duration::seconds(60),
            gps_loss: Duration::seconds(600),
        }
    }
}

impl CooldownConfig {
    pub fn window(&self, alert_type: AlertType) -> Duration {
        match alert_type {
            AlertType::LowBattery => self.low_battery,
            AlertType::Obstacle => self.obstacle,
            AlertType::Fall => self.fall,
            AlertType::GpsLoss => self.gps_loss,
        }
    }
}

/// A non-suppressed rule hit, ready to become an incident
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub location: Option<GeoLocation>,
    pub metadata: serde_json::Value,
}

/// AlertEngine instance
pub struct AlertEngine {
    cooldowns: CooldownConfig,
    incidents: Arc<IncidentService>,
}

impl AlertEngine {
    pub fn new(cooldowns: CooldownConfig, incidents: Arc<IncidentService>) -> Self {
        Self { cooldowns, incidents }
    }

    /// Evaluate all rules over one record. Pure: no store access, no
    /// suppression.
    pub fn evaluate(
        record: &TelemetryRecord,
        prev_with_fix: Option<&TelemetryRecord>,
    ) -> Vec<AlertCandidate> {
        let location = record.gps.map(|g| g.location());
        let mut candidates = Vec::new();

        if let Some(battery) = &record.sensors.battery {
            if battery.level < BATTERY_ALERT_BELOW {
                let severity = if battery.level < BATTERY_HIGH_BELOW {
                    Severity::High
                } else {
                    Severity::Medium
                };
                candidates.push(AlertCandidate {
                    alert_type: AlertType::LowBattery,
                    severity,
                    message: format!("Battery at {:.0}%", battery.level),
                    location,
                    metadata: serde_json::json!({ "level": battery.level }),
                });
            }
        }

        if let Some(ultrasonic) = &record.sensors.ultrasonic {
            let min_cm = ultrasonic.min_cm();
            if min_cm < OBSTACLE_ALERT_BELOW_CM {
                let severity = if min_cm < OBSTACLE_HIGH_BELOW_CM {
                    Severity::High
                } else {
                    Severity::Medium
                };
                candidates.push(AlertCandidate {
                    alert_type: AlertType::Obstacle,
                    severity,
                    message: format!("Obstacle at {min_cm:.0} cm"),
                    location,
                    metadata: serde_json::json!({
                        "leftCm": ultrasonic.left_cm,
                        "rightCm": ultrasonic.right_cm,
                    }),
                });
            }
        }

        if let Some(accel) = &record.sensors.accel {
            let magnitude = accel.magnitude();
            if magnitude > FALL_ALERT_ABOVE {
                let severity = if magnitude > FALL_CRITICAL_ABOVE {
                    Severity::Critical
                } else {
                    Severity::High
                };
                candidates.push(AlertCandidate {
                    alert_type: AlertType::Fall,
                    severity,
                    message: format!("Possible fall, impact {magnitude:.1} m/s2"),
                    location,
                    metadata: serde_json::json!({ "magnitude": magnitude }),
                });
            }
        }

        if !record.has_fix() {
            if let Some(prev) = prev_with_fix {
                candidates.push(AlertCandidate {
                    alert_type: AlertType::GpsLoss,
                    severity: Severity::Medium,
                    message: "GPS fix lost".to_string(),
                    // Last known position travels with the alert
                    location: prev.gps.map(|g| g.location()),
                    metadata: serde_json::json!({
                        "lastFixAt": prev.timestamp.to_rfc3339(),
                    }),
                });
            }
        }

        candidates
    }

    /// Whether a candidate is inside its (device, type) cooldown window
    pub async fn suppressed(&self, device_id: &str, candidate: &AlertCandidate) -> bool {
        let window = self.cooldowns.window(candidate.alert_type);
        let since = Utc::now() - window;
        let hit = self
            .incidents
            .latest_alert_since(device_id, candidate.alert_type, since)
            .await;
        if let Some(at) = hit {
            debug!(
                device_id = %device_id,
                alert_type = %candidate.alert_type,
                last_at = %at,
                "Alert suppressed by cooldown"
            );
            return true;
        }
        false
    }
}
