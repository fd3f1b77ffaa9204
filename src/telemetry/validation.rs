//! Telemetry validation
//!
//! Standalone range/shape checks, independent of how records are stored.
//! Every failing field is collected so one response lists all problems;
//! nothing is persisted when any field fails.

use crate::error::{Error, Result};
use crate::models::is_valid_device_id;
use crate::telemetry::types::TelemetryRequest;

pub const ULTRASONIC_MIN_CM: f64 = 0.0;
pub const ULTRASONIC_MAX_CM: f64 = 1000.0;
pub const BATTERY_MIN: f64 = 0.0;
pub const BATTERY_MAX: f64 = 100.0;

/// Validate one inbound telemetry payload.
///
/// Latitude bounds are inclusive: 90 and -90 pass, 90.0001 fails.
pub fn validate_telemetry(req: &TelemetryRequest) -> Result<()> {
    let mut fields = Vec::new();

    if !is_valid_device_id(&req.device_id) {
        fields.push("deviceId".to_string());
    }

    if let Some(u) = &req.sensors.ultrasonic {
        if !in_range(u.left_cm, ULTRASONIC_MIN_CM, ULTRASONIC_MAX_CM) {
            fields.push("sensors.ultrasonic.leftCm".to_string());
        }
        if !in_range(u.right_cm, ULTRASONIC_MIN_CM, ULTRASONIC_MAX_CM) {
            fields.push("sensors.ultrasonic.rightCm".to_string());
        }
    }

    if let Some(b) = &req.sensors.battery {
        if !in_range(b.level, BATTERY_MIN, BATTERY_MAX) {
            fields.push("sensors.battery.level".to_string());
        }
    }

    if let Some(a) = &req.sensors.accel {
        if !a.x.is_finite() || !a.y.is_finite() || !a.z.is_finite() {
            fields.push("sensors.accel".to_string());
        }
    }

    if let Some(gps) = &req.gps {
        if !in_range(gps.lat, -90.0, 90.0) {
            fields.push("gps.lat".to_string());
        }
        if !in_range(gps.lon, -180.0, 180.0) {
            fields.push("gps.lon".to_string());
        }
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(
            format!("{} invalid field(s)", fields.len()),
            fields,
        ))
    }
}

fn in_range(v: f64, min: f64, max: f64) -> bool {
    v.is_finite() && v >= min && v <= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::types::{
        BatteryReading, GpsReading, SensorReadings, UltrasonicReading,
    };

    fn request(device_id: &str) -> TelemetryRequest {
        TelemetryRequest {
            device_id: device_id.to_string(),
            sensors: SensorReadings::default(),
            status: None,
            gps: None,
            timestamp: None,
            extensions: Default::default(),
        }
    }

    #[test]
    fn accepts_minimal_payload() {
        assert!(validate_telemetry(&request("stick-001")).is_ok());
    }

    #[test]
    fn latitude_bounds_are_inclusive() {
        let mut req = request("stick-001");
        req.gps = Some(GpsReading {
            lat: 90.0,
            lon: 0.0,
            fix: true,
            accuracy_m: None,
        });
        assert!(validate_telemetry(&req).is_ok());

        req.gps = Some(GpsReading {
            lat: -90.0,
            lon: 0.0,
            fix: true,
            accuracy_m: None,
        });
        assert!(validate_telemetry(&req).is_ok());

        req.gps = Some(GpsReading {
            lat: 90.0001,
            lon: 0.0,
            fix: true,
            accuracy_m: None,
        });
        let err = validate_telemetry(&req).unwrap_err();
        match err {
            Error::Validation { fields, .. } => assert_eq!(fields, vec!["gps.lat"]),
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn collects_every_failing_field() {
        let mut req = request("bad id");
        req.sensors.battery = Some(BatteryReading {
            level: 150.0,
            charging: false,
        });
        req.sensors.ultrasonic = Some(UltrasonicReading {
            left_cm: -5.0,
            right_cm: 2000.0,
        });
        req.gps = Some(GpsReading {
            lat: 91.0,
            lon: 181.0,
            fix: true,
            accuracy_m: None,
        });

        let err = validate_telemetry(&req).unwrap_err();
        match err {
            Error::Validation { fields, .. } => {
                assert_eq!(fields.len(), 6);
                assert!(fields.contains(&"deviceId".to_string()));
                assert!(fields.contains(&"sensors.battery.level".to_string()));
                assert!(fields.contains(&"gps.lon".to_string()));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn rejects_non_finite_readings() {
        let mut req = request("stick-001");
        req.sensors.battery = Some(BatteryReading {
            level: f64::NAN,
            charging: false,
        });
        assert!(validate_telemetry(&req).is_err());
    }
}
