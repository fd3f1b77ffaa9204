//! NotificationFanout - push delivery with partial-failure accounting
//!
//! ## Responsibilities
//!
//! - Build the push payload for an incident
//! - Deliver to each recipient token independently (one failure never
//!   blocks the rest)
//! - Report per-token outcomes so callers can prune invalid tokens
//!
//! Zero recipients is a normal outcome, not an error. The triggering
//! request (SOS, telemetry) never fails because of delivery results.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::incident::{Incident, IncidentType};

/// Push payload handed to the sender. Location fields travel as strings,
/// matching what the mobile clients parse.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Failure detail for one token
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDelivery {
    pub token: String,
    pub reason: String,
    /// True when the token itself is bad and should be pruned upstream
    pub invalid_token: bool,
}

/// Per-token outcome of one fan-out
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutReport {
    pub attempted: u32,
    pub sent: u32,
    pub failed: u32,
    pub failures: Vec<FailedDelivery>,
}

impl FanoutReport {
    pub fn first_error(&self) -> Option<String> {
        self.failures.first().map(|f| f.reason.clone())
    }
}

/// Delivery failure returned by a sender
#[derive(Debug, Clone)]
pub struct PushError {
    pub reason: String,
    pub invalid_token: bool,
}

/// Sender seam; production uses the HTTP gateway, tests record calls
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        token: &str,
        notification: &PushNotification,
    ) -> std::result::Result<(), PushError>;
}

/// NotificationFanout instance
pub struct NotificationFanout {
    sender: Arc<dyn PushSender>,
}

impl NotificationFanout {
    pub fn new(sender: Arc<dyn PushSender>) -> Self {
        Self { sender }
    }

    /// Deliver one incident notification to every token, isolating each
    /// attempt.
    pub async fn deliver(&self, incident: &Incident, tokens: &[String]) -> FanoutReport {
        let notification = build_payload(incident);
        let mut report = FanoutReport::default();

        for token in tokens {
            report.attempted += 1;
            match self.sender.send(token, &notification).await {
                Ok(()) => {
                    report.sent += 1;
                    debug!(incident_id = %incident.id, "Push delivered");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        incident_id = %incident.id,
                        reason = %e.reason,
                        invalid_token = e.invalid_token,
                        "Push delivery failed"
                    );
                    report.failures.push(FailedDelivery {
                        token: token.clone(),
                        reason: e.reason,
                        invalid_token: e.invalid_token,
                    });
                }
            }
        }

        report
    }
}

/// Build the push payload for an incident
pub fn build_payload(incident: &Incident) -> PushNotification {
    let mut data = HashMap::new();
    data.insert("type".to_string(), incident.incident_type.label().to_string());
    data.insert("deviceId".to_string(), incident.device_id.clone());
    data.insert("incidentId".to_string(), incident.id.clone());
    data.insert("severity".to_string(), incident.severity.to_string());

    if let Some(loc) = &incident.location {
        data.insert("lat".to_string(), loc.lat.to_string());
        data.insert("lon".to_string(), loc.lon.to_string());
    }

    let (title, body) = match incident.incident_type {
        IncidentType::Sos => {
            data.insert("emergencyType".to_string(), "SOS".to_string());
            (
                "Emergency SOS".to_string(),
                format!("SOS signal from device {}", incident.device_id),
            )
        }
        IncidentType::Alert(alert_type) => {
            data.insert("alertType".to_string(), alert_type.to_string());
            (
                format!("Device alert: {}", alert_type),
                format!(
                    "{} alert ({}) from device {}",
                    alert_type, incident.severity, incident.device_id
                ),
            )
        }
        other => (
            other.label().to_string(),
            format!("{} for device {}", other.label(), incident.device_id),
        ),
    };

    PushNotification { title, body, data }
}

/// HTTP push-gateway sender
pub struct HttpPushSender {
    http: reqwest::Client,
    gateway_url: String,
}

impl HttpPushSender {
    pub fn new(gateway_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build HTTP client");
        Self { http, gateway_url }
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send(
        &self,
        token: &str,
        notification: &PushNotification,
    ) -> std::result::Result<(), PushError> {
        let body = serde_json::json!({
            "to": token,
            "notification": {
                "title": notification.title,
                "body": notification.body,
            },
            "data": notification.data,
        });

        let response = self
            .http
            .post(&self.gateway_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PushError {
                reason: format!("gateway request failed: {e}"),
                invalid_token: false,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // The gateway reports dead tokens as 4xx on the token resource
        let invalid_token = matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE
        );
        Err(PushError {
            reason: format!("gateway returned {status}"),
            invalid_token,
        })
    }
}

/// Sender that only logs; used when no gateway is configured
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(
        &self,
        _token: &str,
        notification: &PushNotification,
    ) -> std::result::Result<(), PushError> {
        debug!(title = %notification.title, "Push gateway not configured, delivery skipped");
        Ok(())
    }
}

/// Recording sender for tests: remembers payloads, fails configured tokens
#[derive(Default)]
pub struct RecordingPushSender {
    pub sent: tokio::sync::Mutex<Vec<(String, PushNotification)>>,
    pub failing_tokens: Vec<String>,
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(
        &self,
        token: &str,
        notification: &PushNotification,
    ) -> std::result::Result<(), PushError> {
        if self.failing_tokens.iter().any(|t| t == token) {
            return Err(PushError {
                reason: "expired token".to_string(),
                invalid_token: true,
            });
        }
        self.sent
            .lock()
            .await
            .push((token.to_string(), notification.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{IncidentStatus, AlertType};
    use crate::models::{GeoLocation, Severity};
    use chrono::Utc;

    fn incident(incident_type: IncidentType) -> Incident {
        Incident {
            id: "inc-1".to_string(),
            incident_type,
            device_id: "stick-001".to_string(),
            user_id: None,
            timestamp: Utc::now(),
            severity: Severity::High,
            status: IncidentStatus::Active,
            location: Some(GeoLocation {
                lat: 40.7128,
                lon: -74.006,
                accuracy_m: None,
            }),
            metadata: serde_json::Value::Null,
            notification: None,
            resolution: None,
            escalation: None,
            acknowledgments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn zero_tokens_is_an_empty_success() {
        let fanout = NotificationFanout::new(Arc::new(RecordingPushSender::default()));
        let report = fanout.deliver(&incident(IncidentType::Sos), &[]).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let sender = Arc::new(RecordingPushSender {
            failing_tokens: vec!["dead".to_string()],
            ..Default::default()
        });
        let fanout = NotificationFanout::new(Arc::clone(&sender) as Arc<dyn PushSender>);
        let tokens = vec!["a".to_string(), "dead".to_string(), "b".to_string()];

        let report = fanout.deliver(&incident(IncidentType::Sos), &tokens).await;
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].token, "dead");
        assert!(report.failures[0].invalid_token);
        assert_eq!(sender.sent.lock().await.len(), 2);
    }

    #[test]
    fn sos_payload_carries_emergency_discriminator_and_string_location() {
        let payload = build_payload(&incident(IncidentType::Sos));
        assert_eq!(payload.data.get("emergencyType").unwrap(), "SOS");
        assert_eq!(payload.data.get("lat").unwrap(), "40.7128");
        assert_eq!(payload.data.get("deviceId").unwrap(), "stick-001");
    }

    #[test]
    fn alert_payload_carries_alert_type() {
        let payload = build_payload(&incident(IncidentType::Alert(AlertType::LowBattery)));
        assert_eq!(payload.data.get("alertType").unwrap(), "LOW_BATTERY");
        assert_eq!(payload.data.get("type").unwrap(), "ALERT");
    }
}
