//! IncidentService - Incident Lifecycle Manager
//!
//! ## Responsibilities
//!
//! - Own the Active/Acknowledged/Resolved state machine for SOS and alert
//!   incidents
//! - Record acknowledgments (append-only), resolution (terminal) and
//!   escalation (overwrite, level clamped to 1-5)
//! - Fan out notifications on creation and record the outcome for audit
//!
//! Authorization is enforced by the caller; this service trusts the
//! caller's decision and exposes no authorization logic itself. Mutations
//! go through a single per-entity critical section, which is the only
//! atomicity the spec relies on.

mod types;

pub use types::*;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::notification::{FanoutReport, NotificationFanout};
use crate::registry::DeviceRegistry;

/// Escalation levels are clamped into this range
pub const ESCALATION_MIN: u8 = 1;
pub const ESCALATION_MAX: u8 = 5;

/// Query filter for incident listings
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub device_id: Option<String>,
    pub status: Option<IncidentStatus>,
    pub limit: Option<usize>,
}

/// IncidentService instance
pub struct IncidentService {
    incidents: RwLock<HashMap<String, Incident>>,
    registry: Arc<dyn DeviceRegistry>,
    fanout: Arc<NotificationFanout>,
    retention: Duration,
}

impl IncidentService {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        fanout: Arc<NotificationFanout>,
        retention: Duration,
    ) -> Self {
        Self {
            incidents: RwLock::new(HashMap::new()),
            registry,
            fanout,
            retention,
        }
    }

    /// Create an incident without notifying anyone (presence changes,
    /// command audit entries)
    pub async fn create(&self, new: NewIncident) -> Incident {
        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            incident_type: new.incident_type,
            device_id: new.device_id,
            user_id: new.user_id,
            timestamp: new.timestamp.unwrap_or_else(Utc::now),
            severity: new.severity,
            status: IncidentStatus::Active,
            location: new.location,
            metadata: new.metadata,
            notification: None,
            resolution: None,
            escalation: None,
            acknowledgments: Vec::new(),
        };

        info!(
            incident_id = %incident.id,
            device_id = %incident.device_id,
            incident_type = incident.incident_type.label(),
            severity = %incident.severity,
            "Incident created"
        );

        self.incidents
            .write()
            .await
            .insert(incident.id.clone(), incident.clone());
        incident
    }

    /// Create an incident and fan out push notifications to the device's
    /// registered tokens.
    ///
    /// Notification failures (including a registry lookup failure) are
    /// recorded on the incident and logged; they never fail this call.
    /// Zero recipients is a normal outcome.
    pub async fn create_and_notify(&self, new: NewIncident) -> (Incident, FanoutReport) {
        let incident = self.create(new).await;

        let (tokens, lookup_error) = match self.registry.push_tokens(&incident.device_id).await {
            Ok(tokens) => (tokens, None),
            Err(e) => {
                warn!(
                    incident_id = %incident.id,
                    error = %e,
                    "Push token lookup failed, notifying nobody"
                );
                (Vec::new(), Some(e.to_string()))
            }
        };

        let report = self.fanout.deliver(&incident, &tokens).await;
        let record = NotificationRecord {
            sent: report.failed == 0 && lookup_error.is_none(),
            sent_at: Utc::now(),
            delivered: report.sent,
            failed: report.failed,
            error: lookup_error.or_else(|| report.first_error()),
        };

        let updated = self
            .update(&incident.id, |incident| {
                incident.notification = Some(record);
                Ok(incident.clone())
            })
            .await
            .unwrap_or(incident);

        (updated, report)
    }

    /// Atomic per-entity mutation
    async fn update<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Incident) -> Result<T>,
    {
        let mut incidents = self.incidents.write().await;
        let incident = incidents
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("incident {id}")))?;
        f(incident)
    }

    pub async fn get(&self, id: &str) -> Result<Incident> {
        self.incidents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("incident {id}")))
    }

    /// List incidents, newest first
    pub async fn list(&self, filter: &IncidentFilter) -> Vec<Incident> {
        let incidents = self.incidents.read().await;
        let mut matched: Vec<Incident> = incidents
            .values()
            .filter(|i| {
                filter
                    .device_id
                    .as_ref()
                    .map(|d| &i.device_id == d)
                    .unwrap_or(true)
                    && filter.status.map(|s| i.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Most recent alert of the given type for a device at or after
    /// `since`. Used by the cooldown check; read-then-decide, no lock
    /// spanning the decision (accepted race, see DESIGN.md).
    pub async fn latest_alert_since(
        &self,
        device_id: &str,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.incidents
            .read()
            .await
            .values()
            .filter(|i| {
                i.device_id == device_id
                    && i.incident_type == IncidentType::Alert(alert_type)
                    && i.timestamp >= since
            })
            .map(|i| i.timestamp)
            .max()
    }

    /// Append an acknowledgment. Transitions Active -> Acknowledged; an
    /// already-Acknowledged incident still gets a new entry. Resolved
    /// incidents reject acknowledgment with a conflict.
    pub async fn acknowledge(
        &self,
        id: &str,
        user_id: &str,
        note: Option<String>,
    ) -> Result<Incident> {
        self.update(id, |incident| {
            if incident.status == IncidentStatus::Resolved {
                return Err(Error::Conflict(format!(
                    "incident {id} is resolved and cannot be acknowledged"
                )));
            }
            incident.acknowledgments.push(Acknowledgment {
                acknowledged_by: user_id.to_string(),
                acknowledged_at: Utc::now(),
                note,
            });
            if incident.status == IncidentStatus::Active {
                incident.status = IncidentStatus::Acknowledged;
            }
            Ok(incident.clone())
        })
        .await
    }

    /// Resolve an incident. Terminal: a second resolve is a conflict and
    /// leaves the first resolution record untouched.
    pub async fn resolve(
        &self,
        id: &str,
        user_id: &str,
        note: Option<String>,
        actions: Vec<String>,
    ) -> Result<Incident> {
        self.update(id, |incident| {
            if incident.status == IncidentStatus::Resolved {
                return Err(Error::Conflict(format!("incident {id} is already resolved")));
            }
            incident.status = IncidentStatus::Resolved;
            incident.resolution = Some(Resolution {
                resolved_by: user_id.to_string(),
                resolved_at: Utc::now(),
                note,
                actions,
            });
            Ok(incident.clone())
        })
        .await
    }

    /// Record an escalation. Independent of status; each call overwrites
    /// the previous record; the level is clamped into [1, 5].
    pub async fn escalate(
        &self,
        id: &str,
        target: &str,
        reason: &str,
        level: i64,
    ) -> Result<Incident> {
        let level = level.clamp(ESCALATION_MIN as i64, ESCALATION_MAX as i64) as u8;
        self.update(id, |incident| {
            incident.escalation = Some(Escalation {
                target: target.to_string(),
                reason: reason.to_string(),
                level,
                escalated_at: Utc::now(),
            });
            Ok(incident.clone())
        })
        .await
    }

    pub async fn count(&self) -> usize {
        self.incidents.read().await.len()
    }

    /// Expire resolved incidents older than the retention window. Open
    /// incidents are kept regardless of age.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut incidents = self.incidents.write().await;
        let before = incidents.len();
        incidents.retain(|_, i| i.status != IncidentStatus::Resolved || i.timestamp >= cutoff);
        before - incidents.len()
    }
}

/// Inbound SOS payload (HTTP body and MQTT message share this shape)
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosRequest {
    pub device_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub gps: Option<crate::telemetry::types::GpsReading>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IncidentService {
    /// Open a critical SOS incident and notify the device's recipients.
    ///
    /// Always succeeds for a well-formed request; the notification outcome
    /// rides on the incident record.
    pub async fn sos(&self, req: SosRequest) -> Result<(Incident, FanoutReport)> {
        if !crate::models::is_valid_device_id(&req.device_id) {
            return Err(Error::validation(
                format!("invalid device id: {}", req.device_id),
                vec!["deviceId".to_string()],
            ));
        }
        if let Some(gps) = &req.gps {
            let mut fields = Vec::new();
            if !(gps.lat.is_finite() && (-90.0..=90.0).contains(&gps.lat)) {
                fields.push("gps.lat".to_string());
            }
            if !(gps.lon.is_finite() && (-180.0..=180.0).contains(&gps.lon)) {
                fields.push("gps.lon".to_string());
            }
            if !fields.is_empty() {
                return Err(Error::validation(
                    format!("{} invalid field(s)", fields.len()),
                    fields,
                ));
            }
        }

        Ok(self
            .create_and_notify(NewIncident {
                incident_type: IncidentType::Sos,
                device_id: req.device_id,
                user_id: req.user_id,
                severity: crate::models::Severity::Critical,
                location: req.gps.map(|g| g.location()),
                metadata: req.metadata.unwrap_or(serde_json::Value::Null),
                timestamp: req.timestamp,
            })
            .await)
    }
}

/// Routes inbound `{root}/{deviceId}/sos` messages into the lifecycle
/// manager. Parse failures are logged and dropped.
pub struct SosMessageHandler {
    incidents: Arc<IncidentService>,
}

impl SosMessageHandler {
    pub fn new(incidents: Arc<IncidentService>) -> Self {
        Self { incidents }
    }
}

#[async_trait::async_trait]
impl crate::transport::MessageHandler for SosMessageHandler {
    async fn handle(&self, msg: crate::transport::InboundMessage) {
        let request: SosRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Unparseable SOS message dropped");
                return;
            }
        };
        match self.incidents.sos(request).await {
            Ok((incident, report)) => {
                info!(
                    incident_id = %incident.id,
                    notifications_sent = report.sent,
                    "SOS incident opened from broker message"
                );
            }
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "SOS message rejected");
            }
        }
    }
}
