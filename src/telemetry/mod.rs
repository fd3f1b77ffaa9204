//! TelemetryIngestor - validation, persistence and rule evaluation
//!
//! ## Responsibilities
//!
//! - Validate numeric ranges and shape of inbound telemetry
//! - Persist accepted records (append-only, no deduplication)
//! - Update device last-seen and presence (best-effort)
//! - Run the alert rules synchronously on every accepted record
//!
//! Delivery from the broker is at-least-once and unordered; duplicates
//! simply become more records, and the cooldown keeps them from becoming
//! more alerts.

pub mod presence;
pub mod store;
pub mod types;
pub mod validation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alert_engine::AlertEngine;
use crate::error::Result;
use crate::incident::{IncidentService, IncidentType, NewIncident};
use crate::models::{now_or, Severity};
use crate::registry::DeviceRegistry;
use crate::transport::{InboundMessage, MessageHandler};

use presence::{PresenceEvent, PresenceTracker};
use store::TelemetryStore;
use types::{TelemetryRecord, TelemetryRequest, MAX_EXTENSION_KEYS};

/// Receipt returned to the submitting device
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub alerts_raised: u32,
}

/// TelemetryIngestor instance
pub struct TelemetryIngestor {
    store: Arc<TelemetryStore>,
    registry: Arc<dyn DeviceRegistry>,
    alert_engine: Arc<AlertEngine>,
    presence: Arc<PresenceTracker>,
    incidents: Arc<IncidentService>,
}

impl TelemetryIngestor {
    pub fn new(
        store: Arc<TelemetryStore>,
        registry: Arc<dyn DeviceRegistry>,
        alert_engine: Arc<AlertEngine>,
        presence: Arc<PresenceTracker>,
        incidents: Arc<IncidentService>,
    ) -> Self {
        Self {
            store,
            registry,
            alert_engine,
            presence,
            incidents,
        }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// Ingest one telemetry message.
    ///
    /// Validation failure persists nothing. After persistence, last-seen
    /// and presence updates are best-effort and alert evaluation runs
    /// synchronously; none of those can fail the ingestion itself.
    pub async fn ingest(&self, req: TelemetryRequest) -> Result<IngestReceipt> {
        validation::validate_telemetry(&req)?;

        let mut extensions = req.extensions;
        if extensions.len() > MAX_EXTENSION_KEYS {
            debug!(
                device_id = %req.device_id,
                dropped = extensions.len() - MAX_EXTENSION_KEYS,
                "Extension map over limit, extra keys dropped"
            );
            // Keep the lexicographically-first keys so the surviving
            // subset does not depend on map iteration order
            let mut keep: Vec<String> = extensions.keys().cloned().collect();
            keep.sort();
            keep.truncate(MAX_EXTENSION_KEYS);
            extensions.retain(|k, _| keep.binary_search(k).is_ok());
        }

        let record = TelemetryRecord {
            id: Uuid::new_v4().to_string(),
            device_id: req.device_id,
            timestamp: now_or(req.timestamp),
            sensors: req.sensors,
            status: req.status.unwrap_or_default(),
            gps: req.gps,
            extensions,
        };

        // The previous fix must be looked up before this record lands
        let prev_with_fix = self.store.latest_with_fix(&record.device_id).await;
        self.store.append(record.clone()).await;

        if let Err(e) = self
            .registry
            .touch_last_seen(&record.device_id, record.timestamp)
            .await
        {
            warn!(device_id = %record.device_id, error = %e, "Last-seen update failed");
        }

        self.track_presence(&record).await;
        let alerts_raised = self.raise_alerts(&record, prev_with_fix.as_ref()).await;

        Ok(IngestReceipt {
            id: record.id,
            device_id: record.device_id,
            timestamp: record.timestamp,
            alerts_raised,
        })
    }

    async fn track_presence(&self, record: &TelemetryRecord) {
        let event = self
            .presence
            .update(&record.device_id, record.status.online)
            .await;
        let incident_type = match event {
            Some(PresenceEvent::CameOnline) => IncidentType::DeviceOnline,
            Some(PresenceEvent::WentOffline) => IncidentType::DeviceOffline,
            None => return,
        };
        self.incidents
            .create(NewIncident {
                incident_type,
                device_id: record.device_id.clone(),
                user_id: None,
                severity: Severity::Low,
                location: record.gps.map(|g| g.location()),
                metadata: serde_json::Value::Null,
                timestamp: Some(record.timestamp),
            })
            .await;
    }

    async fn raise_alerts(
        &self,
        record: &TelemetryRecord,
        prev_with_fix: Option<&TelemetryRecord>,
    ) -> u32 {
        let mut raised = 0;
        for candidate in AlertEngine::evaluate(record, prev_with_fix) {
            if self
                .alert_engine
                .suppressed(&record.device_id, &candidate)
                .await
            {
                continue;
            }
            self.incidents
                .create_and_notify(NewIncident {
                    incident_type: IncidentType::Alert(candidate.alert_type),
                    device_id: record.device_id.clone(),
                    user_id: None,
                    severity: candidate.severity,
                    location: candidate.location,
                    metadata: candidate.metadata,
                    timestamp: None,
                })
                .await;
            raised += 1;
        }
        raised
    }
}

/// Routes inbound `{root}/{deviceId}/telemetry` messages into the
/// ingestor. Parse and validation failures are logged and dropped.
pub struct TelemetryMessageHandler {
    ingestor: Arc<TelemetryIngestor>,
}

impl TelemetryMessageHandler {
    pub fn new(ingestor: Arc<TelemetryIngestor>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl MessageHandler for TelemetryMessageHandler {
    async fn handle(&self, msg: InboundMessage) {
        let request: TelemetryRequest = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Unparseable telemetry dropped");
                return;
            }
        };
        if let Err(e) = self.ingestor.ingest(request).await {
            warn!(topic = %msg.topic, error = %e, "Telemetry rejected");
        }
    }
}

/// Routes inbound `{root}/{deviceId}/status` messages into the presence
/// tracker, recording online/offline incidents on transitions.
pub struct StatusMessageHandler {
    presence: Arc<PresenceTracker>,
    incidents: Arc<IncidentService>,
}

impl StatusMessageHandler {
    pub fn new(presence: Arc<PresenceTracker>, incidents: Arc<IncidentService>) -> Self {
        Self {
            presence,
            incidents,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusMessage {
    device_id: String,
    online: bool,
}

#[async_trait]
impl MessageHandler for StatusMessageHandler {
    async fn handle(&self, msg: InboundMessage) {
        let status: StatusMessage = match serde_json::from_slice(&msg.payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Unparseable status message dropped");
                return;
            }
        };
        let event = self.presence.update(&status.device_id, status.online).await;
        let incident_type = match event {
            Some(PresenceEvent::CameOnline) => IncidentType::DeviceOnline,
            Some(PresenceEvent::WentOffline) => IncidentType::DeviceOffline,
            None => return,
        };
        self.incidents
            .create(NewIncident {
                incident_type,
                device_id: status.device_id,
                user_id: None,
                severity: Severity::Low,
                location: None,
                metadata: serde_json::Value::Null,
                timestamp: None,
            })
            .await;
    }
}
