//! CommandDispatcher - device command validation and publish
//!
//! ## Responsibilities
//!
//! - Validate device id and command, generate the correlation message id
//! - Publish `{command, parameters, messageId, timestamp}` to the device
//!   command topic at QoS >= 1
//! - Record an immutable dispatch entry per attempt
//! - Bulk and emergency-bundle dispatch with per-device/per-command
//!   isolation
//!
//! Dispatch is fire-and-forget at the transport layer: a successful
//! publish means the broker accepted the message. The device's response
//! arrives later on its response topic and is correlated by message id;
//! no timeout or retry is tracked here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::incident::{IncidentService, IncidentType, NewIncident};
use crate::models::{is_valid_device_id, Severity};
use crate::transport::{CommandTransport, InboundMessage, MessageHandler, TopicPattern};

/// The fixed command vocabulary devices understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    Vibrate,
    Beep,
    LedOn,
    LedOff,
    StatusCheck,
    Reboot,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Vibrate => "vibrate",
            DeviceCommand::Beep => "beep",
            DeviceCommand::LedOn => "led_on",
            DeviceCommand::LedOff => "led_off",
            DeviceCommand::StatusCheck => "status_check",
            DeviceCommand::Reboot => "reboot",
        }
    }
}

impl FromStr for DeviceCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vibrate" => Ok(DeviceCommand::Vibrate),
            "beep" => Ok(DeviceCommand::Beep),
            "led_on" => Ok(DeviceCommand::LedOn),
            "led_off" => Ok(DeviceCommand::LedOff),
            "status_check" => Ok(DeviceCommand::StatusCheck),
            "reboot" => Ok(DeviceCommand::Reboot),
            other => Err(Error::validation(
                format!("unknown command: {other}"),
                vec!["command".to_string()],
            )),
        }
    }
}

/// Outcome recorded on a dispatch entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum DispatchOutcome {
    Accepted,
    Failed(String),
}

/// Immutable record of one dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDispatch {
    pub device_id: String,
    pub command: DeviceCommand,
    pub parameters: serde_json::Value,
    pub message_id: String,
    pub dispatched_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

/// Per-device result inside a bulk dispatch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub device_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bulk dispatch report; success means at least one device succeeded
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub success: bool,
    pub dispatched: u32,
    pub failed: u32,
    pub results: Vec<BulkResult>,
}

/// The emergency bundle: visual, haptic, audible - in that order
pub const EMERGENCY_BUNDLE: [DeviceCommand; 3] = [
    DeviceCommand::LedOn,
    DeviceCommand::Vibrate,
    DeviceCommand::Beep,
];

struct DispatchLog {
    entries: VecDeque<CommandDispatch>,
    capacity: usize,
}

impl DispatchLog {
    fn push(&mut self, entry: CommandDispatch) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// CommandDispatcher instance
pub struct CommandDispatcher {
    transport: Arc<dyn CommandTransport>,
    incidents: Arc<IncidentService>,
    log: RwLock<DispatchLog>,
    topic_root: String,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        incidents: Arc<IncidentService>,
        topic_root: String,
        log_capacity: usize,
    ) -> Self {
        Self {
            transport,
            incidents,
            log: RwLock::new(DispatchLog {
                entries: VecDeque::with_capacity(log_capacity),
                capacity: log_capacity,
            }),
            topic_root,
        }
    }

    fn command_topic(&self, device_id: &str) -> String {
        format!("{}/{}/command", self.topic_root, device_id)
    }

    /// Validate, publish and record one command.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: DeviceCommand,
        parameters: serde_json::Value,
    ) -> Result<CommandDispatch> {
        if !is_valid_device_id(device_id) {
            return Err(Error::validation(
                format!("invalid device id: {device_id}"),
                vec!["deviceId".to_string()],
            ));
        }
        if !self.transport.is_connected().await {
            return Err(Error::ServiceUnavailable(
                "command transport is not connected".to_string(),
            ));
        }

        let message_id = Uuid::new_v4().to_string();
        let dispatched_at = Utc::now();
        let payload = serde_json::json!({
            "command": command.as_str(),
            "parameters": parameters,
            "messageId": message_id,
            "timestamp": dispatched_at.to_rfc3339(),
        });

        let publish_result = self
            .transport
            .publish_json(&self.command_topic(device_id), &payload)
            .await;

        let outcome = match &publish_result {
            Ok(()) => DispatchOutcome::Accepted,
            Err(e) => DispatchOutcome::Failed(e.to_string()),
        };

        let entry = CommandDispatch {
            device_id: device_id.to_string(),
            command,
            parameters,
            message_id: message_id.clone(),
            dispatched_at,
            outcome,
        };
        self.log.write().await.push(entry.clone());

        publish_result?;

        info!(
            device_id = %device_id,
            command = command.as_str(),
            message_id = %message_id,
            "Command dispatched"
        );
        self.incidents
            .create(NewIncident {
                incident_type: IncidentType::CommandSent,
                device_id: device_id.to_string(),
                user_id: None,
                severity: Severity::Low,
                location: None,
                metadata: serde_json::json!({
                    "command": command.as_str(),
                    "messageId": message_id,
                }),
                timestamp: Some(dispatched_at),
            })
            .await;

        Ok(entry)
    }

    /// Dispatch one command to many devices. Each device is handled
    /// independently; the batch succeeds when at least one did.
    pub async fn dispatch_bulk(
        &self,
        device_ids: &[String],
        command: DeviceCommand,
        parameters: serde_json::Value,
    ) -> BulkReport {
        let mut results = Vec::with_capacity(device_ids.len());
        let mut dispatched = 0u32;
        let mut failed = 0u32;

        for device_id in device_ids {
            match self.dispatch(device_id, command, parameters.clone()).await {
                Ok(entry) => {
                    dispatched += 1;
                    results.push(BulkResult {
                        device_id: device_id.clone(),
                        ok: true,
                        message_id: Some(entry.message_id),
                        error: None,
                    });
                }
                Err(e) => {
                    failed += 1;
                    results.push(BulkResult {
                        device_id: device_id.clone(),
                        ok: false,
                        message_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        BulkReport {
            success: dispatched > 0,
            dispatched,
            failed,
            results,
        }
    }

    /// Fire the fixed emergency bundle at one device, each command
    /// isolated like a bulk dispatch.
    pub async fn dispatch_emergency_bundle(&self, device_id: &str) -> BulkReport {
        let mut results = Vec::with_capacity(EMERGENCY_BUNDLE.len());
        let mut dispatched = 0u32;
        let mut failed = 0u32;

        for command in EMERGENCY_BUNDLE {
            match self
                .dispatch(device_id, command, serde_json::json!({}))
                .await
            {
                Ok(entry) => {
                    dispatched += 1;
                    results.push(BulkResult {
                        device_id: device_id.to_string(),
                        ok: true,
                        message_id: Some(entry.message_id),
                        error: None,
                    });
                }
                Err(e) => {
                    failed += 1;
                    results.push(BulkResult {
                        device_id: device_id.to_string(),
                        ok: false,
                        message_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        BulkReport {
            success: dispatched > 0,
            dispatched,
            failed,
            results,
        }
    }

    /// Recent dispatch entries, newest first
    pub async fn recent(&self, count: usize) -> Vec<CommandDispatch> {
        let log = self.log.read().await;
        log.entries.iter().rev().take(count).cloned().collect()
    }

    /// Dispatch entry by correlation message id
    pub async fn find_by_message_id(&self, message_id: &str) -> Option<CommandDispatch> {
        let log = self.log.read().await;
        log.entries
            .iter()
            .rev()
            .find(|e| e.message_id == message_id)
            .cloned()
    }
}

/// Device response payload on `{root}/{deviceId}/response`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    message_id: String,
    #[serde(default)]
    status: Option<String>,
}

/// Correlates inbound command responses with dispatch records.
///
/// Unknown message ids and unparseable payloads are logged and dropped.
pub struct CommandResponseHandler {
    dispatcher: Arc<CommandDispatcher>,
    incidents: Arc<IncidentService>,
    pattern: TopicPattern,
}

impl CommandResponseHandler {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        incidents: Arc<IncidentService>,
        topic_root: &str,
    ) -> Self {
        Self {
            dispatcher,
            incidents,
            pattern: TopicPattern::new(format!("{topic_root}/+/response")),
        }
    }
}

#[async_trait]
impl MessageHandler for CommandResponseHandler {
    async fn handle(&self, msg: InboundMessage) {
        let Some(device_id) = self.pattern.capture(&msg.topic) else {
            warn!(topic = %msg.topic, "Response on unexpected topic shape");
            return;
        };
        let response: CommandResponse = match serde_json::from_slice(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Unparseable command response dropped");
                return;
            }
        };

        let Some(dispatch) = self
            .dispatcher
            .find_by_message_id(&response.message_id)
            .await
        else {
            warn!(
                message_id = %response.message_id,
                "Response does not correlate with any dispatch record"
            );
            return;
        };

        self.incidents
            .create(NewIncident {
                incident_type: IncidentType::CommandReceived,
                device_id: device_id.to_string(),
                user_id: None,
                severity: Severity::Low,
                location: None,
                metadata: serde_json::json!({
                    "command": dispatch.command.as_str(),
                    "messageId": response.message_id,
                    "status": response.status,
                }),
                timestamp: None,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::IncidentFilter;
    use crate::notification::{NotificationFanout, RecordingPushSender};
    use crate::registry::InMemoryRegistry;
    use chrono::Duration;
    use tokio::sync::Mutex;

    struct MockTransport {
        connected: bool,
        published: Mutex<Vec<(String, serde_json::Value)>>,
        fail_topics: Vec<String>,
    }

    impl MockTransport {
        fn connected() -> Self {
            Self {
                connected: true,
                published: Mutex::new(Vec::new()),
                fail_topics: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CommandTransport for MockTransport {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
            if self.fail_topics.iter().any(|t| t == topic) {
                return Err(Error::ServiceUnavailable(format!(
                    "publish to {topic} failed: broker rejected"
                )));
            }
            self.published
                .lock()
                .await
                .push((topic.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn incidents() -> Arc<IncidentService> {
        Arc::new(IncidentService::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(NotificationFanout::new(Arc::new(
                RecordingPushSender::default(),
            ))),
            Duration::days(30),
        ))
    }

    fn dispatcher(transport: Arc<MockTransport>) -> CommandDispatcher {
        CommandDispatcher::new(transport, incidents(), "stick".to_string(), 100)
    }

    #[tokio::test]
    async fn dispatch_publishes_to_the_command_topic() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(Arc::clone(&transport));

        let entry = d
            .dispatch(
                "stick-001",
                DeviceCommand::Vibrate,
                serde_json::json!({"durationMs": 500}),
            )
            .await
            .unwrap();

        let published = transport.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "stick/stick-001/command");
        assert_eq!(published[0].1["command"], "vibrate");
        assert_eq!(published[0].1["messageId"], entry.message_id);
        assert_eq!(entry.outcome, DispatchOutcome::Accepted);
    }

    #[tokio::test]
    async fn dispatch_records_parameters_round_trip() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(transport);

        let params = serde_json::json!({"pattern": [100, 50, 100], "intensity": 0.8});
        let entry = d
            .dispatch("stick-001", DeviceCommand::Vibrate, params.clone())
            .await
            .unwrap();

        let recorded = d.find_by_message_id(&entry.message_id).await.unwrap();
        assert_eq!(recorded.parameters, params);
    }

    #[tokio::test]
    async fn invalid_device_id_is_rejected_before_any_side_effect() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(Arc::clone(&transport));

        let err = d
            .dispatch("bad id", DeviceCommand::Beep, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(transport.published.lock().await.is_empty());
        assert!(d.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn disconnected_transport_is_service_unavailable() {
        let transport = Arc::new(MockTransport {
            connected: false,
            published: Mutex::new(Vec::new()),
            fail_topics: Vec::new(),
        });
        let d = dispatcher(transport);

        let err = d
            .dispatch("stick-001", DeviceCommand::Beep, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn bulk_isolates_failures_and_succeeds_on_any_success() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(transport);

        let ids = vec!["a".to_string(), "bad id".to_string(), "b".to_string()];
        let report = d
            .dispatch_bulk(&ids, DeviceCommand::Vibrate, serde_json::json!({}))
            .await;

        assert!(report.success);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.results[1].ok);
        assert!(report.results[0].ok && report.results[2].ok);
    }

    #[tokio::test]
    async fn bulk_with_all_failures_is_not_success() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(transport);

        let ids = vec!["bad id".to_string(), "also bad".to_string()];
        let report = d
            .dispatch_bulk(&ids, DeviceCommand::Beep, serde_json::json!({}))
            .await;
        assert!(!report.success);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn emergency_bundle_sends_three_commands_in_order() {
        let transport = Arc::new(MockTransport::connected());
        let d = dispatcher(Arc::clone(&transport));

        let report = d.dispatch_emergency_bundle("stick-001").await;
        assert!(report.success);
        assert_eq!(report.dispatched, 3);

        let published = transport.published.lock().await;
        let commands: Vec<&str> = published
            .iter()
            .map(|(_, p)| p["command"].as_str().unwrap())
            .collect();
        assert_eq!(commands, vec!["led_on", "vibrate", "beep"]);
    }

    #[tokio::test]
    async fn failed_publish_is_recorded_with_its_reason() {
        let transport = Arc::new(MockTransport {
            connected: true,
            published: Mutex::new(Vec::new()),
            fail_topics: vec!["stick/stick-001/command".to_string()],
        });
        let d = dispatcher(transport);

        let err = d
            .dispatch("stick-001", DeviceCommand::Reboot, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));

        let recent = d.recent(1).await;
        assert!(matches!(recent[0].outcome, DispatchOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn response_handler_records_command_received() {
        let transport = Arc::new(MockTransport::connected());
        let incident_svc = incidents();
        let d = Arc::new(CommandDispatcher::new(
            transport,
            Arc::clone(&incident_svc),
            "stick".to_string(),
            100,
        ));
        let entry = d
            .dispatch("stick-001", DeviceCommand::StatusCheck, serde_json::json!({}))
            .await
            .unwrap();

        let handler =
            CommandResponseHandler::new(Arc::clone(&d), Arc::clone(&incident_svc), "stick");
        handler
            .handle(InboundMessage {
                topic: "stick/stick-001/response".to_string(),
                payload: serde_json::to_vec(&serde_json::json!({
                    "messageId": entry.message_id,
                    "status": "ok",
                }))
                .unwrap(),
            })
            .await;

        // The same payload on a non-response topic is ignored
        handler
            .handle(InboundMessage {
                topic: "stick/stick-001/telemetry".to_string(),
                payload: serde_json::to_vec(&serde_json::json!({
                    "messageId": entry.message_id,
                    "status": "ok",
                }))
                .unwrap(),
            })
            .await;

        let received = incident_svc
            .list(&IncidentFilter {
                device_id: Some("stick-001".to_string()),
                ..Default::default()
            })
            .await
            .into_iter()
            .filter(|i| i.incident_type == IncidentType::CommandReceived)
            .count();
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn response_with_unknown_message_id_is_dropped() {
        let transport = Arc::new(MockTransport::connected());
        let incident_svc = incidents();
        let d = Arc::new(CommandDispatcher::new(
            transport,
            Arc::clone(&incident_svc),
            "stick".to_string(),
            100,
        ));
        let handler = CommandResponseHandler::new(d, Arc::clone(&incident_svc), "stick");

        handler
            .handle(InboundMessage {
                topic: "stick/stick-001/response".to_string(),
                payload: br#"{"messageId":"nope"}"#.to_vec(),
            })
            .await;

        assert_eq!(incident_svc.count().await, 0);
    }

    #[test]
    fn command_parses_from_wire_strings() {
        assert_eq!("led_on".parse::<DeviceCommand>().unwrap(), DeviceCommand::LedOn);
        assert!("explode".parse::<DeviceCommand>().is_err());
    }
}
