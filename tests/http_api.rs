//! HTTP API tests
//!
//! Exercises the axum router end to end with an in-memory registry, a
//! recording push sender and a stub command transport - no broker, no
//! network.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use stickguard::error::Result;
use stickguard::notification::{PushSender, RecordingPushSender};
use stickguard::registry::{DeviceRegistry, InMemoryRegistry};
use stickguard::transport::{CommandTransport, TransportConfig, TransportRouter};
use stickguard::web_api;
use stickguard::{AppConfig, AppState};

struct StubTransport {
    connected: bool,
    published: tokio::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait::async_trait]
impl CommandTransport for StubTransport {
    async fn is_connected(&self) -> bool {
        self.connected
    }

    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

struct TestApp {
    app: Router,
    registry: Arc<InMemoryRegistry>,
}

fn test_app(connected: bool) -> TestApp {
    let registry = Arc::new(InMemoryRegistry::new());
    let transport = Arc::new(StubTransport {
        connected,
        published: tokio::sync::Mutex::new(Vec::new()),
    });
    let router = TransportRouter::new(TransportConfig::default());
    let state = AppState::build(
        AppConfig::default(),
        Arc::clone(&registry) as Arc<dyn DeviceRegistry>,
        Arc::new(RecordingPushSender::default()) as Arc<dyn PushSender>,
        router,
        transport,
    );
    TestApp {
        app: web_api::create_router(state),
        registry,
    }
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_as(uri: &str, user: &str, role: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", user);
    if let Some(role) = role {
        builder = builder.header("x-role", role);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn telemetry_returns_201_and_raises_low_battery_incident() {
    let t = test_app(true);

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/telemetry",
            serde_json::json!({
                "deviceId": "stick-001",
                "sensors": { "battery": { "level": 8 } },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["deviceId"], "stick-001");
    assert!(body["id"].is_string());

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/incidents?deviceId=stick-001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let incidents = body["data"].as_array().unwrap();
    let alert = incidents
        .iter()
        .find(|i| i["type"] == "ALERT" && i["alertType"] == "LOW_BATTERY")
        .expect("low battery incident");
    assert_eq!(alert["severity"], "high");
    assert_eq!(alert["status"], "active");
}

#[tokio::test]
async fn out_of_range_latitude_is_rejected_with_field_list() {
    let t = test_app(true);
    let response = t
        .app
        .oneshot(post_json(
            "/telemetry",
            serde_json::json!({
                "deviceId": "stick-001",
                "gps": { "lat": 90.0001, "lon": 0.0 },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
    assert_eq!(body["fields"][0], "gps.lat");
}

#[tokio::test]
async fn body_missing_required_field_is_400_with_validation_envelope() {
    let t = test_app(true);
    let response = t
        .app
        .oneshot(post_json(
            "/telemetry",
            serde_json::json!({
                "sensors": { "battery": { "level": 8 } },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn sos_with_no_tokens_returns_201_and_zero_notifications() {
    let t = test_app(true);
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/sos",
            serde_json::json!({
                "deviceId": "stick-001",
                "gps": { "lat": 40.7128, "lon": -74.0060 },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["notificationsSent"], 0);
    assert_eq!(body["deviceId"], "stick-001");

    let id = body["eventId"].as_str().unwrap().to_string();
    let response = t
        .app
        .oneshot(
            Request::builder()
                .uri(format!("/api/incidents/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "active");
    assert_eq!(body["data"]["type"], "SOS");
}

#[tokio::test]
async fn command_requires_authorization() {
    let t = test_app(true);
    t.registry
        .register("stick-001", vec!["owner-1".to_string()], vec![])
        .await;

    // No identity
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/commands/stick-001",
            serde_json::json!({"command": "vibrate"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Wrong user
    let response = t
        .app
        .clone()
        .oneshot(post_json_as(
            "/commands/stick-001",
            "stranger",
            None,
            serde_json::json!({"command": "vibrate"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Owner
    let response = t
        .app
        .oneshot(post_json_as(
            "/commands/stick-001",
            "owner-1",
            None,
            serde_json::json!({"command": "vibrate", "parameters": {"durationMs": 300}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["command"], "vibrate");
    assert_eq!(body["parameters"]["durationMs"], 300);
    assert!(body["messageId"].is_string());
}

#[tokio::test]
async fn command_with_transport_down_is_503() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(post_json_as(
            "/commands/stick-001",
            "admin-1",
            Some("admin"),
            serde_json::json!({"command": "beep"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_command_is_400() {
    let t = test_app(true);
    let response = t
        .app
        .oneshot(post_json_as(
            "/commands/stick-001",
            "admin-1",
            Some("admin"),
            serde_json::json!({"command": "self_destruct"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bulk_dispatch_reports_partial_success() {
    let t = test_app(true);
    let response = t
        .app
        .clone()
        .oneshot(post_json_as(
            "/commands/bulk",
            "admin-1",
            Some("admin"),
            serde_json::json!({
                "deviceIds": ["a", "bad id", "b"],
                "command": "vibrate",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["dispatched"], 2);
    assert_eq!(body["failed"], 1);

    // Non-admin cannot bulk dispatch
    let response = t
        .app
        .oneshot(post_json_as(
            "/commands/bulk",
            "owner-1",
            None,
            serde_json::json!({"deviceIds": ["a"], "command": "beep"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn incident_lifecycle_over_http() {
    let t = test_app(true);
    t.registry
        .register("stick-001", vec!["owner-1".to_string()], vec![])
        .await;

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/sos",
            serde_json::json!({"deviceId": "stick-001"}),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["eventId"]
        .as_str()
        .unwrap()
        .to_string();

    // Acknowledge twice: two entries, status stays acknowledged
    for _ in 0..2 {
        let response = t
            .app
            .clone()
            .oneshot(post_json_as(
                &format!("/incidents/{id}/acknowledge"),
                "owner-1",
                None,
                serde_json::json!({"note": "seen"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/incidents/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "acknowledged");
    assert_eq!(body["data"]["acknowledgments"].as_array().unwrap().len(), 2);

    // Escalate with an out-of-range level gets clamped
    let response = t
        .app
        .clone()
        .oneshot(post_json_as(
            &format!("/incidents/{id}/escalate"),
            "owner-1",
            None,
            serde_json::json!({"target": "dispatch", "reason": "no answer", "level": 9}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["escalation"]["level"], 5);

    // Resolve, then a second resolve conflicts
    let response = t
        .app
        .clone()
        .oneshot(post_json_as(
            &format!("/incidents/{id}/resolve"),
            "owner-1",
            None,
            serde_json::json!({"note": "all clear", "actions": ["visited"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .clone()
        .oneshot(post_json_as(
            &format!("/incidents/{id}/resolve"),
            "owner-1",
            None,
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Acknowledging a resolved incident also conflicts
    let response = t
        .app
        .oneshot(post_json_as(
            &format!("/incidents/{id}/acknowledge"),
            "owner-1",
            None,
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn healthz_reports_broker_disconnected() {
    let t = test_app(true);
    let response = t
        .app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    // The real router never connected in tests
    assert_eq!(body["broker_connected"], false);
}
