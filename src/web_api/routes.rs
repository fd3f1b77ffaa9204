//! API Routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::command::DeviceCommand;
use crate::error::{Error, Result};
use crate::incident::{IncidentFilter, IncidentStatus, SosRequest};
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::telemetry::types::TelemetryRequest;

use super::{authorize_device, caller_from_headers, Json};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & status
        .route("/healthz", get(super::health_check))
        .route("/api/system/status", get(super::system_status))
        // Device-facing ingestion
        .route("/telemetry", post(ingest_telemetry))
        .route("/sos", post(submit_sos))
        // Commands
        .route("/commands/bulk", post(dispatch_bulk))
        .route("/commands/:device_id", post(dispatch_command))
        .route("/commands/:device_id/emergency", post(dispatch_emergency))
        .route("/api/commands/log", get(command_log))
        // Incident lifecycle
        .route("/incidents/:id/acknowledge", post(acknowledge_incident))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .route("/incidents/:id/escalate", post(escalate_incident))
        .route("/api/incidents", get(list_incidents))
        .route("/api/incidents/:id", get(get_incident))
        // Telemetry queries
        .route("/api/telemetry/:device_id", get(recent_telemetry))
        .with_state(state)
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    Json(req): Json<TelemetryRequest>,
) -> Result<impl IntoResponse> {
    let receipt = state.telemetry.ingest(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn submit_sos(
    State(state): State<AppState>,
    Json(req): Json<SosRequest>,
) -> Result<impl IntoResponse> {
    let (incident, report) = state.incidents.sos(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "eventId": incident.id,
            "deviceId": incident.device_id,
            "timestamp": incident.timestamp,
            "notificationsSent": report.sent,
        })),
    ))
}

/// Command request body
#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

async fn dispatch_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    authorize_device(&state, &caller, &device_id).await?;

    let command: DeviceCommand = req.command.parse()?;
    let parameters = req.parameters.unwrap_or_else(|| json!({}));
    let entry = state
        .commands
        .dispatch(&device_id, command, parameters)
        .await?;

    Ok(Json(json!({
        "deviceId": entry.device_id,
        "command": entry.command,
        "parameters": entry.parameters,
        "messageId": entry.message_id,
    })))
}

/// Bulk command request body (admin only)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkCommandRequest {
    device_ids: Vec<String>,
    command: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

async fn dispatch_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BulkCommandRequest>,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    if !caller.admin {
        return Err(Error::Forbidden(
            "bulk dispatch requires the admin role".to_string(),
        ));
    }

    let command: DeviceCommand = req.command.parse()?;
    let parameters = req.parameters.unwrap_or_else(|| json!({}));
    let report = state
        .commands
        .dispatch_bulk(&req.device_ids, command, parameters)
        .await;
    Ok(Json(report))
}

async fn dispatch_emergency(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    authorize_device(&state, &caller, &device_id).await?;
    let report = state.commands.dispatch_emergency_bundle(&device_id).await;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn command_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let entries = state.commands.recent(query.limit.unwrap_or(50)).await;
    Json(ApiResponse::success(entries))
}

/// Acknowledge request body
#[derive(Debug, Deserialize)]
struct AcknowledgeRequest {
    #[serde(default)]
    note: Option<String>,
}

async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AcknowledgeRequest>,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    let incident = state.incidents.get(&id).await?;
    authorize_device(&state, &caller, &incident.device_id).await?;

    let updated = state
        .incidents
        .acknowledge(&id, &caller.user_id, req.note)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Resolve request body
#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    actions: Vec<String>,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    let incident = state.incidents.get(&id).await?;
    authorize_device(&state, &caller, &incident.device_id).await?;

    let updated = state
        .incidents
        .resolve(&id, &caller.user_id, req.note, req.actions)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Escalate request body
#[derive(Debug, Deserialize)]
struct EscalateRequest {
    target: String,
    reason: String,
    level: i64,
}

async fn escalate_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<EscalateRequest>,
) -> Result<impl IntoResponse> {
    let caller = caller_from_headers(&headers)?;
    let incident = state.incidents.get(&id).await?;
    authorize_device(&state, &caller, &incident.device_id).await?;

    let updated = state
        .incidents
        .escalate(&id, &req.target, &req.reason, req.level)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncidentQuery {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn parse_status(s: &str) -> Result<IncidentStatus> {
    match s {
        "active" => Ok(IncidentStatus::Active),
        "acknowledged" => Ok(IncidentStatus::Acknowledged),
        "resolved" => Ok(IncidentStatus::Resolved),
        "ignored" => Ok(IncidentStatus::Ignored),
        other => Err(Error::validation(
            format!("unknown status: {other}"),
            vec!["status".to_string()],
        )),
    }
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentQuery>,
) -> Result<impl IntoResponse> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let incidents = state
        .incidents
        .list(&IncidentFilter {
            device_id: query.device_id,
            status,
            limit: Some(query.limit.unwrap_or(100)),
        })
        .await;
    Ok(Json(ApiResponse::success(incidents)))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let incident = state.incidents.get(&id).await?;
    Ok(Json(ApiResponse::success(incident)))
}

async fn recent_telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let records = state
        .telemetry
        .store()
        .recent_for_device(&device_id, query.limit.unwrap_or(50))
        .await;
    Json(ApiResponse::success(records))
}
