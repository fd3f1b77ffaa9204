//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation and caller identity
//! - Response formatting
//!
//! Authorization decisions come from the external identity collaborator;
//! its narrow interface here is the `x-user-id` / `x-role` headers plus
//! the device-ownership lookup on the registry.

mod routes;

pub use routes::create_router;

use axum::extract::{FromRequest, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::{Caller, HealthResponse};
use crate::state::AppState;
use crate::transport::ConnectionState;

/// JSON extractor whose rejection goes through [`Error`], so a malformed
/// or incomplete body gets the same 400 envelope as a failed range check
/// instead of axum's default 422 plain text.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct Json<T>(pub T);

impl<T: serde::Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> axum::response::Response {
        axum::Json(self.0).into_response()
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: (chrono::Utc::now() - state.started_at).num_seconds().max(0) as u64,
        broker_connected: state.router.state().await == ConnectionState::Connected,
    };
    Json(response)
}

/// System status endpoint
pub async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    let router = state.router.stats().await;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "transport": router,
        "incidents": state.incidents.count().await,
        "telemetryRecords": state.telemetry.store().count().await,
        "devicesOnline": state.presence.online_count().await,
    }))
}

/// Resolve the caller from the identity headers. Missing identity is a 403,
/// not a 401: authentication itself happens upstream.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Forbidden("missing caller identity".to_string()))?;
    let admin = headers
        .get("x-role")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("admin"))
        .unwrap_or(false);
    Ok(Caller {
        user_id: user_id.to_string(),
        admin,
    })
}

/// Device-scope authorization: admin or owner
pub async fn authorize_device(state: &AppState, caller: &Caller, device_id: &str) -> Result<()> {
    if caller.admin {
        return Ok(());
    }
    if state
        .registry
        .is_authorized(&caller.user_id, device_id)
        .await?
    {
        return Ok(());
    }
    Err(Error::Forbidden(format!(
        "user {} is not authorized for device {}",
        caller.user_id, device_id
    )))
}
