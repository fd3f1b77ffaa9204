//! StickGuard Server
//!
//! Main entry point for the device event processing and alerting server.

use std::sync::Arc;
use std::time::Duration;

use stickguard::command::CommandResponseHandler;
use stickguard::incident::SosMessageHandler;
use stickguard::notification::{HttpPushSender, LogPushSender, PushSender};
use stickguard::registry::{DeviceRegistry, InMemoryRegistry};
use stickguard::telemetry::{StatusMessageHandler, TelemetryMessageHandler};
use stickguard::transport::{CommandTransport, TransportRouter};
use stickguard::web_api;
use stickguard::{AppConfig, AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> stickguard::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stickguard=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        broker = %config.broker_host,
        topic_root = %config.topic_root,
        "Starting StickGuard server"
    );

    let registry = Arc::new(InMemoryRegistry::new());
    if let Ok(admin) = std::env::var("ADMIN_USER") {
        registry.grant_admin(&admin).await;
        tracing::info!(user = %admin, "Admin user granted");
    }

    let push_sender: Arc<dyn PushSender> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushSender::new(url.clone())),
        None => {
            tracing::warn!("PUSH_GATEWAY_URL not set, notifications will be logged only");
            Arc::new(LogPushSender)
        }
    };

    let router = TransportRouter::new(config.transport_config());
    let state = AppState::build(
        config.clone(),
        Arc::clone(&registry) as Arc<dyn DeviceRegistry>,
        push_sender,
        Arc::clone(&router),
        Arc::clone(&router) as Arc<dyn CommandTransport>,
    );

    // Broker connectivity is not fatal: the HTTP surface stays up and
    // command dispatch reports 503 until the transport recovers.
    match router.connect().await {
        Ok(()) => {
            subscribe_handlers(&state).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Broker connect failed, continuing without transport");
        }
    }

    spawn_prune_loop(state.clone());

    let app = web_api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the device-to-core topics. Registration order is dispatch
/// priority; every pattern here is disjoint so order only matters if a
/// later catch-all is ever added.
async fn subscribe_handlers(state: &AppState) {
    let root = &state.config.topic_root;

    let subscriptions: [(String, Arc<dyn stickguard::transport::MessageHandler>); 4] = [
        (
            format!("{root}/+/telemetry"),
            Arc::new(TelemetryMessageHandler::new(Arc::clone(&state.telemetry))),
        ),
        (
            format!("{root}/+/sos"),
            Arc::new(SosMessageHandler::new(Arc::clone(&state.incidents))),
        ),
        (
            format!("{root}/+/status"),
            Arc::new(StatusMessageHandler::new(
                Arc::clone(&state.presence),
                Arc::clone(&state.incidents),
            )),
        ),
        (
            format!("{root}/+/response"),
            Arc::new(CommandResponseHandler::new(
                Arc::clone(&state.commands),
                Arc::clone(&state.incidents),
                root,
            )),
        ),
    ];

    for (pattern, handler) in subscriptions {
        if let Err(e) = state.router.subscribe(&pattern, handler).await {
            tracing::error!(pattern = %pattern, error = %e, "Subscription failed");
        }
    }
}

/// Periodically expire telemetry and resolved incidents past retention
fn spawn_prune_loop(state: AppState) {
    let interval = Duration::from_secs(state.config.prune_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate, skip it
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();
            let telemetry = state.telemetry.store().prune(now).await;
            let incidents = state.incidents.prune(now).await;
            if telemetry > 0 || incidents > 0 {
                tracing::debug!(telemetry, incidents, "Retention prune");
            }
        }
    });
}
