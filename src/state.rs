//! Application state
//!
//! Holds all shared components and state

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::alert_engine::{AlertEngine, CooldownConfig};
use crate::command::CommandDispatcher;
use crate::incident::IncidentService;
use crate::notification::{NotificationFanout, PushSender};
use crate::registry::DeviceRegistry;
use crate::telemetry::presence::PresenceTracker;
use crate::telemetry::store::TelemetryStore;
use crate::telemetry::TelemetryIngestor;
use crate::transport::{CommandTransport, TransportConfig, TransportRouter};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// MQTT broker host
    pub broker_host: String,
    /// MQTT broker port
    pub broker_port: u16,
    /// MQTT client id
    pub client_id: String,
    /// Topic root for device topics (`{root}/{deviceId}/...`)
    pub topic_root: String,
    /// Broker connect handshake bound (seconds)
    pub connect_timeout_secs: u64,
    /// Reconnect attempts before the transport gives up
    pub max_reconnect_attempts: u32,
    /// Inbound message queue capacity
    pub inbound_queue_capacity: usize,
    /// Cooldown windows per alert type (seconds)
    pub cooldown_low_battery_secs: i64,
    pub cooldown_obstacle_secs: i64,
    pub cooldown_fall_secs: i64,
    pub cooldown_gps_loss_secs: i64,
    /// Telemetry retention window (hours) and ring capacity
    pub telemetry_retention_hours: i64,
    pub telemetry_capacity: usize,
    /// Resolved-incident retention window (days)
    pub incident_retention_days: i64,
    /// Command dispatch log capacity
    pub command_log_capacity: usize,
    /// Push gateway URL; unset means delivery is logged and skipped
    pub push_gateway_url: Option<String>,
    /// Store pruning cadence (seconds)
    pub prune_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            broker_host: std::env::var("BROKER_HOST").unwrap_or_else(|_| "localhost".to_string()),
            broker_port: std::env::var("BROKER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            client_id: std::env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "stickguard-server".to_string()),
            topic_root: std::env::var("TOPIC_ROOT").unwrap_or_else(|_| "stick".to_string()),
            connect_timeout_secs: env_parse("CONNECT_TIMEOUT_SECS", 30),
            max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 10),
            inbound_queue_capacity: env_parse("INBOUND_QUEUE_CAPACITY", 1024),
            cooldown_low_battery_secs: env_parse("COOLDOWN_LOW_BATTERY_SECS", 3600),
            cooldown_obstacle_secs: env_parse("COOLDOWN_OBSTACLE_SECS", 5),
            cooldown_fall_secs: env_parse("COOLDOWN_FALL_SECS", 60),
            cooldown_gps_loss_secs: env_parse("COOLDOWN_GPS_LOSS_SECS", 600),
            telemetry_retention_hours: env_parse("TELEMETRY_RETENTION_HOURS", 24),
            telemetry_capacity: env_parse("TELEMETRY_CAPACITY", 10_000),
            incident_retention_days: env_parse("INCIDENT_RETENTION_DAYS", 30),
            command_log_capacity: env_parse("COMMAND_LOG_CAPACITY", 2000),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            prune_interval_secs: env_parse("PRUNE_INTERVAL_SECS", 300),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            broker_host: self.broker_host.clone(),
            broker_port: self.broker_port,
            client_id: self.client_id.clone(),
            connect_timeout: StdDuration::from_secs(self.connect_timeout_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: StdDuration::from_secs(1),
            inbound_queue_capacity: self.inbound_queue_capacity,
        }
    }

    pub fn cooldown_config(&self) -> CooldownConfig {
        CooldownConfig {
            low_battery: chrono::Duration::seconds(self.cooldown_low_battery_secs),
            obstacle: chrono::Duration::seconds(self.cooldown_obstacle_secs),
            fall: chrono::Duration::seconds(self.cooldown_fall_secs),
            gps_loss: chrono::Duration::seconds(self.cooldown_gps_loss_secs),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// TransportRouter (broker connection, dispatch loop)
    pub router: Arc<TransportRouter>,
    /// Device-ownership registry adapter
    pub registry: Arc<dyn DeviceRegistry>,
    /// TelemetryIngestor
    pub telemetry: Arc<TelemetryIngestor>,
    /// PresenceTracker (online/offline transitions)
    pub presence: Arc<PresenceTracker>,
    /// IncidentService (lifecycle state machine)
    pub incidents: Arc<IncidentService>,
    /// CommandDispatcher
    pub commands: Arc<CommandDispatcher>,
    /// Process start time
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire all components.
    ///
    /// `command_transport` is usually the router itself; tests inject a
    /// double so command dispatch is exercised without a broker.
    pub fn build(
        config: AppConfig,
        registry: Arc<dyn DeviceRegistry>,
        push_sender: Arc<dyn PushSender>,
        router: Arc<TransportRouter>,
        command_transport: Arc<dyn CommandTransport>,
    ) -> Self {
        let fanout = Arc::new(NotificationFanout::new(push_sender));
        let incidents = Arc::new(IncidentService::new(
            Arc::clone(&registry),
            fanout,
            chrono::Duration::days(config.incident_retention_days),
        ));
        let alert_engine = Arc::new(AlertEngine::new(
            config.cooldown_config(),
            Arc::clone(&incidents),
        ));
        let store = Arc::new(TelemetryStore::new(
            config.telemetry_capacity,
            chrono::Duration::hours(config.telemetry_retention_hours),
        ));
        let presence = Arc::new(PresenceTracker::new());
        let telemetry = Arc::new(TelemetryIngestor::new(
            store,
            Arc::clone(&registry),
            alert_engine,
            Arc::clone(&presence),
            Arc::clone(&incidents),
        ));
        let commands = Arc::new(CommandDispatcher::new(
            command_transport,
            Arc::clone(&incidents),
            config.topic_root.clone(),
            config.command_log_capacity,
        ));

        Self {
            config,
            router,
            registry,
            telemetry,
            presence,
            incidents,
            commands,
            started_at: Utc::now(),
        }
    }
}
