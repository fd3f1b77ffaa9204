//! StickGuard Server Library
//!
//! Device event processing and alerting pipeline for smart-stick field
//! devices.
//!
//! ## Architecture (7 Components)
//!
//! 1. TransportRouter - broker connection, subscriptions, dispatch
//! 2. TelemetryIngestor - validation, persistence, presence
//! 3. AlertEngine - rule evaluation with cooldown suppression
//! 4. IncidentService - SOS/alert lifecycle state machine
//! 5. NotificationFanout - push delivery with partial-failure accounting
//! 6. CommandDispatcher - device command validation and publish
//! 7. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - External collaborators (identity, device registry, push gateway)
//!   sit behind narrow async traits
//! - Every component receives its dependencies explicitly; there are no
//!   process-wide singletons
//! - The stores are the only shared mutable state; mutation happens in
//!   per-entity critical sections

pub mod alert_engine;
pub mod command;
pub mod error;
pub mod incident;
pub mod models;
pub mod notification;
pub mod registry;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod web_api;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
