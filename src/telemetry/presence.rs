//! Device presence tracker
//!
//! Tracks per-device online/offline state to detect transitions. Only
//! transitions produce events, so repeated heartbeats with the same state
//! never spam the incident log.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Device connectivity as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Never heard from
    Unknown,
    Online,
    Offline,
}

/// Presence transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    CameOnline,
    WentOffline,
}

/// Tracks device presence and detects transitions
pub struct PresenceTracker {
    states: RwLock<HashMap<String, PresenceState>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Update a device's presence, returning the transition if one occurred.
    ///
    /// The first observation of an online device is not a transition; the
    /// first observation of an offline device is (`WentOffline`).
    pub async fn update(&self, device_id: &str, online: bool) -> Option<PresenceEvent> {
        let mut states = self.states.write().await;
        let prev = states
            .get(device_id)
            .copied()
            .unwrap_or(PresenceState::Unknown);
        let next = if online {
            PresenceState::Online
        } else {
            PresenceState::Offline
        };
        states.insert(device_id.to_string(), next);

        match (prev, next) {
            (PresenceState::Online, PresenceState::Offline) => Some(PresenceEvent::WentOffline),
            (PresenceState::Offline, PresenceState::Online) => Some(PresenceEvent::CameOnline),
            (PresenceState::Unknown, PresenceState::Offline) => Some(PresenceEvent::WentOffline),
            _ => None,
        }
    }

    pub async fn state(&self, device_id: &str) -> PresenceState {
        self.states
            .read()
            .await
            .get(device_id)
            .copied()
            .unwrap_or(PresenceState::Unknown)
    }

    pub async fn online_count(&self) -> usize {
        self.states
            .read()
            .await
            .values()
            .filter(|s| **s == PresenceState::Online)
            .count()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
