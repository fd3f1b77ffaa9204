//! Telemetry store (ring buffer)
//!
//! Append-only in-memory store bounded by capacity and a retention window.
//! There is no deduplication: every accepted message is a new record.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tokio::sync::RwLock;

use super::types::TelemetryRecord;

struct TelemetryRing {
    records: VecDeque<TelemetryRecord>,
    capacity: usize,
}

impl TelemetryRing {
    fn push(&mut self, record: TelemetryRecord) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

/// TelemetryStore instance
pub struct TelemetryStore {
    ring: RwLock<TelemetryRing>,
    retention: Duration,
}

impl TelemetryStore {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            ring: RwLock::new(TelemetryRing {
                records: VecDeque::with_capacity(capacity),
                capacity,
            }),
            retention,
        }
    }

    pub async fn append(&self, record: TelemetryRecord) {
        let mut ring = self.ring.write().await;
        ring.push(record);
    }

    /// Most recent record for a device, if retained
    pub async fn latest_for_device(&self, device_id: &str) -> Option<TelemetryRecord> {
        let ring = self.ring.read().await;
        ring.records
            .iter()
            .rev()
            .find(|r| r.device_id == device_id)
            .cloned()
    }

    /// Most recent record for a device that carried a GPS fix
    pub async fn latest_with_fix(&self, device_id: &str) -> Option<TelemetryRecord> {
        let ring = self.ring.read().await;
        ring.records
            .iter()
            .rev()
            .find(|r| r.device_id == device_id && r.has_fix())
            .cloned()
    }

    /// Recent records for a device, newest first
    pub async fn recent_for_device(&self, device_id: &str, count: usize) -> Vec<TelemetryRecord> {
        let ring = self.ring.read().await;
        ring.records
            .iter()
            .rev()
            .filter(|r| r.device_id == device_id)
            .take(count)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.ring.read().await.records.len()
    }

    /// Drop records older than the retention window; returns expired count
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut ring = self.ring.write().await;
        let before = ring.records.len();
        ring.records.retain(|r| r.timestamp >= cutoff);
        before - ring.records.len()
    }
}
