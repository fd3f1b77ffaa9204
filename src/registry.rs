//! Device registry adapter
//!
//! The device-ownership registry is an external collaborator; the core only
//! reads owner/token lookups and writes last-seen timestamps through this
//! narrow interface. It never creates or deletes registrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;

/// Registration data the core is allowed to see
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistration {
    pub owner_ids: Vec<String>,
    pub push_tokens: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Narrow read-mostly interface to the external registry
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Owning user ids for a device (empty when unregistered)
    async fn owners(&self, device_id: &str) -> Result<Vec<String>>;

    /// Push tokens registered for a device's owners
    async fn push_tokens(&self, device_id: &str) -> Result<Vec<String>>;

    /// Whether the user holds the admin role
    async fn is_admin(&self, user_id: &str) -> Result<bool>;

    /// Whether the user owns the device or is an admin
    async fn is_authorized(&self, user_id: &str, device_id: &str) -> Result<bool> {
        if self.is_admin(user_id).await? {
            return Ok(true);
        }
        Ok(self.owners(device_id).await?.iter().any(|o| o == user_id))
    }

    /// Best-effort last-seen update; failures are the caller's to log
    async fn touch_last_seen(&self, device_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// In-memory registry used for wiring and tests
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<String, DeviceRegistration>>,
    admins: RwLock<Vec<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            admins: RwLock::new(Vec::new()),
        }
    }

    /// Seed a registration (test/bootstrap helper)
    pub async fn register(&self, device_id: &str, owners: Vec<String>, tokens: Vec<String>) {
        let mut devices = self.devices.write().await;
        devices.insert(
            device_id.to_string(),
            DeviceRegistration {
                owner_ids: owners,
                push_tokens: tokens,
                last_seen: None,
            },
        );
    }

    pub async fn grant_admin(&self, user_id: &str) {
        self.admins.write().await.push(user_id.to_string());
    }

    pub async fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .and_then(|d| d.last_seen)
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn owners(&self, device_id: &str) -> Result<Vec<String>> {
        Ok(self
            .devices
            .read()
            .await
            .get(device_id)
            .map(|d| d.owner_ids.clone())
            .unwrap_or_default())
    }

    async fn push_tokens(&self, device_id: &str) -> Result<Vec<String>> {
        Ok(self
            .devices
            .read()
            .await
            .get(device_id)
            .map(|d| d.push_tokens.clone())
            .unwrap_or_default())
    }

    async fn is_admin(&self, user_id: &str) -> Result<bool> {
        Ok(self.admins.read().await.iter().any(|a| a == user_id))
    }

    async fn touch_last_seen(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut devices = self.devices.write().await;
        devices.entry(device_id.to_string()).or_default().last_seen = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn owner_is_authorized_for_own_device() {
        let reg = InMemoryRegistry::new();
        reg.register("stick-001", vec!["user-1".into()], vec![]).await;
        assert!(reg.is_authorized("user-1", "stick-001").await.unwrap());
        assert!(!reg.is_authorized("user-2", "stick-001").await.unwrap());
    }

    #[tokio::test]
    async fn admin_is_authorized_for_any_device() {
        let reg = InMemoryRegistry::new();
        reg.grant_admin("admin-1").await;
        assert!(reg.is_authorized("admin-1", "stick-999").await.unwrap());
    }

    #[tokio::test]
    async fn touch_last_seen_updates_timestamp() {
        let reg = InMemoryRegistry::new();
        reg.register("stick-001", vec![], vec![]).await;
        let now = Utc::now();
        reg.touch_last_seen("stick-001", now).await.unwrap();
        assert_eq!(reg.last_seen("stick-001").await, Some(now));
    }
}
