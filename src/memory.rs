//! In-memory adapters for the catalog, repository and event bus.
//!
//! Suitable for single-process hosts and tests. A persistent repository only
//! has to honour the same uniqueness rule on `create`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{LifecycleError, Result};
use crate::events::LifecycleEvent;
use crate::ports::{
    EventPublisher, InstallationRepository, RepositoryError, RepositoryResult, ServerCatalog,
};
use crate::types::{HealthStatus, Installation, InstallationId, InstallationStatus, ServerDescriptor};

/// Catalog backed by a map of descriptors
#[derive(Debug, Default)]
pub struct InMemoryServerCatalog {
    servers: RwLock<HashMap<String, ServerDescriptor>>,
}

impl InMemoryServerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a descriptor
    pub fn insert(&self, server: ServerDescriptor) {
        self.servers.write().insert(server.id.clone(), server);
    }

    /// Mark a server inactive
    pub fn deactivate(&self, server_id: &str) {
        if let Some(server) = self.servers.write().get_mut(server_id) {
            server.active = false;
        }
    }
}

#[async_trait]
impl ServerCatalog for InMemoryServerCatalog {
    async fn get_server(&self, server_id: &str) -> Result<ServerDescriptor> {
        self.servers
            .read()
            .get(server_id)
            .filter(|s| s.active)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(format!("server {server_id}")))
    }

    async fn lookup_server(&self, server_id: &str) -> Result<ServerDescriptor> {
        self.servers
            .read()
            .get(server_id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(format!("server {server_id}")))
    }
}

/// Installation repository held in memory
#[derive(Debug, Default)]
pub struct InMemoryInstallationRepository {
    // Insertion order doubles as creation order.
    records: RwLock<Vec<Installation>>,
}

impl InMemoryInstallationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        id: InstallationId,
        f: impl FnOnce(&mut Installation) -> T,
    ) -> RepositoryResult<T> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RepositoryError::NotFound(id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl InstallationRepository for InMemoryInstallationRepository {
    async fn create(&self, installation: &Installation) -> RepositoryResult<()> {
        let mut records = self.records.write();
        let conflict = records.iter().any(|r| {
            r.owner == installation.owner
                && r.server_id == installation.server_id
                && r.status.is_active()
        });
        if conflict {
            return Err(RepositoryError::Conflict {
                owner: installation.owner.clone(),
                server_id: installation.server_id.clone(),
            });
        }
        records.push(installation.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: InstallationId) -> RepositoryResult<Option<Installation>> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    async fn find_latest(&self, owner: &str, server_id: &str) -> RepositoryResult<Option<Installation>> {
        Ok(self
            .records
            .read()
            .iter()
            .rev()
            .find(|r| r.owner == owner && r.server_id == server_id)
            .cloned())
    }

    async fn list_by_owner(&self, owner: &str) -> RepositoryResult<Vec<Installation>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: InstallationId,
        status: InstallationStatus,
        error: Option<String>,
    ) -> RepositoryResult<()> {
        self.with_record(id, |record| {
            let now = Utc::now();
            record.status = status;
            if error.is_some() {
                record.error = error;
            }
            if status == InstallationStatus::Installed {
                record.installed_at = Some(now);
            }
            record.updated_at = now;
        })
    }

    async fn append_log(&self, id: InstallationId, line: String) -> RepositoryResult<()> {
        self.with_record(id, |record| {
            record.logs.push(line);
            record.updated_at = Utc::now();
        })
    }

    async fn update_health(
        &self,
        id: InstallationId,
        health: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.with_record(id, |record| {
            record.health = health;
            record.last_health_check = Some(checked_at);
        })
    }
}

/// Event bus over a tokio broadcast channel
#[derive(Debug)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for BroadcastEventBus {
    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is not an error for a fire-and-forget bus.
        if self.sender.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }
}
