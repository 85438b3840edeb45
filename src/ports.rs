//! Contracts for the collaborators this core consumes: the server catalog,
//! the installation repository and the event bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::Result;
use crate::events::LifecycleEvent;
use crate::types::{HealthStatus, Installation, InstallationId, InstallationStatus, ServerDescriptor};

/// Result type for repository operations.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Errors returned by installation repository implementations.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// An active installation already exists for the owner/server pair.
    #[error("active installation already exists for {owner}/{server_id}")]
    Conflict { owner: String, server_id: String },

    /// The installation was not found.
    #[error("installation not found: {0}")]
    NotFound(InstallationId),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl RepositoryError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}

/// Source of server metadata.
#[async_trait]
pub trait ServerCatalog: Send + Sync {
    /// Looks up a server.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`](crate::LifecycleError::NotFound)
    /// when the server is unknown or inactive.
    async fn get_server(&self, server_id: &str) -> Result<ServerDescriptor>;

    /// Looks up a server whether or not it is still active, for tearing down
    /// what was installed from it.
    async fn lookup_server(&self, server_id: &str) -> Result<ServerDescriptor>;
}

/// Installation persistence contract.
#[async_trait]
pub trait InstallationRepository: Send + Sync {
    /// Stores a new installation.
    ///
    /// Implementations must reject the insert with [`RepositoryError::Conflict`]
    /// when an active installation (pending, installing or installed) exists
    /// for the same owner and server, atomically with the insert.
    async fn create(&self, installation: &Installation) -> RepositoryResult<()>;

    /// Finds an installation by id.
    async fn find_by_id(&self, id: InstallationId) -> RepositoryResult<Option<Installation>>;

    /// Most recently created installation for the owner/server pair.
    async fn find_latest(&self, owner: &str, server_id: &str) -> RepositoryResult<Option<Installation>>;

    /// All installations of an owner, oldest first.
    async fn list_by_owner(&self, owner: &str) -> RepositoryResult<Vec<Installation>>;

    /// Transitions an installation, recording the error when given.
    async fn update_status(
        &self,
        id: InstallationId,
        status: InstallationStatus,
        error: Option<String>,
    ) -> RepositoryResult<()>;

    /// Appends one log line.
    async fn append_log(&self, id: InstallationId, line: String) -> RepositoryResult<()>;

    /// Records the latest observed health.
    async fn update_health(
        &self,
        id: InstallationId,
        health: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> RepositoryResult<()>;
}

/// Fire-and-forget event sink.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event. Delivery failures stay inside the publisher.
    fn publish(&self, event: LifecycleEvent);
}
