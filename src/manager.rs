//! Tool server manager

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::executor::{ExecutorRegistry, MethodExecutor};
use crate::health::{HealthConfig, HealthMonitor, SweepSummary};
use crate::orchestrator::InstallationOrchestrator;
use crate::pool::{ConnectOptions, ConnectionPoolManager};
use crate::ports::{EventPublisher, InstallationRepository, ServerCatalog};
use crate::transport::{ProcessConnector, TransportConnector};
use crate::types::{
    ConnectionHealth, ConnectionId, ConnectionInfo, DisconnectReason, InstallMethod, InstallRequest,
    Installation, PoolStatus,
};

/// Builder for [`ToolServerManager`]
pub struct ToolServerManagerBuilder {
    config: ManagerConfig,
    catalog: Arc<dyn ServerCatalog>,
    repository: Arc<dyn InstallationRepository>,
    events: Arc<dyn EventPublisher>,
    connector: Arc<dyn TransportConnector>,
    executors: Option<ExecutorRegistry>,
    overrides: Vec<(InstallMethod, Arc<dyn MethodExecutor>)>,
}

impl ToolServerManagerBuilder {
    /// Replace the configuration
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the transport connector
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the whole executor registry
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Replace the executor for one method
    pub fn executor(mut self, method: InstallMethod, executor: Arc<dyn MethodExecutor>) -> Self {
        self.overrides.push((method, executor));
        self
    }

    pub fn build(self) -> ToolServerManager {
        let mut executors = self
            .executors
            .unwrap_or_else(|| ExecutorRegistry::with_defaults(&self.config.commands));
        for (method, executor) in self.overrides {
            executors.register(method, executor);
        }

        let pool = Arc::new(ConnectionPoolManager::new(
            self.config.clone(),
            self.catalog.clone(),
            self.repository.clone(),
            self.events.clone(),
            self.connector,
        ));
        let orchestrator = InstallationOrchestrator::new(
            self.catalog,
            self.repository.clone(),
            self.events,
            Arc::new(executors),
            pool.clone(),
        );
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            self.repository,
            HealthConfig::from(&self.config),
        ));

        ToolServerManager {
            orchestrator,
            pool,
            monitor,
            monitor_task: Mutex::new(None),
        }
    }
}

/// Installs tool servers and manages connections to them
pub struct ToolServerManager {
    orchestrator: InstallationOrchestrator,
    pool: Arc<ConnectionPoolManager>,
    monitor: Arc<HealthMonitor>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ToolServerManager {
    /// Start building a manager around the given collaborators
    pub fn builder(
        catalog: Arc<dyn ServerCatalog>,
        repository: Arc<dyn InstallationRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> ToolServerManagerBuilder {
        ToolServerManagerBuilder {
            config: ManagerConfig::default(),
            catalog,
            repository,
            events,
            connector: Arc::new(ProcessConnector),
            executors: None,
            overrides: Vec::new(),
        }
    }

    /// Manager with default config, executors and connector
    pub fn new(
        catalog: Arc<dyn ServerCatalog>,
        repository: Arc<dyn InstallationRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::builder(catalog, repository, events).build()
    }

    /// Start the periodic health monitor. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.monitor_task.lock();
        if task.is_none() {
            *task = Some(self.monitor.clone().spawn());
        }
    }

    /// Stop the health monitor and disconnect every connection
    pub async fn shutdown(&self) {
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let closed = self.pool.shutdown().await;
        info!(closed, "Tool server manager shut down");
    }

    /// Request an installation; it runs in the background
    pub async fn install(&self, request: InstallRequest) -> Result<Installation> {
        self.orchestrator.install(request).await
    }

    /// Install and wait for the final record
    pub async fn install_and_wait(&self, request: InstallRequest) -> Result<Installation> {
        self.orchestrator.install_and_wait(request).await
    }

    pub async fn list_installations(&self, owner: &str) -> Result<Vec<Installation>> {
        self.orchestrator.list_installations(owner).await
    }

    pub async fn uninstall(&self, owner: &str, server_id: &str) -> Result<()> {
        self.orchestrator.uninstall(owner, server_id).await
    }

    /// Get the live connection for the pair or open one
    pub async fn connect(&self, owner: &str, server_id: &str, options: ConnectOptions) -> Result<Arc<Connection>> {
        self.pool.acquire(owner, server_id, options).await
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<()> {
        self.pool.disconnect(connection_id, DisconnectReason::Requested).await
    }

    /// Probe a connection and report its figures
    pub async fn health(&self, connection_id: ConnectionId) -> Result<ConnectionHealth> {
        self.pool.health(connection_id).await
    }

    /// Run one health sweep now
    pub async fn check_health(&self) -> SweepSummary {
        self.monitor.sweep().await
    }

    pub fn get_connection(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.pool.get(connection_id)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.pool.list()
    }

    pub fn pool_status(&self, server_id: &str) -> Option<PoolStatus> {
        self.pool.pool_status(server_id)
    }
}

impl Drop for ToolServerManager {
    fn drop(&mut self) {
        if let Some(task) = self.monitor_task.get_mut().take() {
            task.abort();
        }
    }
}
