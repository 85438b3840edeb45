//! Installation state machine.
//!
//! `pending → installing → {installed, failed}` and `installed → uninstalled`.
//! The external action runs on its own task; a caller that stops waiting does
//! not cancel it.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LifecycleError, Result};
use crate::events::LifecycleEvent;
use crate::executor::{log_channel, ExecutorRegistry};
use crate::pool::ConnectionPoolManager;
use crate::ports::{EventPublisher, InstallationRepository, RepositoryError, ServerCatalog};
use crate::types::{
    DisconnectReason, InstallRequest, Installation, InstallationId, InstallationStatus, ServerDescriptor,
};

/// Drives installations through their lifecycle
#[derive(Clone)]
pub struct InstallationOrchestrator {
    catalog: Arc<dyn ServerCatalog>,
    repository: Arc<dyn InstallationRepository>,
    events: Arc<dyn EventPublisher>,
    executors: Arc<ExecutorRegistry>,
    pool: Arc<ConnectionPoolManager>,
}

impl InstallationOrchestrator {
    pub fn new(
        catalog: Arc<dyn ServerCatalog>,
        repository: Arc<dyn InstallationRepository>,
        events: Arc<dyn EventPublisher>,
        executors: Arc<ExecutorRegistry>,
        pool: Arc<ConnectionPoolManager>,
    ) -> Self {
        Self {
            catalog,
            repository,
            events,
            executors,
            pool,
        }
    }

    /// Record a pending installation and start executing it in the background.
    ///
    /// Returns the pending record. Unknown servers and duplicate installations
    /// are rejected here, before anything runs.
    pub async fn install(&self, request: InstallRequest) -> Result<Installation> {
        let (installation, _) = self.start(request).await?;
        Ok(installation)
    }

    /// Like [`install`](Self::install) but waits for the terminal status and
    /// returns the final record
    pub async fn install_and_wait(&self, request: InstallRequest) -> Result<Installation> {
        let (installation, handle) = self.start(request).await?;
        if let Err(e) = handle.await {
            error!(installation_id = %installation.id, error = %e, "Installation supervisor failed");
        }
        self.find(installation.id).await
    }

    async fn start(&self, request: InstallRequest) -> Result<(Installation, JoinHandle<()>)> {
        request.validate()?;
        let server = self.catalog.get_server(&request.server_id).await?;

        if let Some(existing) = self
            .repository
            .find_latest(&request.owner, &request.server_id)
            .await?
        {
            if existing.status.is_active() {
                return Err(duplicate(&request));
            }
        }

        let installation = Installation::pending(&request, &server);
        self.repository
            .create(&installation)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict { .. } => duplicate(&request),
                other => other.into(),
            })?;
        self.publish_status(&installation, InstallationStatus::Pending, None);
        info!(
            installation_id = %installation.id,
            server_id = %installation.server_id,
            method = %installation.method,
            "Installation requested"
        );

        let this = self.clone();
        let record = installation.clone();
        let handle = tokio::spawn(async move {
            let run = tokio::spawn({
                let this = this.clone();
                let record = record.clone();
                async move { this.execute(record, server).await }
            });
            if let Err(e) = run.await {
                this.recover(&record, e).await;
            }
        });
        Ok((installation, handle))
    }

    /// Fail an installation whose task died before reaching a terminal status
    async fn recover(&self, installation: &Installation, e: JoinError) {
        error!(installation_id = %installation.id, error = %e, "Installation supervisor failed");
        match self.repository.find_by_id(installation.id).await {
            Ok(Some(current))
                if matches!(
                    current.status,
                    InstallationStatus::Pending | InstallationStatus::Installing
                ) =>
            {
                let message = format!("installation task panicked: {e}");
                if let Err(e) = self
                    .transition(installation, InstallationStatus::Failed, Some(message))
                    .await
                {
                    error!(installation_id = %installation.id, error = %e, "Failed to mark installation as failed");
                }
            }
            Ok(_) => {}
            Err(e) => error!(installation_id = %installation.id, error = %e, "Failed to load installation"),
        }
    }

    #[instrument(skip_all, fields(installation_id = %installation.id, server_id = %installation.server_id))]
    async fn execute(&self, installation: Installation, server: ServerDescriptor) {
        if let Err(e) = self.transition(&installation, InstallationStatus::Installing, None).await {
            error!(error = %e, "Failed to mark installation as installing");
            return;
        }

        let outcome = match self.executors.get(installation.method) {
            Ok(executor) => {
                let (sink, rx) = log_channel();
                let run = executor.install(&installation, &server, sink);
                let (outcome, ()) = tokio::join!(run, self.drain_logs(installation.id, rx));
                outcome
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.transition(&installation, InstallationStatus::Installed, None).await {
                    error!(error = %e, "Failed to mark installation as installed");
                    return;
                }
                info!("Installation complete");
                if installation.config.auto_start {
                    self.smoke_test(&installation).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Installation failed");
                let message = e.to_string();
                if let Err(e) = self
                    .transition(&installation, InstallationStatus::Failed, Some(message))
                    .await
                {
                    error!(error = %e, "Failed to mark installation as failed");
                }
            }
        }
    }

    /// Append log lines as they arrive until the executor drops its sink
    async fn drain_logs(&self, id: InstallationId, mut rx: tokio::sync::mpsc::UnboundedReceiver<String>) {
        while let Some(line) = rx.recv().await {
            if let Err(e) = self.repository.append_log(id, line).await {
                warn!(installation_id = %id, error = %e, "Failed to append log line");
            }
        }
    }

    /// Open and close a private connection. Failure is logged only.
    async fn smoke_test(&self, installation: &Installation) {
        match self
            .pool
            .smoke_test(&installation.owner, &installation.server_id)
            .await
        {
            Ok(operations) => debug!(operations = operations.len(), "Smoke test connected"),
            Err(e) => warn!(error = %e, "Post-install smoke test failed"),
        }
    }

    /// Disconnect the pair's connections, undo the install and mark the
    /// record uninstalled
    #[instrument(skip(self))]
    pub async fn uninstall(&self, owner: &str, server_id: &str) -> Result<()> {
        let installation = self
            .repository
            .find_latest(owner, server_id)
            .await?
            .filter(|i| i.status != InstallationStatus::Uninstalled)
            .ok_or_else(|| LifecycleError::NotFound(format!("installation of {server_id} for {owner}")))?;

        if installation.status != InstallationStatus::Installed {
            return Err(LifecycleError::InvalidState(format!(
                "installation {} is {:?}, only installed servers can be uninstalled",
                installation.id, installation.status
            )));
        }

        let server = self.catalog.lookup_server(server_id).await?;
        let executor = self.executors.get(installation.method)?;

        let closed = self
            .pool
            .disconnect_all_for(owner, server_id, DisconnectReason::Uninstall)
            .await;
        debug!(closed, "Closed connections before uninstall");

        let (sink, rx) = log_channel();
        let (outcome, ()) = tokio::join!(
            executor.uninstall(&installation, &server, sink),
            self.drain_logs(installation.id, rx)
        );
        outcome?;

        self.transition(&installation, InstallationStatus::Uninstalled, None)
            .await?;
        self.events.publish(LifecycleEvent::ServerUninstalled {
            installation_id: installation.id,
            server_id: server_id.to_string(),
            owner: owner.to_string(),
        });
        info!(installation_id = %installation.id, "Server uninstalled");
        Ok(())
    }

    pub async fn list_installations(&self, owner: &str) -> Result<Vec<Installation>> {
        Ok(self.repository.list_by_owner(owner).await?)
    }

    pub async fn find(&self, id: InstallationId) -> Result<Installation> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("installation {id}")))
    }

    async fn transition(
        &self,
        installation: &Installation,
        status: InstallationStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.repository
            .update_status(installation.id, status, error.clone())
            .await?;
        self.publish_status(installation, status, error);
        Ok(())
    }

    fn publish_status(&self, installation: &Installation, status: InstallationStatus, error: Option<String>) {
        self.events.publish(LifecycleEvent::InstallationStatusChanged {
            installation_id: installation.id,
            server_id: installation.server_id.clone(),
            owner: installation.owner.clone(),
            status,
            error,
            at: Utc::now(),
        });
    }
}

fn duplicate(request: &InstallRequest) -> LifecycleError {
    LifecycleError::DuplicateInstallation {
        owner: request.owner.clone(),
        server_id: request.server_id.clone(),
    }
}

