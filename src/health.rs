//! Periodic health probing of live connections.
//!
//! Every sweep pings each connected server concurrently. A successful probe
//! clears the connection's failure streak and records the installation as
//! healthy (or degraded when slow); once the streak exceeds the configured
//! threshold the connection is force-disconnected with reason
//! [`DisconnectReason::HealthCheck`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::ports::InstallationRepository;
use crate::pool::ConnectionPoolManager;
use crate::types::{DisconnectReason, HealthStatus};

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Consecutive failures tolerated before eviction.
    pub failure_threshold: u32,
    /// Deadline for one probe.
    pub probe_timeout: Duration,
    /// Latency above which a server is degraded.
    pub degraded_latency: Duration,
}

impl From<&ManagerConfig> for HealthConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            interval: config.health_check_interval,
            failure_threshold: config.failure_threshold,
            probe_timeout: config.probe_timeout,
            degraded_latency: config.degraded_latency,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Connections probed.
    pub probed: usize,
    /// Probes answered in time.
    pub healthy: usize,
    /// Probes that failed.
    pub failed: usize,
    /// Connections force-disconnected.
    pub evicted: usize,
}

enum ProbeOutcome {
    Healthy,
    Failed,
    Evicted,
}

/// Health checker for live connections.
pub struct HealthMonitor {
    pool: Arc<ConnectionPoolManager>,
    repository: Arc<dyn InstallationRepository>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(
        pool: Arc<ConnectionPoolManager>,
        repository: Arc<dyn InstallationRepository>,
        config: HealthConfig,
    ) -> Self {
        Self {
            pool,
            repository,
            config,
        }
    }

    /// Run sweeps on a fixed interval until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            info!(interval_secs = self.config.interval.as_secs(), "Health monitor started");
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Probe every connected server once.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepSummary {
        let connections = self.pool.connected();
        let mut summary = SweepSummary {
            probed: connections.len(),
            ..SweepSummary::default()
        };

        let mut probes = JoinSet::new();
        for connection in connections {
            let pool = self.pool.clone();
            let repository = self.repository.clone();
            let config = self.config.clone();
            probes.spawn(async move { check_connection(&pool, repository.as_ref(), &config, connection).await });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(ProbeOutcome::Healthy) => summary.healthy += 1,
                Ok(ProbeOutcome::Failed) => summary.failed += 1,
                Ok(ProbeOutcome::Evicted) => {
                    summary.failed += 1;
                    summary.evicted += 1;
                }
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }

        debug!(
            probed = summary.probed,
            healthy = summary.healthy,
            failed = summary.failed,
            evicted = summary.evicted,
            "Health sweep complete"
        );
        summary
    }
}

async fn check_connection(
    pool: &ConnectionPoolManager,
    repository: &dyn InstallationRepository,
    config: &HealthConfig,
    connection: Arc<Connection>,
) -> ProbeOutcome {
    match connection.probe(config.probe_timeout).await {
        Ok(latency) => {
            connection.reset_probe_failures();
            let health = if latency > config.degraded_latency {
                warn!(
                    connection_id = %connection.id(),
                    latency_ms = latency.as_millis(),
                    "Probe latency exceeds threshold"
                );
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            record_health(repository, &connection, health).await;
            ProbeOutcome::Healthy
        }
        Err(e) => {
            let failures = connection.record_probe_failure();
            warn!(
                connection_id = %connection.id(),
                server_id = %connection.server_id(),
                failures,
                error = %e,
                "Health probe failed"
            );
            if failures <= config.failure_threshold {
                return ProbeOutcome::Failed;
            }

            record_health(repository, &connection, HealthStatus::Unhealthy).await;
            match pool.disconnect(connection.id(), DisconnectReason::HealthCheck).await {
                Ok(()) => {
                    warn!(connection_id = %connection.id(), "Connection evicted after repeated probe failures");
                    ProbeOutcome::Evicted
                }
                // Someone else already tore it down.
                Err(_) => ProbeOutcome::Failed,
            }
        }
    }
}

async fn record_health(repository: &dyn InstallationRepository, connection: &Connection, health: HealthStatus) {
    if let Err(e) = repository
        .update_health(connection.installation_id(), health, Utc::now())
        .await
    {
        debug!(connection_id = %connection.id(), error = %e, "Failed to record health");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_config_defaults() {
        let config = HealthConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.degraded_latency, Duration::from_millis(1000));
    }
}
