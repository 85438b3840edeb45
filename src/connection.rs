//! Single tool server connection

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::protocol::{
    self, ConnectionStats, ProtocolCodec, DISCOVERY_METHOD, INITIALIZED_NOTIFICATION,
    INITIALIZE_METHOD, PING_METHOD, PROTOCOL_VERSION,
};
use crate::transport::{Transport, TransportConnector};
use crate::types::{
    ConnectionHealth, ConnectionId, ConnectionInfo, ConnectionStatus, Installation, InstallationId,
    ServerDescriptor, TransportKind,
};

/// Connection to a single tool server instance.
///
/// Owns its transport exclusively; the transport is terminated at most once,
/// through [`Connection::shutdown`].
pub struct Connection {
    id: ConnectionId,
    installation_id: InstallationId,
    server_id: String,
    owner: String,
    transport_kind: TransportKind,
    address: String,
    status: RwLock<ConnectionStatus>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    codec: Arc<ProtocolCodec>,
    stats: Arc<ConnectionStats>,
    probe_failures: AtomicU32,
    connected_at: DateTime<Utc>,
    started: Instant,
    disconnected_at: RwLock<Option<DateTime<Utc>>>,
}

impl Connection {
    /// Open the transport, run the handshake and discover operations.
    ///
    /// Discovery is bounded by `discovery_timeout`; running out of time
    /// leaves the operation list empty instead of failing the connect.
    pub async fn establish(
        connector: &dyn TransportConnector,
        server: &ServerDescriptor,
        installation: &Installation,
        discovery_timeout: Duration,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        info!(connection_id = %id, server_id = %server.id, "Connecting to tool server");

        let stats = Arc::new(ConnectionStats::default());
        let codec = Arc::new(ProtocolCodec::new(stats.clone()));

        let transport = connector
            .open(server, installation, codec.clone())
            .await
            .map_err(|e| match e {
                LifecycleError::UnsupportedTransport(_) | LifecycleError::ConnectionError(_) => e,
                other => LifecycleError::ConnectionError(other.to_string()),
            })?;

        if !transport.is_alive() {
            let _ = transport.close().await;
            return Err(LifecycleError::ConnectionError(
                "Process exited during startup".into(),
            ));
        }

        let connection = Self {
            id,
            installation_id: installation.id,
            server_id: server.id.clone(),
            owner: installation.owner.clone(),
            transport_kind: server.transport,
            address: transport.address(),
            status: RwLock::new(ConnectionStatus::Connecting),
            transport: Mutex::new(Some(transport)),
            codec,
            stats,
            probe_failures: AtomicU32::new(0),
            connected_at: Utc::now(),
            started: Instant::now(),
            disconnected_at: RwLock::new(None),
        };
        *connection.status.write() = ConnectionStatus::Connected;

        let deadline = Instant::now() + discovery_timeout;
        let started = match connection.handshake(deadline).await {
            Ok(()) => connection.discover(deadline).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started.and_then(|()| connection.ensure_alive()) {
            connection.abort().await;
            return Err(e);
        }

        info!(
            connection_id = %id,
            server_id = %server.id,
            operations = connection.stats.operation_count(),
            "Tool server connected"
        );
        Ok(connection)
    }

    /// Timeouts and error responses are tolerated; a closed transport is not.
    async fn handshake(&self, deadline: Instant) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.request(INITIALIZE_METHOD, params, remaining).await {
            Ok(_) => {
                if let Err(e) = self.notify(INITIALIZED_NOTIFICATION, serde_json::json!({})).await {
                    debug!(connection_id = %self.id, error = %e, "Initialized notification failed");
                }
                Ok(())
            }
            Err(e @ LifecycleError::ConnectionError(_)) => Err(e),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Handshake failed, continuing");
                Ok(())
            }
        }
    }

    async fn discover(&self, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.request(DISCOVERY_METHOD, serde_json::json!({}), remaining).await {
            Ok(result) => {
                debug!(
                    connection_id = %self.id,
                    operations = protocol::operation_names(&result).len(),
                    "Discovered operations"
                );
                Ok(())
            }
            Err(e @ LifecycleError::ConnectionError(_)) => Err(e),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Discovery failed, no operations");
                Ok(())
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LifecycleError::ConnectionError(
                "Process exited during startup".into(),
            ))
        }
    }

    /// Tear down a connection that never finished starting
    async fn abort(&self) {
        *self.status.write() = ConnectionStatus::Error;
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(connection_id = %self.id, error = %e, "Transport close failed");
            }
        }
        self.codec.close_pending();
        warn!(connection_id = %self.id, server_id = %self.server_id, "Tool server exited during startup");
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let transport = self.transport()?;
        let (id, line, rx) = self.codec.prepare(method, params)?;

        if let Err(e) = transport.send(line).await {
            self.codec.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(LifecycleError::ConnectionError(
                "Transport closed before response".into(),
            )),
            Err(_) => {
                self.codec.forget(id);
                Err(LifecycleError::Timeout(format!("{} after {:?}", method, timeout)))
            }
        }
    }

    /// Send a notification (no response)
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let transport = self.transport()?;
        transport
            .send(protocol::encode_notification(method, params)?)
            .await
    }

    /// Probe the server, returning the round-trip time
    pub async fn probe(&self, timeout: Duration) -> Result<Duration> {
        if !self.is_connected() {
            let mut status = self.status.write();
            if *status == ConnectionStatus::Connected {
                // The process went away without a disconnect.
                *status = ConnectionStatus::Error;
            }
            drop(status);
            self.stats.record_failure();
            return Err(LifecycleError::HealthCheckFailure("not connected".into()));
        }
        let start = Instant::now();
        match self.request(PING_METHOD, serde_json::json!({}), timeout).await {
            Ok(_) => Ok(start.elapsed()),
            // Error responses were already counted by the codec.
            Err(e @ LifecycleError::RpcError { .. }) => {
                Err(LifecycleError::HealthCheckFailure(e.to_string()))
            }
            Err(e) => {
                self.stats.record_failure();
                Err(LifecycleError::HealthCheckFailure(e.to_string()))
            }
        }
    }

    /// Count a failed probe, returning the consecutive total
    pub fn record_probe_failure(&self) -> u32 {
        self.probe_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// A successful probe clears the consecutive failure streak
    pub fn reset_probe_failures(&self) {
        self.probe_failures.store(0, Ordering::SeqCst);
    }

    pub fn probe_failures(&self) -> u32 {
        self.probe_failures.load(Ordering::SeqCst)
    }

    /// Terminate the transport. Returns false when it was already terminated.
    pub async fn shutdown(&self) -> bool {
        let transport = self.transport.lock().take();
        let Some(transport) = transport else {
            return false;
        };

        *self.status.write() = ConnectionStatus::Disconnected;
        *self.disconnected_at.write() = Some(Utc::now());

        if let Err(e) = transport.close().await {
            warn!(connection_id = %self.id, error = %e, "Transport close failed");
        }
        self.codec.close_pending();

        info!(connection_id = %self.id, server_id = %self.server_id, "Tool server connection shutdown");
        true
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| LifecycleError::ConnectionError("Not connected".into()))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn installation_id(&self) -> InstallationId {
        self.installation_id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Check if connected and the transport is still alive
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
            && self
                .transport
                .lock()
                .as_ref()
                .map(|t| t.is_alive())
                .unwrap_or(false)
    }

    pub fn operations(&self) -> Vec<String> {
        self.stats.operations()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Health figures, with the latency of a probe that just ran (if any)
    pub fn health(&self, latency: Option<Duration>) -> ConnectionHealth {
        ConnectionHealth {
            status: self.status(),
            latency_ms: latency.map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX)),
            success_count: self.stats.success_count(),
            error_count: self.stats.failure_count(),
            uptime_ms: u64::try_from(self.uptime().as_millis()).unwrap_or(u64::MAX),
            operation_count: self.stats.operation_count(),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            installation_id: self.installation_id,
            server_id: self.server_id.clone(),
            owner: self.owner.clone(),
            transport: self.transport_kind,
            address: self.address.clone(),
            status: self.status(),
            success_count: self.stats.success_count(),
            error_count: self.stats.failure_count(),
            last_ping: self.stats.last_ping(),
            operations: self.stats.operations(),
            connected_at: self.connected_at,
            disconnected_at: *self.disconnected_at.read(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("owner", &self.owner)
            .field("status", &self.status())
            .finish()
    }
}
