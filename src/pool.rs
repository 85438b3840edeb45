//! Per-server connection pools and the connection registry

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::error::{LifecycleError, Result};
use crate::events::LifecycleEvent;
use crate::ports::{EventPublisher, InstallationRepository, ServerCatalog};
use crate::transport::TransportConnector;
use crate::types::{
    ConnectionId, ConnectionInfo, ConnectionStatus, DisconnectReason, HealthStatus, Installation,
    InstallationStatus, PoolStatus, ServerDescriptor,
};

/// Options for acquiring a connection
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// How long to wait for a pool slot; the configured default when absent
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

struct Waiter {
    requester: String,
    grant: oneshot::Sender<()>,
    deadline: Instant,
}

/// Slot accounting for one server.
///
/// `active.len() + reserved <= max_connections` always holds; `reserved`
/// counts slots handed to connections that are still being established.
pub struct ConnectionPool {
    server_id: String,
    max_connections: usize,
    active: Vec<ConnectionId>,
    reserved: usize,
    waiters: VecDeque<Waiter>,
}

impl ConnectionPool {
    pub fn new(server_id: impl Into<String>, max_connections: usize) -> Self {
        Self {
            server_id: server_id.into(),
            max_connections: max_connections.max(1),
            active: Vec::new(),
            reserved: 0,
            waiters: VecDeque::new(),
        }
    }

    fn occupied(&self) -> usize {
        self.active.len() + self.reserved
    }

    /// Take a free slot if there is one
    pub fn try_reserve(&mut self) -> bool {
        if self.occupied() < self.max_connections {
            self.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Queue a requester; the receiver fires once a slot is reserved for it
    pub fn enqueue(&mut self, requester: impl Into<String>, deadline: Instant) -> oneshot::Receiver<()> {
        let (grant, rx) = oneshot::channel();
        self.waiters.push_back(Waiter {
            requester: requester.into(),
            grant,
            deadline,
        });
        rx
    }

    /// Turn a reservation into an active connection
    pub fn activate(&mut self, id: ConnectionId) {
        self.reserved = self.reserved.saturating_sub(1);
        self.active.push(id);
    }

    /// Give back a reservation that never became a connection
    pub fn cancel_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
        self.admit_next();
    }

    /// Remove an active connection, returning whether it was in the pool
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.active.len();
        self.active.retain(|c| *c != id);
        let removed = self.active.len() != before;
        if removed {
            self.admit_next();
        }
        removed
    }

    /// Forget waiters that gave up
    pub fn prune(&mut self) {
        self.waiters.retain(|w| !w.grant.is_closed());
    }

    /// Hand free slots to the oldest live waiters, dropping expired ones
    fn admit_next(&mut self) {
        let now = Instant::now();
        while self.occupied() < self.max_connections {
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            if waiter.deadline <= now {
                debug!(server_id = %self.server_id, requester = %waiter.requester, "Dropping expired waiter");
                continue;
            }
            if waiter.grant.send(()).is_ok() {
                debug!(server_id = %self.server_id, requester = %waiter.requester, "Slot granted to waiter");
                self.reserved += 1;
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: self.max_connections,
            active: self.active.len(),
            reserved: self.reserved,
            waiting: self.waiters.len(),
        }
    }
}

type Pools = Mutex<HashMap<String, ConnectionPool>>;

/// A reserved slot, handed back on drop unless it became a connection.
struct SlotReservation<'a> {
    pools: &'a Pools,
    server_id: String,
    armed: bool,
}

impl<'a> SlotReservation<'a> {
    fn new(pools: &'a Pools, server_id: &str) -> Self {
        Self {
            pools,
            server_id: server_id.to_string(),
            armed: true,
        }
    }

    fn activate(mut self, id: ConnectionId) {
        self.armed = false;
        if let Some(pool) = self.pools.lock().get_mut(&self.server_id) {
            pool.activate(id);
        }
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pool) = self.pools.lock().get_mut(&self.server_id) {
                pool.cancel_reservation();
            }
        }
    }
}

/// A place in a pool's queue. Dropping it withdraws from the queue and
/// returns a slot that was granted but never claimed.
struct QueueTicket<'a> {
    pools: &'a Pools,
    server_id: String,
    grant: oneshot::Receiver<()>,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.grant.close();
        let unclaimed = self.grant.try_recv().is_ok();
        if let Some(pool) = self.pools.lock().get_mut(&self.server_id) {
            if unclaimed {
                pool.cancel_reservation();
            }
            pool.prune();
        }
    }
}

/// Owns every live connection and the pool each one occupies.
///
/// Map locks are only held for the mutation itself, never across I/O.
pub struct ConnectionPoolManager {
    config: ManagerConfig,
    catalog: Arc<dyn ServerCatalog>,
    repository: Arc<dyn InstallationRepository>,
    events: Arc<dyn EventPublisher>,
    connector: Arc<dyn TransportConnector>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    pools: Pools,
}

impl ConnectionPoolManager {
    pub fn new(
        config: ManagerConfig,
        catalog: Arc<dyn ServerCatalog>,
        repository: Arc<dyn InstallationRepository>,
        events: Arc<dyn EventPublisher>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            config,
            catalog,
            repository,
            events,
            connector,
            connections: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection for the pair, or create one within the
    /// server's connection limit, waiting for a slot when the pool is full.
    #[instrument(skip(self, options))]
    pub async fn acquire(
        &self,
        owner: &str,
        server_id: &str,
        options: ConnectOptions,
    ) -> Result<Arc<Connection>> {
        if let Some(existing) = self.find_connected(owner, server_id) {
            debug!(connection_id = %existing.id(), "Reusing live connection");
            return Ok(existing);
        }

        let (installation, server) = self.installed(owner, server_id).await?;
        let timeout = options.timeout.unwrap_or(self.config.acquire_timeout);
        let reservation = self.reserve_slot(owner, &server, timeout).await?;

        if let Some(existing) = self.find_connected(owner, server_id) {
            return Ok(existing);
        }

        let connection = Arc::new(self.establish(&server, &installation).await?);

        // A concurrent acquire for the same pair may have won the race.
        let duplicate = {
            let mut connections = self.connections.write();
            let winner = connections
                .values()
                .find(|c| c.owner() == owner && c.server_id() == server_id && c.is_connected())
                .cloned();
            if winner.is_none() {
                connections.insert(connection.id(), connection.clone());
            }
            winner
        };
        if let Some(winner) = duplicate {
            drop(reservation);
            connection.shutdown().await;
            return Ok(winner);
        }
        reservation.activate(connection.id());

        self.events.publish(LifecycleEvent::ServerConnected {
            connection_id: connection.id(),
            server_id: server_id.to_string(),
            owner: owner.to_string(),
            transport: connection.transport_kind(),
        });
        info!(connection_id = %connection.id(), address = %connection.address(), "Connection registered");
        Ok(connection)
    }

    /// Open a throwaway connection that is never registered or reused, and
    /// close it again. Returns the operations the server reported.
    #[instrument(skip(self))]
    pub async fn smoke_test(&self, owner: &str, server_id: &str) -> Result<Vec<String>> {
        let (installation, server) = self.installed(owner, server_id).await?;
        let _reservation = self
            .reserve_slot(owner, &server, self.config.acquire_timeout)
            .await?;
        let connection = self.establish(&server, &installation).await?;
        let operations = connection.operations();
        connection.shutdown().await;
        Ok(operations)
    }

    async fn installed(&self, owner: &str, server_id: &str) -> Result<(Installation, ServerDescriptor)> {
        let installation = self
            .repository
            .find_latest(owner, server_id)
            .await?
            .filter(|i| i.status == InstallationStatus::Installed)
            .ok_or_else(|| {
                LifecycleError::NotFound(format!("installed server {server_id} for {owner}"))
            })?;
        let server = self.catalog.get_server(server_id).await?;
        Ok((installation, server))
    }

    /// Connect, marking the installation unhealthy when that fails
    async fn establish(&self, server: &ServerDescriptor, installation: &Installation) -> Result<Connection> {
        match Connection::establish(
            self.connector.as_ref(),
            server,
            installation,
            self.config.discovery_timeout,
        )
        .await
        {
            Ok(connection) => Ok(connection),
            Err(e) => {
                warn!(error = %e, "Connection failed");
                if let Err(repo_err) = self
                    .repository
                    .update_health(installation.id, HealthStatus::Unhealthy, chrono::Utc::now())
                    .await
                {
                    warn!(error = %repo_err, "Failed to record connection failure");
                }
                Err(e)
            }
        }
    }

    async fn reserve_slot(
        &self,
        owner: &str,
        server: &ServerDescriptor,
        timeout: Duration,
    ) -> Result<SlotReservation<'_>> {
        let max = server
            .max_connections
            .unwrap_or(self.config.max_connections_per_server);
        let deadline = Instant::now() + timeout;
        let grant = {
            let mut pools = self.pools.lock();
            let pool = pools
                .entry(server.id.clone())
                .or_insert_with(|| ConnectionPool::new(&server.id, max));
            if pool.try_reserve() {
                return Ok(SlotReservation::new(&self.pools, &server.id));
            }
            debug!(server_id = %server.id, owner = %owner, "Pool full, queueing");
            pool.enqueue(owner, deadline)
        };
        let mut ticket = QueueTicket {
            pools: &self.pools,
            server_id: server.id.clone(),
            grant,
        };

        match tokio::time::timeout_at(deadline, &mut ticket.grant).await {
            Ok(Ok(())) => Ok(SlotReservation::new(&self.pools, &server.id)),
            Ok(Err(_)) => Err(LifecycleError::Timeout(format!(
                "waiting for a {} connection slot",
                server.id
            ))),
            Err(_) => Err(LifecycleError::Timeout(format!(
                "waiting for a {} connection slot after {timeout:?}",
                server.id
            ))),
        }
    }

    /// Tear down a connection and free its pool slot
    pub async fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> Result<()> {
        let connection = self
            .connections
            .write()
            .remove(&id)
            .ok_or_else(|| LifecycleError::NotFound(format!("connection {id}")))?;

        connection.shutdown().await;
        self.release(&connection);

        self.events.publish(LifecycleEvent::ServerDisconnected {
            connection_id: id,
            server_id: connection.server_id().to_string(),
            owner: connection.owner().to_string(),
            reason,
        });
        info!(connection_id = %id, reason = ?reason, "Disconnected from tool server");
        Ok(())
    }

    /// Remove the connection from its pool's active list
    fn release(&self, connection: &Connection) {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(connection.server_id()) {
            if !pool.remove(connection.id()) {
                debug!(connection_id = %connection.id(), "Connection was not in its pool");
            }
        }
    }

    /// Disconnect every connection of an owner/server pair, returning how many
    pub async fn disconnect_all_for(&self, owner: &str, server_id: &str, reason: DisconnectReason) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .read()
            .values()
            .filter(|c| c.owner() == owner && c.server_id() == server_id)
            .map(|c| c.id())
            .collect();
        self.disconnect_ids(ids, reason).await
    }

    /// Disconnect everything
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.read().keys().copied().collect();
        self.disconnect_ids(ids, DisconnectReason::Shutdown).await
    }

    async fn disconnect_ids(&self, ids: Vec<ConnectionId>, reason: DisconnectReason) -> usize {
        let mut count = 0;
        for id in ids {
            match self.disconnect(id, reason).await {
                Ok(()) => count += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(connection_id = %id, error = %e, "Disconnect failed"),
            }
        }
        count
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    fn find_connected(&self, owner: &str, server_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .find(|c| c.owner() == owner && c.server_id() == server_id && c.is_connected())
            .cloned()
    }

    /// Connections the health monitor should probe, including ones whose
    /// process died without being disconnected
    pub fn connected(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| matches!(c.status(), ConnectionStatus::Connected | ConnectionStatus::Error))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections.read().values().map(|c| c.info()).collect()
    }

    pub fn pool_status(&self, server_id: &str) -> Option<PoolStatus> {
        self.pools.lock().get(server_id).map(ConnectionPool::status)
    }

    /// Probe a connection on demand
    pub async fn health(&self, id: ConnectionId) -> Result<crate::types::ConnectionHealth> {
        let connection = self
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(format!("connection {id}")))?;
        let latency = match connection.probe(self.config.probe_timeout).await {
            Ok(latency) => {
                connection.reset_probe_failures();
                Some(latency)
            }
            Err(e) => {
                debug!(connection_id = %id, error = %e, "On-demand probe failed");
                None
            }
        };
        Ok(connection.health(latency))
    }
}
