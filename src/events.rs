//! Domain events published for outside observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConnectionId, DisconnectReason, InstallationId, InstallationStatus, TransportKind,
};

/// Event emitted by the lifecycle core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    #[serde(rename = "installation.status_changed", rename_all = "camelCase")]
    InstallationStatusChanged {
        installation_id: InstallationId,
        server_id: String,
        owner: String,
        status: InstallationStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },

    #[serde(rename = "server.connected", rename_all = "camelCase")]
    ServerConnected {
        connection_id: ConnectionId,
        server_id: String,
        owner: String,
        transport: TransportKind,
    },

    #[serde(rename = "server.disconnected", rename_all = "camelCase")]
    ServerDisconnected {
        connection_id: ConnectionId,
        server_id: String,
        owner: String,
        reason: DisconnectReason,
    },

    #[serde(rename = "server.uninstalled", rename_all = "camelCase")]
    ServerUninstalled {
        installation_id: InstallationId,
        server_id: String,
        owner: String,
    },
}

impl LifecycleEvent {
    /// Topic name for routing
    pub fn topic(&self) -> &'static str {
        match self {
            LifecycleEvent::InstallationStatusChanged { .. } => "installation.status_changed",
            LifecycleEvent::ServerConnected { .. } => "server.connected",
            LifecycleEvent::ServerDisconnected { .. } => "server.disconnected",
            LifecycleEvent::ServerUninstalled { .. } => "server.uninstalled",
        }
    }

    /// Server the event concerns
    pub fn server_id(&self) -> &str {
        match self {
            LifecycleEvent::InstallationStatusChanged { server_id, .. }
            | LifecycleEvent::ServerConnected { server_id, .. }
            | LifecycleEvent::ServerDisconnected { server_id, .. }
            | LifecycleEvent::ServerUninstalled { server_id, .. } => server_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_serializes_with_topic_tag() {
        let event = LifecycleEvent::ServerDisconnected {
            connection_id: Uuid::nil(),
            server_id: "fs".into(),
            owner: "u1".into(),
            reason: DisconnectReason::HealthCheck,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.topic());
        assert_eq!(value["data"]["serverId"], "fs");
        assert_eq!(value["data"]["reason"], "health_check");
    }
}
