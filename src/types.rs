//! Lifecycle type definitions

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};

/// Identifier of an installation record
pub type InstallationId = Uuid;

/// Identifier of a connection
pub type ConnectionId = Uuid;

/// How a tool server gets fetched and started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// Package from a registry (npm)
    RegistryPackage,
    /// Container image pulled and run
    ContainerImage,
    /// Pre-built binary download
    Binary,
    /// Installed by hand, nothing to do
    Manual,
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallMethod::RegistryPackage => "registry_package",
            InstallMethod::ContainerImage => "container_image",
            InstallMethod::Binary => "binary",
            InstallMethod::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Installation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Pending,
    Installing,
    Installed,
    Failed,
    Uninstalled,
}

impl InstallationStatus {
    /// Statuses that block a new installation for the same owner/server pair
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstallationStatus::Pending | InstallationStatus::Installing | InstallationStatus::Installed
        )
    }

    /// Whether the record can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallationStatus::Failed | InstallationStatus::Uninstalled)
    }
}

/// Health of an installation as observed through its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// Method-specific installation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MethodConfig {
    RegistryPackage {
        /// Version or dist-tag appended to the package reference
        #[serde(default)]
        version: Option<String>,
        /// Alternate registry URL
        #[serde(default)]
        registry: Option<String>,
    },
    ContainerImage {
        /// Tag appended to the image reference
        #[serde(default)]
        tag: Option<String>,
        /// Docker network to attach to
        #[serde(default)]
        network: Option<String>,
        /// Port mappings passed as `-p`
        #[serde(default)]
        ports: Vec<String>,
    },
    Binary {
        /// Overrides the configured binary directory
        #[serde(default)]
        install_dir: Option<PathBuf>,
    },
    Manual {
        #[serde(default)]
        notes: Option<String>,
    },
}

impl MethodConfig {
    /// Default options for a method
    pub fn default_for(method: InstallMethod) -> Self {
        match method {
            InstallMethod::RegistryPackage => MethodConfig::RegistryPackage {
                version: None,
                registry: None,
            },
            InstallMethod::ContainerImage => MethodConfig::ContainerImage {
                tag: None,
                network: None,
                ports: Vec::new(),
            },
            InstallMethod::Binary => MethodConfig::Binary { install_dir: None },
            InstallMethod::Manual => MethodConfig::Manual { notes: None },
        }
    }

    /// The method these options belong to
    pub fn method(&self) -> InstallMethod {
        match self {
            MethodConfig::RegistryPackage { .. } => InstallMethod::RegistryPackage,
            MethodConfig::ContainerImage { .. } => InstallMethod::ContainerImage,
            MethodConfig::Binary { .. } => InstallMethod::Binary,
            MethodConfig::Manual { .. } => InstallMethod::Manual,
        }
    }
}

/// Installation settings stored on the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationConfig {
    /// Run a connection smoke test after a successful install
    pub auto_start: bool,
    /// Method-specific options
    pub method: MethodConfig,
}

/// A request to install a tool server
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub owner: String,
    pub server_id: String,
    pub method: InstallMethod,
    pub config: MethodConfig,
    pub env: BTreeMap<String, String>,
    pub auto_start: bool,
}

impl InstallRequest {
    /// Create a request with default options for the method
    pub fn new(owner: impl Into<String>, server_id: impl Into<String>, method: InstallMethod) -> Self {
        Self {
            owner: owner.into(),
            server_id: server_id.into(),
            method,
            config: MethodConfig::default_for(method),
            env: BTreeMap::new(),
            auto_start: true,
        }
    }

    /// Set method-specific options
    pub fn with_config(mut self, config: MethodConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an environment variable passed to the executor and the server process
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enable or disable the post-install connection smoke test
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Check the options match the requested method
    pub fn validate(&self) -> Result<()> {
        if self.config.method() != self.method {
            return Err(LifecycleError::InvalidConfiguration(format!(
                "{} options given for a {} installation",
                self.config.method(),
                self.method
            )));
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(LifecycleError::InvalidConfiguration(
                "environment variable names must be non-empty and contain no '='".into(),
            ));
        }
        Ok(())
    }
}

/// One installation attempt of a server for an owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: InstallationId,
    pub owner: String,
    pub server_id: String,
    pub server_name: String,
    pub method: InstallMethod,
    pub status: InstallationStatus,
    pub config: InstallationConfig,
    pub env: BTreeMap<String, String>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub installed_at: Option<DateTime<Utc>>,
}

impl Installation {
    /// Build a pending record from a validated request
    pub fn pending(request: &InstallRequest, server: &ServerDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: request.owner.clone(),
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            method: request.method,
            status: InstallationStatus::Pending,
            config: InstallationConfig {
                auto_start: request.auto_start,
                method: request.config.clone(),
            },
            env: request.env.clone(),
            logs: Vec::new(),
            error: None,
            health: HealthStatus::Unknown,
            last_health_check: None,
            created_at: now,
            updated_at: now,
            installed_at: None,
        }
    }
}

/// Channel type used to reach a tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON-RPC over stdin/stdout
    Stdio,
    /// HTTP streaming (SSE)
    Stream,
    /// WebSocket
    Socket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Stream => "stream",
            TransportKind::Socket => "socket",
        };
        f.write_str(name)
    }
}

/// How to launch a server process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Downloadable pre-built binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRef {
    pub url: String,
    pub file_name: String,
}

/// Catalog metadata for a tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub transport: TransportKind,
    pub launch: LaunchSpec,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub binary: Option<BinaryRef>,
    /// Overrides the configured per-server connection limit
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl ServerDescriptor {
    /// An active stdio server launched with `launch`
    pub fn stdio(id: impl Into<String>, name: impl Into<String>, launch: LaunchSpec) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: true,
            transport: TransportKind::Stdio,
            launch,
            package: None,
            image: None,
            binary: None,
            max_connections: None,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_binary(mut self, binary: BinaryRef) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

/// Why a connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Requested,
    HealthCheck,
    Uninstall,
    Shutdown,
}

/// Serializable view of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub installation_id: InstallationId,
    pub server_id: String,
    pub owner: String,
    pub transport: TransportKind,
    pub address: String,
    pub status: ConnectionStatus,
    pub success_count: u64,
    pub error_count: u64,
    pub last_ping: Option<DateTime<Utc>>,
    pub operations: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Health report for one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    /// Round-trip time of the probe, absent when it failed
    pub latency_ms: Option<u64>,
    pub success_count: u64,
    pub error_count: u64,
    pub uptime_ms: u64,
    pub operation_count: usize,
}

/// Occupancy of one server's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub active: usize,
    /// Slots held by connections still being established
    pub reserved: usize,
    pub waiting: usize,
}
