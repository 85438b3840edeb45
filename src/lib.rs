//! # Lodge
//!
//! Tool server lifecycle manager - installs MCP tool servers, connects to
//! them and keeps an eye on them.
//!
//! This crate drives installations of tool servers through a pluggable
//! method executor, pools live connections per server and supervises them
//! with periodic health probes.
//!
//! ## Features
//!
//! - Install via registry package, container image, pre-built binary or manually
//! - Streamed installation logs persisted through a repository port
//! - Stdio connections with line-delimited JSON-RPC and request correlation
//! - Per-server connection limits with a FIFO wait queue
//! - Health monitoring with forced disconnect after repeated failures
//! - Lifecycle events for outside observers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lodge::{
//!     BroadcastEventBus, ConnectOptions, InMemoryInstallationRepository, InMemoryServerCatalog,
//!     InstallMethod, InstallRequest, LaunchSpec, ServerDescriptor, ToolServerManager,
//! };
//!
//! let catalog = Arc::new(InMemoryServerCatalog::new());
//! catalog.insert(
//!     ServerDescriptor::stdio("github", "GitHub", LaunchSpec::new("npx").with_args(["-y", "@modelcontextprotocol/server-github"]))
//!         .with_package("@modelcontextprotocol/server-github"),
//! );
//!
//! let manager = ToolServerManager::new(
//!     catalog,
//!     Arc::new(InMemoryInstallationRepository::new()),
//!     Arc::new(BroadcastEventBus::new()),
//! );
//! manager.start();
//!
//! let request = InstallRequest::new("alice", "github", InstallMethod::RegistryPackage)
//!     .with_env("GITHUB_TOKEN", token);
//! manager.install_and_wait(request).await?;
//!
//! let connection = manager.connect("alice", "github", ConnectOptions::default()).await?;
//! println!("{:?}", connection.operations());
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod manager;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::{CommandConfig, ManagerConfig};
pub use connection::Connection;
pub use error::{LifecycleError, Result};
pub use events::LifecycleEvent;
pub use executor::{ExecutorRegistry, LogSink, MethodExecutor};
pub use health::{HealthConfig, HealthMonitor, SweepSummary};
pub use manager::{ToolServerManager, ToolServerManagerBuilder};
pub use memory::{BroadcastEventBus, InMemoryInstallationRepository, InMemoryServerCatalog};
pub use orchestrator::InstallationOrchestrator;
pub use pool::{ConnectOptions, ConnectionPool, ConnectionPoolManager};
pub use ports::{EventPublisher, InstallationRepository, RepositoryError, ServerCatalog};
pub use protocol::ProtocolCodec;
pub use transport::{ProcessConnector, StdioTransport, Transport, TransportConnector};
pub use types::*;
