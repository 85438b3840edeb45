//! Lifecycle error types

use thiserror::Error;

use crate::ports::RepositoryError;

/// Errors that can occur while installing, connecting or supervising tool servers
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Unknown server, installation or connection
    #[error("Not found: {0}")]
    NotFound(String),

    /// An installation for this owner/server pair is already pending, installing or installed
    #[error("Server {server_id} is already installed (or installing) for {owner}")]
    DuplicateInstallation {
        owner: String,
        server_id: String,
    },

    /// A method executor failed (spawn failure or non-zero exit)
    #[error("Installation failed: {0}")]
    InstallationExecutionFailure(String),

    /// No executor is registered for the installation method
    #[error("Unsupported installation method: {0}")]
    UnsupportedMethod(String),

    /// The transport kind is declared but not implemented
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Installation configuration does not fit the method or server
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not allowed in the record's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport could not be established or was lost
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Pool wait, discovery or request expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A health probe failed
    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    /// JSON-RPC error returned by the tool server
    #[error("RPC error {code}: {message}")]
    RpcError {
        code: i64,
        message: String,
    },

    /// Malformed frame or unexpected payload
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Installation repository failure
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    /// Whether the error is scoped to a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, LifecycleError::NotFound(_))
    }
}
