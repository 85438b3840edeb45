//! Installation method executors.
//!
//! Each executor performs the external action for one [`InstallMethod`] and
//! streams log lines through a [`LogSink`] while it runs. The orchestrator
//! appends those lines to the installation record as they arrive.

mod binary;
mod container;
mod manual;
mod process;
mod registry_package;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::CommandConfig;
use crate::error::{LifecycleError, Result};
use crate::types::{InstallMethod, Installation, ServerDescriptor};

pub use binary::BinaryExecutor;
pub use container::{container_name, ContainerImageExecutor};
pub use manual::ManualExecutor;
pub use registry_package::RegistryPackageExecutor;

/// Sending half of an installation log stream
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    /// Append one line. Lines sent after the reader went away are dropped.
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }
}

/// Create a log stream
pub fn log_channel() -> (LogSink, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogSink { tx }, rx)
}

/// Performs the external install and uninstall actions of one method
#[async_trait]
pub trait MethodExecutor: Send + Sync {
    /// Install the server. An `Err` marks the installation failed.
    async fn install(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()>;

    /// Undo the install.
    async fn uninstall(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()>;
}

/// Executors by method
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<InstallMethod, Arc<dyn MethodExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in executors, using `commands` for external programs
    pub fn with_defaults(commands: &CommandConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            InstallMethod::RegistryPackage,
            Arc::new(RegistryPackageExecutor::new(commands.npm.clone())),
        );
        registry.register(
            InstallMethod::ContainerImage,
            Arc::new(ContainerImageExecutor::new(commands.docker.clone())),
        );
        registry.register(
            InstallMethod::Binary,
            Arc::new(BinaryExecutor::new(commands.downloader.clone(), commands.bin_dir.clone())),
        );
        registry.register(InstallMethod::Manual, Arc::new(ManualExecutor));
        registry
    }

    /// Add or replace the executor for a method
    pub fn register(&mut self, method: InstallMethod, executor: Arc<dyn MethodExecutor>) {
        self.executors.insert(method, executor);
    }

    pub fn get(&self, method: InstallMethod) -> Result<Arc<dyn MethodExecutor>> {
        self.executors
            .get(&method)
            .cloned()
            .ok_or_else(|| LifecycleError::UnsupportedMethod(method.to_string()))
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("methods", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_executor_is_unsupported() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(
            registry.get(InstallMethod::Binary),
            Err(LifecycleError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_defaults_cover_every_method() {
        let registry = ExecutorRegistry::with_defaults(&CommandConfig::default());
        for method in [
            InstallMethod::RegistryPackage,
            InstallMethod::ContainerImage,
            InstallMethod::Binary,
            InstallMethod::Manual,
        ] {
            assert!(registry.get(method).is_ok());
        }
    }

    #[tokio::test]
    async fn test_log_sink_preserves_order() {
        let (sink, mut rx) = log_channel();
        sink.line("one");
        sink.line("two");
        drop(sink);
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(rx.recv().await, None);
    }
}
