//! Registry package installs (`npm install -g`)

use async_trait::async_trait;
use tracing::info;

use super::process::run_command;
use super::{LogSink, MethodExecutor};
use crate::error::{LifecycleError, Result};
use crate::types::{Installation, MethodConfig, ServerDescriptor};

/// Installs the server's package globally with the configured package manager
#[derive(Debug, Clone)]
pub struct RegistryPackageExecutor {
    program: String,
}

impl RegistryPackageExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn package(server: &ServerDescriptor) -> Result<&str> {
        server.package.as_deref().ok_or_else(|| {
            LifecycleError::InvalidConfiguration(format!("server {} has no package reference", server.id))
        })
    }

    /// Arguments for `install`, honouring the version and registry options
    pub fn install_args(installation: &Installation, package: &str) -> Vec<String> {
        let mut spec = package.to_string();
        let mut args = vec!["install".to_string(), "-g".to_string()];
        if let MethodConfig::RegistryPackage { version, registry } = &installation.config.method {
            if let Some(version) = version {
                spec = format!("{}@{}", package, version);
            }
            if let Some(registry) = registry {
                args.push("--registry".to_string());
                args.push(registry.clone());
            }
        }
        args.push(spec);
        args
    }
}

#[async_trait]
impl MethodExecutor for RegistryPackageExecutor {
    async fn install(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let package = Self::package(server)?;
        let args = Self::install_args(installation, package);
        info!(installation_id = %installation.id, package = %package, "Installing registry package");
        run_command(&self.program, &args, &installation.env, &log).await
    }

    async fn uninstall(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let package = Self::package(server)?;
        let args = vec!["uninstall".to_string(), "-g".to_string(), package.to_string()];
        info!(installation_id = %installation.id, package = %package, "Removing registry package");
        run_command(&self.program, &args, &installation.env, &log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstallMethod, InstallRequest, LaunchSpec};

    #[test]
    fn test_install_args_with_version_and_registry() {
        let server = ServerDescriptor::stdio("gh", "GitHub", LaunchSpec::new("npx"))
            .with_package("@modelcontextprotocol/server-github");
        let request = InstallRequest::new("u1", "gh", InstallMethod::RegistryPackage).with_config(
            MethodConfig::RegistryPackage {
                version: Some("1.0.0".into()),
                registry: Some("https://registry.example".into()),
            },
        );
        let installation = Installation::pending(&request, &server);
        let args = RegistryPackageExecutor::install_args(&installation, server.package.as_deref().unwrap());
        assert_eq!(
            args,
            vec![
                "install",
                "-g",
                "--registry",
                "https://registry.example",
                "@modelcontextprotocol/server-github@1.0.0"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_package_reference() {
        let server = ServerDescriptor::stdio("gh", "GitHub", LaunchSpec::new("npx"));
        let installation = Installation::pending(
            &InstallRequest::new("u1", "gh", InstallMethod::RegistryPackage),
            &server,
        );
        let (sink, _rx) = super::super::log_channel();
        let err = RegistryPackageExecutor::new("npm")
            .install(&installation, &server, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidConfiguration(_)));
    }
}
