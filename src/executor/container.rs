//! Container image installs: pull, then run a named container

use async_trait::async_trait;
use tracing::info;

use super::process::run_command;
use super::{LogSink, MethodExecutor};
use crate::error::{LifecycleError, Result};
use crate::types::{Installation, MethodConfig, ServerDescriptor};

/// Deterministic container name for a server/owner pair
pub fn container_name(server_id: &str, owner: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '-' })
            .collect()
    };
    format!("lodge-{}-{}", clean(server_id), clean(owner))
}

/// Pulls the server image and starts it with the container runtime CLI
#[derive(Debug, Clone)]
pub struct ContainerImageExecutor {
    program: String,
}

impl ContainerImageExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn image(installation: &Installation, server: &ServerDescriptor) -> Result<String> {
        let image = server.image.as_deref().ok_or_else(|| {
            LifecycleError::InvalidConfiguration(format!("server {} has no image reference", server.id))
        })?;
        Ok(match &installation.config.method {
            MethodConfig::ContainerImage { tag: Some(tag), .. } => format!("{}:{}", image, tag),
            _ => image.to_string(),
        })
    }

    /// Arguments for `run`; every environment variable becomes its own `-e`
    pub fn run_args(installation: &Installation, image: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name(&installation.server_id, &installation.owner),
        ];
        for (key, value) in &installation.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let MethodConfig::ContainerImage { network, ports, .. } = &installation.config.method {
            if let Some(network) = network {
                args.push("--network".to_string());
                args.push(network.clone());
            }
            for port in ports {
                args.push("-p".to_string());
                args.push(port.clone());
            }
        }
        args.push(image.to_string());
        args
    }
}

#[async_trait]
impl MethodExecutor for ContainerImageExecutor {
    async fn install(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let image = Self::image(installation, server)?;
        info!(installation_id = %installation.id, image = %image, "Pulling container image");

        // The environment goes to the container via -e, not to the CLI.
        let no_env = Default::default();
        run_command(&self.program, &["pull".to_string(), image.clone()], &no_env, &log).await?;
        run_command(&self.program, &Self::run_args(installation, &image), &no_env, &log).await
    }

    async fn uninstall(&self, installation: &Installation, _server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let name = container_name(&installation.server_id, &installation.owner);
        info!(installation_id = %installation.id, container = %name, "Removing container");
        run_command(
            &self.program,
            &["rm".to_string(), "-f".to_string(), name],
            &Default::default(),
            &log,
        )
        .await
    }
}
