//! Pre-built binary installs

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::process::run_command;
use super::{LogSink, MethodExecutor};
use crate::error::{LifecycleError, Result};
use crate::types::{BinaryRef, Installation, MethodConfig, ServerDescriptor};

/// Downloads the server binary and marks it executable
#[derive(Debug, Clone)]
pub struct BinaryExecutor {
    downloader: String,
    bin_dir: PathBuf,
}

impl BinaryExecutor {
    pub fn new(downloader: impl Into<String>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloader: downloader.into(),
            bin_dir: bin_dir.into(),
        }
    }

    fn binary(server: &ServerDescriptor) -> Result<&BinaryRef> {
        server.binary.as_ref().ok_or_else(|| {
            LifecycleError::InvalidConfiguration(format!("server {} has no binary reference", server.id))
        })
    }

    /// Where the binary lands for this installation
    pub fn destination(&self, installation: &Installation, binary: &BinaryRef) -> Result<PathBuf> {
        let file_name = Path::new(&binary.file_name);
        let mut components = file_name.components();
        let single = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
        if !single {
            return Err(LifecycleError::InvalidConfiguration(format!(
                "binary file name {:?} must be a single path component",
                binary.file_name
            )));
        }
        let dir = match &installation.config.method {
            MethodConfig::Binary {
                install_dir: Some(dir),
            } => dir.clone(),
            _ => self.bin_dir.clone(),
        };
        Ok(dir.join(file_name))
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl MethodExecutor for BinaryExecutor {
    async fn install(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let binary = Self::binary(server)?;
        let dest = self.destination(installation, binary)?;
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        info!(installation_id = %installation.id, url = %binary.url, dest = %dest.display(), "Downloading binary");
        let args = vec![
            "-fsSL".to_string(),
            "-o".to_string(),
            dest.display().to_string(),
            binary.url.clone(),
        ];
        run_command(&self.downloader, &args, &installation.env, &log).await?;

        make_executable(&dest).await.map_err(|e| {
            LifecycleError::InstallationExecutionFailure(format!("Failed to mark {} executable: {}", dest.display(), e))
        })?;
        log.line(format!("Installed {} to {}", binary.file_name, dest.display()));
        Ok(())
    }

    async fn uninstall(&self, installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        let binary = Self::binary(server)?;
        let dest = self.destination(installation, binary)?;
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => log.line(format!("Removed {}", dest.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log.line(format!("{} already absent", dest.display()));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
