//! Manual installs: the user set the server up themselves

use async_trait::async_trait;

use super::{LogSink, MethodExecutor};
use crate::error::Result;
use crate::types::{Installation, ServerDescriptor};

/// Records the installation without any external action
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualExecutor;

#[async_trait]
impl MethodExecutor for ManualExecutor {
    async fn install(&self, _installation: &Installation, server: &ServerDescriptor, log: LogSink) -> Result<()> {
        log.line(format!("Manual installation of {} recorded; no action taken", server.name));
        Ok(())
    }

    async fn uninstall(&self, _installation: &Installation, _server: &ServerDescriptor, _log: LogSink) -> Result<()> {
        Ok(())
    }
}
