//! Transport implementations

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LifecycleError, Result};
use crate::protocol::{read_line_lossy, ProtocolCodec};
use crate::types::{Installation, LaunchSpec, ServerDescriptor, TransportKind};

/// Live channel to one tool server.
///
/// Inbound frames are pushed into the [`ProtocolCodec`] handed to the
/// connector; the transport itself only writes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one newline-terminated frame
    async fn send(&self, line: String) -> Result<()>;

    /// Transport-specific address, e.g. `stdio://server?pid=42`
    fn address(&self) -> String;

    /// Whether the far end is still there
    fn is_alive(&self) -> bool;

    /// Terminate the channel. Signal-and-forget, no drain.
    async fn close(&self) -> Result<()>;
}

/// Establishes transports for a server installation
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        server: &ServerDescriptor,
        installation: &Installation,
        codec: Arc<ProtocolCodec>,
    ) -> Result<Arc<dyn Transport>>;
}

/// Default connector: spawns stdio servers, rejects the rest
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessConnector;

#[async_trait]
impl TransportConnector for ProcessConnector {
    async fn open(
        &self,
        server: &ServerDescriptor,
        installation: &Installation,
        codec: Arc<ProtocolCodec>,
    ) -> Result<Arc<dyn Transport>> {
        match server.transport {
            TransportKind::Stdio => {
                let mut env = server.launch.env.clone();
                env.extend(installation.env.clone());
                let transport = StdioTransport::spawn(&server.id, &server.launch, &env, codec).await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Stream => Err(LifecycleError::UnsupportedTransport(
                "stream transport not implemented".into(),
            )),
            TransportKind::Socket => Err(LifecycleError::UnsupportedTransport(
                "socket transport not implemented".into(),
            )),
        }
    }
}

/// Stdio-based transport (spawns a child process)
pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    outbound: mpsc::UnboundedSender<String>,
    address: String,
    alive: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the server and wire its stdout into `codec`
    pub async fn spawn(
        server_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
        codec: Arc<ProtocolCodec>,
    ) -> Result<Self> {
        debug!(server_id = %server_id, command = %launch.command, "Starting tool server process");

        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LifecycleError::ConnectionError(format!("Failed to spawn: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LifecycleError::ConnectionError("No stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LifecycleError::ConnectionError("No stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = read_line_lossy(&mut reader, &mut buf).await {
                    debug!(server_id = %server_id, "stderr: {}", line);
                }
            });
        }

        if let Some(status) = child.try_wait()? {
            return Err(LifecycleError::ConnectionError(format!(
                "Process exited immediately with {}",
                status
            )));
        }

        let address = format!(
            "stdio://{}?pid={}",
            server_id,
            child.id().map(|p| p.to_string()).unwrap_or_default()
        );
        let alive = Arc::new(AtomicBool::new(true));

        {
            let alive = alive.clone();
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    match read_line_lossy(&mut reader, &mut buf).await {
                        Ok(Some(line)) => codec.handle_line(&line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(server_id = %server_id, error = %e, "Read error");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                codec.close_pending();
                debug!(server_id = %server_id, "Tool server output closed");
            });
        }

        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(stdin, rx, alive.clone()));

        Ok(Self {
            child: Mutex::new(Some(child)),
            outbound,
            address,
            alive,
            writer,
        })
    }
}

async fn write_frames(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    alive: Arc<AtomicBool>,
) {
    while let Some(line) = rx.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Write error");
            alive.store(false, Ordering::SeqCst);
            break;
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, line: String) -> Result<()> {
        if !self.is_alive() {
            return Err(LifecycleError::ConnectionError("Process is gone".into()));
        }
        self.outbound
            .send(line)
            .map_err(|_| LifecycleError::ConnectionError("Transport closed".into()))
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.abort();
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(address = %self.address, error = %e, "Kill failed, process already gone");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .finish()
    }
}
