//! Shared fixtures: an in-process transport connector and a scripted executor

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodge::protocol::{ProtocolCodec, DISCOVERY_METHOD, PING_METHOD};
use lodge::{
    BroadcastEventBus, InMemoryInstallationRepository, InMemoryServerCatalog, Installation,
    InstallMethod, LaunchSpec, LifecycleError, LifecycleEvent, LogSink, ManagerConfig,
    MethodExecutor, ServerDescriptor, ToolServerManager, Transport, TransportConnector,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// How the fake tool servers answer
#[derive(Debug, Default)]
pub struct ServerBehavior {
    pub operations: Mutex<Vec<String>>,
    pub fail_pings: AtomicBool,
    pub silent_discovery: AtomicBool,
}

/// Connector that hands out in-process transports and counts terminations
#[derive(Default)]
pub struct MockConnector {
    pub behavior: Arc<ServerBehavior>,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub refuse: AtomicBool,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn with_operations(operations: &[&str]) -> Self {
        let connector = Self::default();
        *connector.behavior.operations.lock() = operations.iter().map(|s| s.to_string()).collect();
        connector
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate the most recent server process dying on its own
    pub fn kill_latest(&self) {
        if let Some(transport) = self.transports.lock().last() {
            transport.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(
        &self,
        server: &ServerDescriptor,
        _installation: &Installation,
        codec: Arc<ProtocolCodec>,
    ) -> lodge::Result<Arc<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(LifecycleError::ConnectionError("Failed to spawn: refused".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport {
            codec,
            behavior: self.behavior.clone(),
            closed: self.closed.clone(),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            address: format!("mock://{}/{}", server.id, n),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    codec: Arc<ProtocolCodec>,
    behavior: Arc<ServerBehavior>,
    closed: Arc<AtomicUsize>,
    alive: AtomicBool,
    terminated: AtomicBool,
    address: String,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, line: String) -> lodge::Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(LifecycleError::ConnectionError("Process is gone".into()));
        }
        let request: serde_json::Value = serde_json::from_str(&line).expect("frame is JSON");
        let Some(id) = request.get("id").cloned() else {
            return Ok(());
        };
        let method = request["method"].as_str().unwrap_or_default();

        let response = if method == PING_METHOD && self.behavior.fail_pings.load(Ordering::SeqCst) {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": "unhealthy"}})
        } else if method == DISCOVERY_METHOD {
            if self.behavior.silent_discovery.load(Ordering::SeqCst) {
                return Ok(());
            }
            let tools: Vec<serde_json::Value> = self
                .behavior
                .operations
                .lock()
                .iter()
                .map(|name| serde_json::json!({"name": name}))
                .collect();
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}})
        } else {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
        };
        self.codec.handle_line(&response.to_string());
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> lodge::Result<()> {
        assert!(
            !self.terminated.swap(true, Ordering::SeqCst),
            "transport terminated twice"
        );
        self.alive.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Executor that emits fixed lines and then succeeds or fails
pub struct ScriptedExecutor {
    pub lines: Vec<String>,
    pub failure: Option<String>,
    pub uninstalls: AtomicUsize,
    pub delay: Duration,
    pub panics: bool,
}

impl ScriptedExecutor {
    pub fn succeeding(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            failure: None,
            uninstalls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            panics: false,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::succeeding(&[])
        }
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::succeeding(&[])
        }
    }
}

#[async_trait]
impl MethodExecutor for ScriptedExecutor {
    async fn install(&self, _installation: &Installation, _server: &ServerDescriptor, log: LogSink) -> lodge::Result<()> {
        for line in &self.lines {
            log.line(line.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("executor blew up");
        }
        match &self.failure {
            Some(message) => Err(LifecycleError::InstallationExecutionFailure(message.clone())),
            None => Ok(()),
        }
    }

    async fn uninstall(&self, _installation: &Installation, _server: &ServerDescriptor, log: LogSink) -> lodge::Result<()> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        log.line("uninstalled");
        Ok(())
    }
}

/// A manager wired to in-memory adapters and the mock connector
pub struct Harness {
    pub manager: ToolServerManager,
    pub catalog: Arc<InMemoryServerCatalog>,
    pub repository: Arc<InMemoryInstallationRepository>,
    pub bus: Arc<BroadcastEventBus>,
    pub connector: Arc<MockConnector>,
    pub events: broadcast::Receiver<LifecycleEvent>,
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        probe_timeout: Duration::from_millis(200),
        discovery_timeout: Duration::from_millis(200),
        acquire_timeout: Duration::from_millis(200),
        ..ManagerConfig::default()
    }
}

pub fn server(id: &str) -> ServerDescriptor {
    ServerDescriptor::stdio(id, id.to_uppercase(), LaunchSpec::new(format!("{id}-server")))
        .with_package(format!("@tools/{id}"))
}

pub fn harness(connector: MockConnector) -> Harness {
    harness_with(connector, |builder| builder)
}

pub fn harness_with(
    connector: MockConnector,
    customize: impl FnOnce(lodge::ToolServerManagerBuilder) -> lodge::ToolServerManagerBuilder,
) -> Harness {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(server("fs"));
    let repository = Arc::new(InMemoryInstallationRepository::new());
    let bus = Arc::new(BroadcastEventBus::new());
    let connector = Arc::new(connector);
    let events = bus.subscribe();

    let builder = ToolServerManager::builder(catalog.clone(), repository.clone(), bus.clone())
        .config(test_config())
        .connector(connector.clone());
    let manager = customize(builder).build();

    Harness {
        manager,
        catalog,
        repository,
        bus,
        connector,
        events,
    }
}

/// Everything published so far
pub fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn manual(owner: &str, server_id: &str) -> lodge::InstallRequest {
    lodge::InstallRequest::new(owner, server_id, InstallMethod::Manual).with_auto_start(false)
}
