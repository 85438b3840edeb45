//! Tests against real child processes
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lodge::{
    BroadcastEventBus, ConnectOptions, ConnectionStatus, HealthStatus, InMemoryInstallationRepository,
    InMemoryServerCatalog, InstallMethod, InstallRequest, InstallationStatus, LaunchSpec, LifecycleError,
    ManagerConfig, ServerDescriptor, ToolServerManager,
};
use tempfile::TempDir;

const TOOL_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file"},{"name":"write_file"}]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

/// Same server, but it writes a line of invalid UTF-8 before its tool list
const NOISY_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"tools/list"'*)
      printf 'garbage \377\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file"}]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

fn manager_with(catalog: Arc<InMemoryServerCatalog>, config: ManagerConfig) -> ToolServerManager {
    ToolServerManager::builder(
        catalog,
        Arc::new(InMemoryInstallationRepository::new()),
        Arc::new(BroadcastEventBus::new()),
    )
    .config(config)
    .build()
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_stdio_server_connects_and_discovers() {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(ServerDescriptor::stdio(
        "fs",
        "Filesystem",
        LaunchSpec::new("sh").with_args(["-c", TOOL_SERVER]),
    ));
    let manager = manager_with(catalog, ManagerConfig::default());

    let request = InstallRequest::new("u1", "fs", InstallMethod::Manual).with_auto_start(false);
    let installation = manager.install_and_wait(request).await.unwrap();
    assert_eq!(installation.status, InstallationStatus::Installed);

    let connection = manager.connect("u1", "fs", ConnectOptions::default()).await.unwrap();
    assert!(connection.address().starts_with("stdio://fs?pid="));
    assert_eq!(connection.operations(), vec!["read_file", "write_file"]);

    let health = manager.health(connection.id()).await.unwrap();
    assert!(health.latency_ms.is_some());
    assert_eq!(health.operation_count, 2);

    let summary = manager.check_health().await;
    assert_eq!(summary.healthy, 1);

    manager.disconnect(connection.id()).await.unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_exited_server_fails_probes() {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    // Answers the handshake and discovery, then quits on the first ping.
    let short_lived = r#"
reply() {
  id=$(printf '%s' "$1" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
}
IFS= read -r line; reply "$line"
IFS= read -r line
IFS= read -r line; reply "$line"
IFS= read -r line
"#;
    catalog.insert(ServerDescriptor::stdio(
        "brief",
        "Brief",
        LaunchSpec::new("sh").with_args(["-c", short_lived]),
    ));
    let manager = manager_with(catalog, ManagerConfig::default());
    let request = InstallRequest::new("u1", "brief", InstallMethod::Manual).with_auto_start(false);
    manager.install_and_wait(request).await.unwrap();

    let connection = manager.connect("u1", "brief", ConnectOptions::default()).await.unwrap();
    assert!(connection.is_connected());

    let summary = manager.check_health().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(connection.probe_failures(), 1);
    assert_eq!(connection.info().error_count, 1);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_server_exiting_during_startup_fails_connect() {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(ServerDescriptor::stdio(
        "flaky",
        "Flaky",
        LaunchSpec::new("sh").with_args(["-c", "sleep 0.1; exit 1"]),
    ));
    let manager = manager_with(catalog, ManagerConfig::default());
    let request = InstallRequest::new("u1", "flaky", InstallMethod::Manual).with_auto_start(false);
    manager.install_and_wait(request).await.unwrap();

    let err = manager
        .connect("u1", "flaky", ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ConnectionError(_)), "{err}");
    assert!(manager.list_connections().is_empty());

    let pool = manager.pool_status("flaky").unwrap();
    assert_eq!((pool.active, pool.reserved), (0, 0));
    let installation = &manager.list_installations("u1").await.unwrap()[0];
    assert_eq!(installation.health, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_invalid_utf8_from_server_is_dropped() {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(ServerDescriptor::stdio(
        "noisy",
        "Noisy",
        LaunchSpec::new("sh").with_args(["-c", NOISY_SERVER]),
    ));
    let manager = manager_with(catalog, ManagerConfig::default());
    let request = InstallRequest::new("u1", "noisy", InstallMethod::Manual).with_auto_start(false);
    manager.install_and_wait(request).await.unwrap();

    let connection = manager.connect("u1", "noisy", ConnectOptions::default()).await.unwrap();
    assert_eq!(connection.operations(), vec!["read_file"]);

    let health = manager.health(connection.id()).await.unwrap();
    assert!(health.latency_ms.is_some());
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_registry_install_runs_package_manager() {
    let dir = TempDir::new().unwrap();
    let npm = write_script(dir.path(), "npm", r#"echo "npm $*""#);

    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(
        ServerDescriptor::stdio("fs", "Filesystem", LaunchSpec::new("fs-server")).with_package("@tools/fs"),
    );
    let mut config = ManagerConfig::default();
    config.commands.npm = npm;
    let manager = manager_with(catalog, config);

    let request = InstallRequest::new("u1", "fs", InstallMethod::RegistryPackage).with_auto_start(false);
    let installation = manager.install_and_wait(request).await.unwrap();

    assert_eq!(installation.status, InstallationStatus::Installed);
    assert!(installation.logs.iter().any(|l| l == "npm install -g @tools/fs"));

    manager.uninstall("u1", "fs").await.unwrap();
    let installations = manager.list_installations("u1").await.unwrap();
    assert_eq!(installations[0].status, InstallationStatus::Uninstalled);
    assert!(installations[0].logs.iter().any(|l| l == "npm uninstall -g @tools/fs"));
}

#[tokio::test]
async fn test_failing_package_manager_records_stderr() {
    let dir = TempDir::new().unwrap();
    let npm = write_script(dir.path(), "npm", "echo 'npm ERR! code E404' >&2\nexit 1");

    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(
        ServerDescriptor::stdio("fs", "Filesystem", LaunchSpec::new("fs-server")).with_package("@tools/fs"),
    );
    let mut config = ManagerConfig::default();
    config.commands.npm = npm;
    let manager = manager_with(catalog, config);

    let request = InstallRequest::new("u1", "fs", InstallMethod::RegistryPackage);
    let installation = manager.install_and_wait(request).await.unwrap();

    assert_eq!(installation.status, InstallationStatus::Failed);
    assert!(installation.error.unwrap().contains("E404"));
    assert!(installation.logs.iter().any(|l| l.contains("E404")));
}

/// Fake container CLI: records each invocation and exits with the given
/// code for `pull` and `run`
fn fake_docker(dir: &Path, pull_exit: i32, run_exit: i32) -> (String, PathBuf) {
    let calls = dir.join("calls");
    let body = format!(
        "echo \"$*\" >> '{}'\ncase \"$1\" in\n  pull) exit {pull_exit} ;;\n  run) exit {run_exit} ;;\nesac",
        calls.display()
    );
    (write_script(dir, "docker", &body), calls)
}

fn calls(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn container_manager(docker: String) -> ToolServerManager {
    let catalog = Arc::new(InMemoryServerCatalog::new());
    catalog.insert(
        ServerDescriptor::stdio("fs", "Filesystem", LaunchSpec::new("fs-server")).with_image("tools/fs"),
    );
    let mut config = ManagerConfig::default();
    config.commands.docker = docker;
    manager_with(catalog, config)
}

fn container_request() -> InstallRequest {
    InstallRequest::new("u1", "fs", InstallMethod::ContainerImage)
        .with_env("TOKEN", "t0k")
        .with_auto_start(false)
}

#[tokio::test]
async fn test_container_install_pulls_runs_and_removes() {
    let dir = TempDir::new().unwrap();
    let (docker, log) = fake_docker(dir.path(), 0, 0);
    let manager = container_manager(docker);

    let installation = manager.install_and_wait(container_request()).await.unwrap();
    assert_eq!(installation.status, InstallationStatus::Installed);
    assert_eq!(
        calls(&log),
        vec!["pull tools/fs", "run -d --name lodge-fs-u1 -e TOKEN=t0k tools/fs"]
    );

    manager.uninstall("u1", "fs").await.unwrap();
    assert_eq!(calls(&log).last().map(String::as_str), Some("rm -f lodge-fs-u1"));
    let installations = manager.list_installations("u1").await.unwrap();
    assert_eq!(installations[0].status, InstallationStatus::Uninstalled);
}

#[tokio::test]
async fn test_container_pull_failure_skips_run() {
    let dir = TempDir::new().unwrap();
    let (docker, log) = fake_docker(dir.path(), 1, 0);
    let manager = container_manager(docker);

    let installation = manager.install_and_wait(container_request()).await.unwrap();
    assert_eq!(installation.status, InstallationStatus::Failed);
    assert_eq!(calls(&log), vec!["pull tools/fs"]);
}

#[tokio::test]
async fn test_container_run_failure_fails_installation() {
    let dir = TempDir::new().unwrap();
    let (docker, log) = fake_docker(dir.path(), 0, 125);
    let manager = container_manager(docker);

    let installation = manager.install_and_wait(container_request()).await.unwrap();
    assert_eq!(installation.status, InstallationStatus::Failed);
    assert!(installation.error.unwrap().contains("exited with"));
    assert_eq!(calls(&log).len(), 2);
}
