//! Manager configuration

use std::path::PathBuf;
use std::time::Duration;

/// External programs used by the method executors
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Package manager for registry installs
    pub npm: String,
    /// Container runtime CLI
    pub docker: String,
    /// Downloader for binary installs, invoked as `<downloader> -fsSL -o <dest> <url>`
    pub downloader: String,
    /// Where binary installs land unless the installation overrides it
    pub bin_dir: PathBuf,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            npm: "npm".to_string(),
            docker: "docker".to_string(),
            downloader: "curl".to_string(),
            bin_dir: std::env::temp_dir().join("lodge-bin"),
        }
    }
}

/// Configuration for the tool server manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Time between health sweeps
    pub health_check_interval: Duration,
    /// Consecutive probe failures tolerated before a forced disconnect
    pub failure_threshold: u32,
    /// Deadline for a single health probe
    pub probe_timeout: Duration,
    /// Probe latency above which an installation counts as degraded
    pub degraded_latency: Duration,
    /// Connection limit per server unless the descriptor sets one
    pub max_connections_per_server: usize,
    /// Default wait for a pool slot
    pub acquire_timeout: Duration,
    /// Wait window for the handshake and discovery after connecting
    pub discovery_timeout: Duration,
    /// External programs
    pub commands: CommandConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            failure_threshold: 5,
            probe_timeout: Duration::from_secs(5),
            degraded_latency: Duration::from_millis(1000),
            max_connections_per_server: 5,
            acquire_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(10),
            commands: CommandConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load config from `LODGE_*` environment variables, keeping defaults for
    /// anything missing or unparsable
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(secs) = number("LODGE_HEALTH_INTERVAL_SECS") {
            config.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(n) = number("LODGE_FAILURE_THRESHOLD").and_then(|n| u32::try_from(n).ok()) {
            config.failure_threshold = n;
        }
        if let Some(ms) = number("LODGE_PROBE_TIMEOUT_MS") {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = number("LODGE_MAX_CONNECTIONS").and_then(|n| usize::try_from(n).ok()) {
            if n > 0 {
                config.max_connections_per_server = n;
            }
        }
        if let Some(ms) = number("LODGE_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = number("LODGE_DISCOVERY_TIMEOUT_MS") {
            config.discovery_timeout = Duration::from_millis(ms);
        }

        if let Some(npm) = lookup("LODGE_NPM") {
            config.commands.npm = npm;
        }
        if let Some(docker) = lookup("LODGE_DOCKER") {
            config.commands.docker = docker;
        }
        if let Some(downloader) = lookup("LODGE_DOWNLOADER") {
            config.commands.downloader = downloader;
        }
        if let Some(dir) = lookup("LODGE_BIN_DIR") {
            config.commands.bin_dir = PathBuf::from(dir);
        }

        config
    }
}
