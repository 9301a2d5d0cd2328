//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Scripting runtime used to execute sessions
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Debug port settings
    #[serde(default)]
    pub inspector: InspectorConfig,

    /// Timeout and retry settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Console ring buffer settings
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Push channel settings
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Optional service directory registration
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Runtime executable configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Path or name of the runtime executable
    #[serde(default = "default_runtime")]
    pub path: PathBuf,

    /// Extra arguments placed before the inspect flag
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            path: default_runtime(),
            args: Vec::new(),
        }
    }
}

fn default_runtime() -> PathBuf {
    PathBuf::from("node")
}

impl RuntimeConfig {
    /// Resolve the runtime executable, searching PATH for bare names
    pub fn resolve(&self) -> Option<PathBuf> {
        if self.path.components().count() > 1 {
            return self.path.exists().then(|| self.path.clone());
        }
        which::which(&self.path).ok()
    }
}

/// Debug port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InspectorConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// The single well-known debug port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9229
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Deadline for a single inspector request
    #[serde(default = "default_request")]
    pub request_secs: u64,

    /// Number of connection attempts after spawn
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connection attempts
    #[serde(default = "default_connect_interval")]
    pub connect_interval_ms: u64,

    /// Delay between spawn and the first connection attempt
    #[serde(default = "default_connect_interval")]
    pub connect_initial_delay_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: default_request(),
            connect_attempts: default_connect_attempts(),
            connect_interval_ms: default_connect_interval(),
            connect_initial_delay_ms: default_connect_interval(),
        }
    }
}

fn default_request() -> u64 {
    30
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_connect_interval() -> u64 {
    1000
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    /// Connection retry policy derived from these settings
    pub fn retry_policy(&self) -> crate::inspector::RetryPolicy {
        crate::inspector::RetryPolicy {
            attempts: self.connect_attempts,
            initial_delay: Duration::from_millis(self.connect_initial_delay_ms),
            interval: Duration::from_millis(self.connect_interval_ms),
        }
    }
}

/// Console buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleConfig {
    /// Maximum number of console messages kept per session
    #[serde(default = "default_console_capacity")]
    pub capacity: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            capacity: default_console_capacity(),
        }
    }
}

fn default_console_capacity() -> usize {
    100
}

/// Broadcast channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    /// Per-observer queue length; a full queue disconnects the observer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

/// Daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Auto-exit after this many minutes with no active session
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,

    /// Number of finished sessions retained for inspection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: default_idle_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    30
}
fn default_history_limit() -> usize {
    20
}

/// Service directory registration
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Directory endpoint; registration is skipped when unset
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "devdock-debug-bridge".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::parse(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.inspector.port, 9229);
        assert_eq!(config.timeouts.connect_attempts, 5);
        assert_eq!(config.timeouts.request_secs, 30);
        assert_eq!(config.console.capacity, 100);
        assert!(config.registry.url.is_none());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
[runtime]
path = "/opt/node/bin/node"

[inspector]
port = 9333

[console]
capacity = 10
"#,
        )
        .unwrap();
        assert_eq!(config.runtime.path, PathBuf::from("/opt/node/bin/node"));
        assert_eq!(config.inspector.port, 9333);
        assert_eq!(config.inspector.host, "127.0.0.1");
        assert_eq!(config.console.capacity, 10);
        assert_eq!(config.broadcast.queue_capacity, 256);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::parse("[inspector]\nport = \"nope\""),
            Err(super::super::Error::ConfigParse(_))
        ));
    }
}
