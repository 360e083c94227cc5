//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use crate::queue::compactor::MAX_PULSETIME_SECS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Production server
    #[serde(default)]
    pub server: ServerConfig,

    /// Server used when a client runs in testing mode
    #[serde(default = "ServerConfig::testing")]
    pub server_testing: ServerConfig,

    /// Offline request queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            server_testing: ServerConfig::testing(),
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Address of a tracking server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Host name or IP address
    #[serde(default = "default_server_hostname")]
    pub hostname: String,

    /// TCP port
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// HTTP request timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_server_hostname(),
            port: default_server_port(),
            timeout_secs: default_server_timeout(),
        }
    }
}

impl ServerConfig {
    /// Defaults for the testing server
    pub fn testing() -> Self {
        Self {
            port: default_testing_port(),
            ..Self::default()
        }
    }

    /// `host:port` form used to build request URLs
    pub fn host(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Base URL of the REST API
    pub fn api_url(&self) -> String {
        format!("http://{}/api/0", self.host())
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Config("server.hostname must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("server.port must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn default_server_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    5600
}

fn default_testing_port() -> u16 {
    5666
}

fn default_server_timeout() -> u64 {
    10
}

/// Offline request queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Seconds to wait between connection attempts while disconnected
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Milliseconds to wait before re-polling an empty queue
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Merge buffered heartbeats each time the connection comes back
    #[serde(default = "default_compact_on_reconnect")]
    pub compact_on_reconnect: bool,

    /// Pulse tolerance used when a queued endpoint carries none
    #[serde(default = "default_pulsetime")]
    pub default_pulsetime_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval(),
            poll_interval_ms: default_poll_interval(),
            compact_on_reconnect: default_compact_on_reconnect(),
            default_pulsetime_secs: default_pulsetime(),
        }
    }
}

impl QueueConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings that would spin the worker or disable the fallback.
    ///
    /// Zero intervals are only usable when driving `DispatchLoop::step` by
    /// hand, never for a running worker.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_interval_secs == 0 {
            return Err(Error::Config(
                "queue.reconnect_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("queue.poll_interval_ms must be non-zero".to_string()));
        }
        if !(0.0..=MAX_PULSETIME_SECS).contains(&self.default_pulsetime_secs) {
            return Err(Error::Config(format!(
                "queue.default_pulsetime_secs must be between 0 and {}",
                MAX_PULSETIME_SECS
            )));
        }
        Ok(())
    }
}

fn default_reconnect_interval() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

fn default_compact_on_reconnect() -> bool {
    true
}

fn default_pulsetime() -> f64 {
    30.0
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.server_testing.validate()?;
        self.queue.validate()
    }

    /// Server settings for the requested mode
    pub fn server_for(&self, testing: bool) -> &ServerConfig {
        if testing {
            &self.server_testing
        } else {
            &self.server
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the directory holding durable request queues
    ///
    /// `$XDG_DATA_HOME/beacon/queued/`
    pub fn queue_dir() -> PathBuf {
        Self::data_dir().join("queued")
    }

    /// Returns the state directory path (daily log files)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host(), "127.0.0.1:5600");
        assert_eq!(config.queue.reconnect_interval(), Duration::from_secs(10));
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(100));
        assert!(config.queue.compact_on_reconnect);
        assert_eq!(config.queue.default_pulsetime_secs, 30.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_testing_server_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server_for(true).port, 5666);
        assert_eq!(config.server_for(false).port, 5600);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "tracker.local"
port = 8080

[queue]
reconnect_interval_secs = 3
compact_on_reconnect = false

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.api_url(), "http://tracker.local:8080/api/0");
        assert_eq!(config.queue.reconnect_interval_secs, 3);
        assert!(!config.queue.compact_on_reconnect);
        assert_eq!(config.queue.poll_interval_ms, 100);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_queue_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());

        let config = QueueConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = QueueConfig {
            reconnect_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = QueueConfig {
            default_pulsetime_secs: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_busy_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\npoll_interval_ms = 0\n").unwrap();

        match Config::load_from(&path) {
            Err(Error::Config(message)) => assert!(message.contains("poll_interval_ms")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());

        let config = ServerConfig {
            hostname: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
