//! Configuration management for the TermRelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrelay/config.toml`.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:23456"
//!
//! [[targets]]
//! id = "bot-1"
//! path = "/srv/bots/bot-1"
//!
//! [targets.components.main]
//! command = "python3"
//! args = ["bot.py"]
//! autostart = true
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{is_valid_target_id, Component, SessionKey, TerminalSize, DEFAULT_HISTORY_DEPTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::ServerSettings;
use crate::process::{CommandSpec, DEFAULT_BACKLOG_CAPACITY};
use crate::session::ring_buffer::{DEFAULT_RING_CAPACITY, DEFAULT_RING_MAX_BYTES};
use crate::session::viewer::{DEFAULT_VIEWER_QUEUE_CAPACITY, MIN_VIEWER_QUEUE_CAPACITY};
use crate::session::{HostSettings, RegistrySettings};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address like 127.0.0.1:23456, got {0}")]
    InvalidBindAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_frame_size must be at least 1024 bytes, got {0}")]
    InvalidMaxFrameSize(usize),

    #[error("ring_capacity must be between 1 and 100000, got {0}")]
    InvalidRingCapacity(usize),

    #[error("viewer_queue_capacity must be at least {min}, got {got}")]
    InvalidViewerQueueCapacity { min: usize, got: usize },

    #[error("pty size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("invalid target id: {0:?}")]
    InvalidTargetId(String),

    #[error("duplicate target id: {0}")]
    DuplicateTarget(String),

    #[error("target {target}: unknown component {component:?}")]
    UnknownComponent { target: String, component: String },

    #[error("target {target}: command for {component} not found: {command}")]
    InvalidCommand {
        target: String,
        component: String,
        command: String,
    },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermRelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket relay listener.
    pub server: ServerConfig,

    /// Session host and ring buffer limits.
    pub relay: RelayConfig,

    /// Pseudo-terminal settings for spawned processes.
    pub pty: PtyConfig,

    /// Managed targets and their components.
    pub targets: Vec<TargetConfig>,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for terminal connections.
    pub bind: String,

    /// Maximum size of a single frame in bytes.
    pub max_frame_size: usize,

    /// Consecutive malformed frames tolerated before a connection is closed.
    pub max_protocol_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Output chunks retained per session for replay.
    pub ring_capacity: usize,

    /// Byte budget of the replay buffer.
    pub ring_max_bytes: usize,

    /// Frames queued per viewer before it is dropped.
    pub viewer_queue_capacity: usize,

    /// Seconds a finished session without viewers is kept for reconnects.
    pub teardown_grace_secs: u64,

    /// History depth used by clients that do not ask for one.
    pub default_history_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtyConfig {
    pub rows: u16,
    pub cols: u16,

    /// Output chunks a process keeps for sessions created after it started.
    pub backlog_capacity: usize,

    /// Seconds a graceful stop waits before killing.
    pub stop_timeout_secs: u64,
}

/// One managed target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TargetConfig {
    pub id: String,

    /// Base directory; relative component `cwd`s resolve against it.
    pub path: PathBuf,

    /// Keyed by component name (`main`, `napcat`, `napcat-ada`).
    pub components: BTreeMap<String, ComponentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ComponentConfig {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,

    /// Start when the daemon starts.
    pub autostart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:23456".to_string(),
            max_frame_size: protocol::MAX_FRAME_SIZE,
            max_protocol_errors: 16,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            ring_max_bytes: DEFAULT_RING_MAX_BYTES,
            viewer_queue_capacity: DEFAULT_VIEWER_QUEUE_CAPACITY,
            teardown_grace_secs: 5,
            default_history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            rows: size.rows,
            cols: size.cols,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            stop_timeout_secs: 5,
        }
    }
}

impl TargetConfig {
    fn working_dir(&self, component: &ComponentConfig) -> Option<PathBuf> {
        match (&component.cwd, self.path.as_os_str().is_empty()) {
            (Some(cwd), _) if cwd.is_absolute() => Some(cwd.clone()),
            (Some(cwd), false) => Some(self.path.join(cwd)),
            (Some(cwd), true) => Some(cwd.clone()),
            (None, false) => Some(self.path.clone()),
            (None, true) => None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
}

fn command_exists(command: &str, working_dir: Option<&Path>) -> bool {
    let path = Path::new(command);
    if path.is_absolute() {
        path.exists()
    } else if command.contains('/') {
        working_dir.map(|dir| dir.join(path)).unwrap_or_else(|| path.to_path_buf()).exists()
    } else {
        which::which(command).is_ok()
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - TERMRELAY_BIND: Override the relay listen address
    /// - TERMRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TERMRELAY_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("TERMRELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.server.max_frame_size < 1024 {
            return Err(ConfigError::InvalidMaxFrameSize(self.server.max_frame_size));
        }

        if self.relay.ring_capacity < 1 || self.relay.ring_capacity > 100_000 {
            return Err(ConfigError::InvalidRingCapacity(self.relay.ring_capacity));
        }

        if self.relay.viewer_queue_capacity < MIN_VIEWER_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidViewerQueueCapacity {
                min: MIN_VIEWER_QUEUE_CAPACITY,
                got: self.relay.viewer_queue_capacity,
            });
        }

        if self.pty.rows == 0 || self.pty.cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: self.pty.rows,
                cols: self.pty.cols,
            });
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !is_valid_target_id(&target.id) {
                return Err(ConfigError::InvalidTargetId(target.id.clone()));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }
            for (name, component) in &target.components {
                if name.parse::<Component>().is_err() {
                    return Err(ConfigError::UnknownComponent {
                        target: target.id.clone(),
                        component: name.clone(),
                    });
                }
                let working_dir = target.working_dir(component);
                if !command_exists(&component.command, working_dir.as_deref()) {
                    return Err(ConfigError::InvalidCommand {
                        target: target.id.clone(),
                        component: name.clone(),
                        command: component.command.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Commands for every configured component, keyed by session.
    ///
    /// Entries whose component name does not parse are skipped; `validate`
    /// reports them.
    pub fn command_specs(&self) -> Vec<(SessionKey, CommandSpec)> {
        let mut specs = Vec::new();
        for target in &self.targets {
            for (name, component) in &target.components {
                let Ok(role) = name.parse::<Component>() else {
                    continue;
                };
                let spec = CommandSpec {
                    program: component.command.clone(),
                    args: component.args.clone(),
                    cwd: target.working_dir(component),
                    env: component.env.clone(),
                };
                specs.push((SessionKey::new(target.id.clone(), role), spec));
            }
        }
        specs
    }

    /// Components to start with the daemon.
    pub fn autostart_keys(&self) -> Vec<SessionKey> {
        let mut keys = Vec::new();
        for target in &self.targets {
            for (name, component) in &target.components {
                if !component.autostart {
                    continue;
                }
                if let Ok(role) = name.parse::<Component>() {
                    keys.push(SessionKey::new(target.id.clone(), role));
                }
            }
        }
        keys
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            host: HostSettings {
                ring_capacity: self.relay.ring_capacity,
                ring_max_bytes: self.relay.ring_max_bytes,
                viewer_queue_capacity: self.relay.viewer_queue_capacity,
                max_frame_size: self.server.max_frame_size,
            },
            teardown_grace: Duration::from_secs(self.relay.teardown_grace_secs),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            max_frame_size: self.server.max_frame_size,
            max_protocol_errors: self.server.max_protocol_errors,
            default_history_depth: self.relay.default_history_depth,
        }
    }

    pub fn pty_size(&self) -> TerminalSize {
        TerminalSize::new(self.pty.rows, self.pty.cols)
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[daemon]
log_level = "debug"

[server]
bind = "0.0.0.0:9000"

[relay]
ring_capacity = 300
teardown_grace_secs = 0

[[targets]]
id = "bot-1"
path = "/srv/bots/bot-1"

[targets.components.main]
command = "/bin/sh"
args = ["-c", "python3 bot.py"]
autostart = true

[targets.components.napcat]
command = "sh"
cwd = "napcat"
env = { NAPCAT_QUICK = "1" }
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.bind, "127.0.0.1:23456");
        assert_eq!(config.server.max_frame_size, 1024 * 1024);
        assert_eq!(config.server.max_protocol_errors, 16);
        assert_eq!(config.relay.ring_capacity, 1000);
        assert_eq!(config.relay.viewer_queue_capacity, 256);
        assert_eq!(config.relay.default_history_depth, 500);
        assert_eq!(config.pty.rows, 24);
        assert_eq!(config.pty.cols, 80);
        assert_eq!(config.pty.backlog_capacity, 300);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("termrelay"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_targets() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.relay.ring_capacity, 300);
        // Unspecified values keep their defaults.
        assert_eq!(config.relay.viewer_queue_capacity, 256);
        assert_eq!(config.targets.len(), 1);

        let target = &config.targets[0];
        assert_eq!(target.id, "bot-1");
        assert_eq!(target.components.len(), 2);
        let main = &target.components["main"];
        assert_eq!(main.args, vec!["-c".to_string(), "python3 bot.py".to_string()]);
        assert!(main.autostart);
        assert_eq!(
            target.components["napcat"].env.get("NAPCAT_QUICK").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_command_specs_resolve_working_dir() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let specs = config.command_specs();
        assert_eq!(specs.len(), 2);

        let (key, spec) = &specs[0];
        assert_eq!(*key, SessionKey::new("bot-1", Component::Main));
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/bots/bot-1")));

        let (key, spec) = &specs[1];
        assert_eq!(*key, SessionKey::new("bot-1", Component::Napcat));
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/bots/bot-1/napcat")));
    }

    #[test]
    fn test_autostart_keys() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.autostart_keys(),
            vec![SessionKey::new("bot-1", Component::Main)]
        );
    }

    #[test]
    fn test_registry_settings() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let settings = config.registry_settings();
        assert_eq!(settings.host.ring_capacity, 300);
        assert_eq!(settings.host.max_frame_size, config.server.max_frame_size);
        assert_eq!(settings.teardown_grace, Duration::ZERO);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[relay]
ring_capacity = "lots"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::from_toml(SAMPLE).unwrap();
        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.bind = "127.0.0.1:4000".to_string();
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termrelay"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_bind() {
        std::env::remove_var("TERMRELAY_LOG_LEVEL");
        std::env::set_var("TERMRELAY_BIND", "127.0.0.1:7000");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.bind, "127.0.0.1:7000");

        std::env::remove_var("TERMRELAY_BIND");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TERMRELAY_BIND", "");
        std::env::set_var("TERMRELAY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("TERMRELAY_BIND");
        std::env::remove_var("TERMRELAY_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("TERMRELAY_BIND");
        std::env::set_var("TERMRELAY_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "trace");

        std::env::remove_var("TERMRELAY_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_sample_config() {
        assert!(Config::from_toml(SAMPLE).unwrap().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_bind() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_ring_capacity_bounds() {
        let mut config = Config::default();
        config.relay.ring_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRingCapacity(0)));
        config.relay.ring_capacity = 100_000;
        assert!(config.validate().is_ok());
        config.relay.ring_capacity = 100_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_viewer_queue_capacity() {
        let mut config = Config::default();
        config.relay.viewer_queue_capacity = 2;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidViewerQueueCapacity { min: 4, got: 2 })
        );
    }

    #[test]
    fn test_validate_frame_size_and_pty() {
        let mut config = Config::default();
        config.server.max_frame_size = 10;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFrameSize(10)));

        let mut config = Config::default();
        config.pty.cols = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { .. })
        ));
    }

    #[test]
    fn test_validate_target_errors() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.targets.push(config.targets[0].clone());
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateTarget("bot-1".to_string()))
        );

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.targets[0].id = "bad/id".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTargetId(_))
        ));

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.targets[0]
            .components
            .insert("worker".to_string(), ComponentConfig::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn test_validate_missing_command() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.targets[0]
            .components
            .get_mut("main")
            .unwrap()
            .command = "/nonexistent/termrelay-command".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCommand { .. })
        ));

        config.targets[0].components.get_mut("main").unwrap().command =
            "definitely-not-a-real-command-12345".to_string();
        assert!(config.validate().is_err());
    }
}
