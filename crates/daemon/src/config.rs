//! Configuration management for the clawdeck daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/clawdeck/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::environment::DEFAULT_NAMESPACE_PREFIX;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 127.0.0.1:7681, got {0}")]
    InvalidBindAddr(String),

    #[error("access_token must not be empty when set")]
    EmptyAccessToken,

    #[error("{name} must be greater than 0")]
    ZeroInterval { name: &'static str },

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("namespace_prefixes must not contain empty entries")]
    EmptyNamespacePrefix,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the clawdeck daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Shell environment policy.
    pub environment: EnvironmentConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,

    /// Shared bearer token. Every terminal request is admitted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Which process bridge spawns shells.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// In-process pty via `portable-pty`.
    #[default]
    Native,
    /// External `script(1)` helper over pipes.
    Script,
}

impl std::str::FromStr for BridgeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(BridgeKind::Native),
            "script" => Ok(BridgeKind::Script),
            other => Err(format!("unknown bridge '{}', expected native or script", other)),
        }
    }
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to use for new sessions.
    pub default_shell: String,

    /// Working directory for new shells.
    pub workspace_dir: PathBuf,

    /// Process bridge.
    pub bridge: BridgeKind,

    /// Seconds between heartbeat pings on each stream.
    pub heartbeat_secs: u64,

    /// Seconds between reaper sweeps.
    pub reap_interval_secs: u64,

    /// Seconds without activity before a session is reaped.
    pub idle_timeout_secs: u64,
}

/// Shell environment policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Name prefixes passed through in addition to the fixed allow-list.
    pub namespace_prefixes: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7681".to_string(),
            access_token: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            workspace_dir: default_workspace_dir(),
            bridge: BridgeKind::Native,
            heartbeat_secs: 15,
            reap_interval_secs: 300,
            idle_timeout_secs: 1800,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            namespace_prefixes: vec![DEFAULT_NAMESPACE_PREFIX.to_string()],
        }
    }
}

impl SessionConfig {
    /// Heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Reaper period.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Inactivity limit.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// The configured workspace directory if it exists, else the home directory.
    pub fn resolved_workspace_dir(&self) -> PathBuf {
        if self.workspace_dir.is_dir() {
            return self.workspace_dir.clone();
        }
        let fallback = home_dir();
        tracing::debug!(
            workspace = %self.workspace_dir.display(),
            fallback = %fallback.display(),
            "Workspace directory missing, using home"
        );
        fallback
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clawdeck")
        .join("config.toml")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Returns the default workspace directory.
fn default_workspace_dir() -> PathBuf {
    home_dir().join(".openclaw").join("workspace")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CLAWDECK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - CLAWDECK_BIND_ADDR: Override the HTTP bind address
    /// - CLAWDECK_ACCESS_TOKEN: Set the shared access token
    /// - CLAWDECK_SHELL: Override the default shell
    /// - CLAWDECK_WORKSPACE_DIR: Override the shell working directory
    /// - CLAWDECK_BRIDGE: Override the process bridge (native, script)
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_override("CLAWDECK_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(addr) = env_override("CLAWDECK_BIND_ADDR") {
            tracing::info!("Overriding bind_addr from environment: {}", addr);
            self.server.bind_addr = addr;
        }

        if let Some(token) = env_override("CLAWDECK_ACCESS_TOKEN") {
            tracing::info!("Access token set from environment");
            self.server.access_token = Some(token);
        }

        if let Some(shell) = env_override("CLAWDECK_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(dir) = env_override("CLAWDECK_WORKSPACE_DIR") {
            tracing::info!("Overriding workspace_dir from environment: {}", dir);
            self.session.workspace_dir = PathBuf::from(dir);
        }

        if let Some(bridge) = env_override("CLAWDECK_BRIDGE") {
            match bridge.parse() {
                Ok(kind) => {
                    tracing::info!("Overriding bridge from environment: {}", bridge);
                    self.session.bridge = kind;
                }
                Err(e) => tracing::warn!("Ignoring CLAWDECK_BRIDGE: {}", e),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if matches!(&self.server.access_token, Some(token) if token.trim().is_empty()) {
            return Err(ConfigError::EmptyAccessToken);
        }

        for (name, value) in [
            ("heartbeat_secs", self.session.heartbeat_secs),
            ("reap_interval_secs", self.session.reap_interval_secs),
            ("idle_timeout_secs", self.session.idle_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }

        // Absolute shells must exist; bare names must resolve on PATH
        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if self
            .environment
            .namespace_prefixes
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(ConfigError::EmptyNamespacePrefix);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Parses the bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.server.bind_addr.clone()))
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

    /// Serialize for display, with the access token masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.server.access_token.is_some() {
            shown.server.access_token = Some("********".to_string());
        }
        shown.to_toml()
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
