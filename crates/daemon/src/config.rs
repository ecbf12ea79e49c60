//! Configuration management for the termshare daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termshare/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::LaunchConfig;
use termshare_protocol::UserServerFlags;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("token deadline_secs must be between 1 and 300, got {0}")]
    InvalidTokenDeadline(u64),

    #[error("launcher startup_timeout_secs must be between 1 and 300, got {0}")]
    InvalidStartupTimeout(u64),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("launcher mode must not be empty")]
    EmptyLauncherMode,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Accepted range for timeouts, in seconds.
const TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u64> = 1..=300;

/// Main configuration structure for the termshare daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Terminal defaults for new users.
    pub session: SessionConfig,

    /// Claim token settings.
    pub token: TokenConfig,

    /// User-server launch settings.
    pub launcher: LauncherConfig,

    /// Supervisor notification settings.
    pub supervisor: SupervisorConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base directory for a relative `log_file`.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; logs go to stderr only when unset. Relative paths
    /// are resolved against `data_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Terminal defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell spawned for each user.
    pub default_shell: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,
}

/// Claim token settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    /// Seconds a token stays claimable.
    pub deadline_secs: u64,
}

/// User-server launch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    /// Deployment mode passed to the user server.
    pub mode: String,

    /// Program that runs the user server (defaults to this executable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// User-server entry point. Launching is skipped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_server_path: Option<PathBuf>,

    /// Seconds the user server has to report startup.
    pub startup_timeout_secs: u64,
}

/// Supervisor notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Also write removal events to stdout as JSON lines.
    pub notify_stdout: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            cols: 80,
            rows: 24,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { deadline_secs: 5 }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: "development".to_string(),
            program: None,
            user_server_path: None,
            startup_timeout_secs: 5,
        }
    }
}

impl DaemonConfig {
    /// Returns the resolved log file path, if file logging is enabled.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_ref().map(|file| {
            if file.is_absolute() {
                file.clone()
            } else {
                self.data_dir.join(file)
            }
        })
    }
}

impl TokenConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl LauncherConfig {
    /// Builds the launcher settings, or `None` when no user server is
    /// configured.
    pub fn launch_config(&self) -> Result<Option<LaunchConfig>> {
        let Some(user_server_path) = &self.user_server_path else {
            return Ok(None);
        };
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("Failed to resolve current executable")?,
        };
        Ok(Some(LaunchConfig {
            mode: self.mode.clone(),
            program,
            user_server_path: user_server_path.clone(),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            flags: UserServerFlags::default(),
        }))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termshare")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termshare")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMSHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMSHARE_ENV: Override the launcher mode
    /// - TERMSHARE_USER_SERVER_PATH: Override the user-server entry point
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_var("TERMSHARE_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(mode) = non_empty_var("TERMSHARE_ENV") {
            tracing::info!("Overriding launcher mode from environment: {}", mode);
            self.launcher.mode = mode;
        }

        if let Some(path) = non_empty_var("TERMSHARE_USER_SERVER_PATH") {
            tracing::info!("Overriding user_server_path from environment: {}", path);
            self.launcher.user_server_path = Some(PathBuf::from(path));
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !TIMEOUT_RANGE_SECS.contains(&self.token.deadline_secs) {
            return Err(ConfigError::InvalidTokenDeadline(self.token.deadline_secs));
        }

        if !TIMEOUT_RANGE_SECS.contains(&self.launcher.startup_timeout_secs) {
            return Err(ConfigError::InvalidStartupTimeout(
                self.launcher.startup_timeout_secs,
            ));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.launcher.mode.is_empty() {
            return Err(ConfigError::EmptyLauncherMode);
        }

        // Absolute shells must exist; bare names are looked up in PATH
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

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
