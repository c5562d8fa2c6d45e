//! Configuration loading and defaults for idle-evict.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::monitor::MonitorOptions;

/// Validation errors for monitor settings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be a positive number of milliseconds, got {value}")]
    NonPositive { field: &'static str, value: i64 },
}

/// Main configuration for idle-evict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds between idle checks (default: 60000).
    pub check_interval_ms: i64,

    /// Milliseconds of inactivity before the cache is collected (default: 900000).
    pub minimum_idle_ms: i64,

    /// Command that performs the cache GC.
    /// If unset, the daemon only logs when the threshold is crossed.
    pub gc_command: Option<PathBuf>,

    /// Arguments passed to `gc_command`.
    pub gc_args: Vec<String>,

    /// Upper bound on one GC command run in milliseconds (default: 30000).
    pub gc_timeout_ms: u64,

    /// Unix socket that streams activity events.
    /// If unset, events are read from stdin.
    pub activity_socket: Option<PathBuf>,

    /// Dry run mode: log the GC command instead of executing it.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            minimum_idle_ms: 15 * 60_000,
            gc_command: None,
            gc_args: Vec::new(),
            gc_timeout_ms: 30_000,
            activity_socket: None,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(default_path) = Self::default_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }

    /// `$XDG_CONFIG_HOME/idle-evict/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("idle-evict").join("config.toml"))
    }

    /// Validate the timing settings into monitor options.
    pub fn monitor_options(&self) -> Result<MonitorOptions, ConfigError> {
        MonitorOptions::new(self.check_interval_ms, self.minimum_idle_ms)
    }

    pub fn gc_timeout(&self) -> Duration {
        Duration::from_millis(self.gc_timeout_ms)
    }
}

/// Convert a configured millisecond value, rejecting zero and negatives.
pub(crate) fn positive_ms(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    u64::try_from(value)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or(ConfigError::NonPositive { field, value })
}
