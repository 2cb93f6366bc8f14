//! Configuration management for the SXM coordinator.
//!
//! Loads settings, in priority order, from:
//! 1. Environment variables (highest priority)
//! 2. A TOML configuration file
//! 3. Hardcoded defaults (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level coordinator configuration (spec §4.2, §4.5.3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Directory the persistent registry's three JSON files live under.
    pub persist_root: PathBuf,
    /// Delay, in seconds, between watchdog firings (§4.5.3).
    pub watchdog_interval_secs: u64,
    /// Poll interval for `pre_deactivate_hook`'s drain loop (§4.7).
    pub drain_poll_interval_secs: u64,
    /// Maximum time `pre_deactivate_hook` waits for `reqs_outstanding` to
    /// reach zero before giving up and marking the mirror failed (§4.7).
    pub drain_timeout_secs: u64,
    /// Default for `verify_dest` when a caller does not specify one.
    pub default_verify_dest: bool,
    pub logging: LoggingConfig,
}

/// Logging configuration (§10.1 of SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). Overridden by `RUST_LOG`.
    pub level: String,
    /// Directory for rotated log files; `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            persist_root: PathBuf::from("/var/run/nonpersistent"),
            watchdog_interval_secs: 5,
            drain_poll_interval_secs: 1,
            drain_timeout_secs: 150,
            default_verify_dest: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            json_format: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    FileRead(PathBuf, String),
    #[error("failed to parse config file: {0}")]
    Parse(String),
}

impl CoordinatorConfig {
    /// Load configuration from the standard locations plus environment
    /// variable overrides. Never fails: a missing or malformed file falls
    /// back to defaults, matching the registry's own advisory-load
    /// philosophy (§3.3).
    pub fn load() -> Self {
        let mut config = Self::find_config_file()
            .and_then(|path| Self::load_from_file(&path).ok())
            .unwrap_or_default();

        config.apply_env_overrides();
        config
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            std::env::var("SXM_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/sxm/coordinator.toml")),
            Some(PathBuf::from("./sxm-coordinator.toml")),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("SXM_PERSIST_ROOT") {
            self.persist_root = PathBuf::from(root);
        }
        if let Ok(v) = std::env::var("SXM_WATCHDOG_INTERVAL_SECS") {
            if let Ok(v) = v.parse() {
                self.watchdog_interval_secs = v;
            }
        }
        if let Ok(v) = std::env::var("SXM_DRAIN_TIMEOUT_SECS") {
            if let Ok(v) = v.parse() {
                self.drain_timeout_secs = v;
            }
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }
}
