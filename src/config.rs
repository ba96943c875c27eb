//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$LISTARCHIVE_CONFIG` (environment variable)
//! 2. `~/.config/listarchive/config.toml` (Linux/macOS)
//!    `%APPDATA%\listarchive\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Archive database settings.
    pub database: DatabaseConfig,
    /// Ingestion limits and checks.
    pub ingest: IngestConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override directory for the log file.
    pub log_dir: Option<PathBuf>,
}

/// Archive database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite archive. Defaults to the user data directory.
    pub path: Option<PathBuf>,
    /// Seconds to wait for another run holding the write lock.
    pub busy_timeout_secs: u64,
}

/// Ingestion limits and checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Messages larger than this (bytes) are skipped and logged.
    pub max_message_size: u64,
    /// Skip messages whose `List-Id` names a different list.
    pub check_list_id: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_dir: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_secs: 30,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024, // 64 MB
            check_list_id: true,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("LISTARCHIVE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("listarchive").join("config.toml"))
}

/// Archive path: explicit override, then config, then the user data directory.
pub fn database_path(config: &Config, cli_override: Option<PathBuf>) -> PathBuf {
    cli_override
        .or_else(|| config.database.path.clone())
        .unwrap_or_else(|| data_dir().join("archive.db"))
}

/// Directory for the log file.
pub fn log_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.log_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("listarchive")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("listarchive")
}
