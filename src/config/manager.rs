//! Configuration manager for loading and saving monitor configuration
//!
//! This module provides functionality to load and save configuration to
//! %APPDATA%\ProcessMonitor\config.json with atomic writes to prevent corruption.

use crate::config::models::AppConfig;
use crate::error::{ProcessMonitorError, Result, StringError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the path to the configuration file
    ///
    /// Returns: %APPDATA%\ProcessMonitor\config.json
    pub fn get_config_path() -> PathBuf {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata)
            .join("ProcessMonitor")
            .join("config.json")
    }

    /// Load configuration from the default location
    ///
    /// If the configuration file doesn't exist or is corrupt, returns default configuration.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(&Self::get_config_path())
    }

    /// Load configuration from an explicit path
    ///
    /// A missing or unparsable file yields the default configuration; read
    /// failures are returned.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(AppConfig::default());
        }

        let json = std::fs::read_to_string(path)?;

        match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => {
                info!(
                    "Configuration loaded from {} ({} watched processes)",
                    path.display(),
                    config.watched_processes.len()
                );
                Ok(config)
            }
            Err(e) => {
                warn!("Failed to parse configuration, using defaults: {e}");
                Ok(AppConfig::default())
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(config: &AppConfig) -> Result<()> {
        Self::save_to(config, &Self::get_config_path())
    }

    /// Save configuration to `path` with an atomic write
    ///
    /// Uses a temporary file and rename to ensure atomic write operation.
    pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
        let config_dir = path.parent().ok_or_else(|| {
            ProcessMonitorError::ConfigError(StringError::new("Invalid config path"))
        })?;
        std::fs::create_dir_all(config_dir)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, path)?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
