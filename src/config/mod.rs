//! Configuration management module
//!
//! This module handles loading, saving, and managing monitor configuration.
//! Configuration is stored in %APPDATA%\ProcessMonitor\config.json with atomic
//! writes to prevent corruption.

pub mod manager;
pub mod models;

pub use manager::ConfigManager;
pub use models::{AppConfig, MonitorSettings, SourceKind, WatchedProcess};
