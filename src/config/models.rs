//! Configuration data models
//!
//! This module defines the data structures used for monitor configuration.

use serde::{Deserialize, Serialize};

/// Which notification source to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// WMI event subscriptions (Windows only; falls back to polling elsewhere)
    #[default]
    Wmi,
    /// Periodic process snapshots
    Polling,
}

/// A process name to watch, with its callback multiplicity rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedProcess {
    /// Process image name (e.g. `app.exe`), matched case-insensitively
    pub process_name: String,
    /// Fire the start callback for every new instance, not only the first
    #[serde(default = "default_true")]
    pub allow_multiple_start_callbacks: bool,
    /// Fire the stop callback for every exiting instance, not only the last
    #[serde(default = "default_true")]
    pub allow_multiple_stop_callbacks: bool,
}

impl WatchedProcess {
    /// Watch `process_name` with the default (per-instance) callback rules
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            allow_multiple_start_callbacks: true,
            allow_multiple_stop_callbacks: true,
        }
    }
}

/// Tunables of the monitoring engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Maximum queued events before the oldest are evicted (1-100000)
    pub queue_capacity: usize,
    /// Maximum remembered event signatures before half are evicted (2-100000)
    pub dedup_capacity: usize,
    /// Consumer wait timeout in milliseconds (50-1000)
    pub wait_timeout_ms: u64,
    /// Events drained per consumer batch (1-10000)
    pub drain_batch_size: usize,
    /// How long cleanup waits for the consumer thread in milliseconds (0-30000)
    pub cleanup_timeout_ms: u64,
    /// Notification source
    pub source: SourceKind,
    /// Polling source interval in milliseconds (100-60000)
    pub polling_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            dedup_capacity: 1000,
            wait_timeout_ms: 500,
            drain_batch_size: 100,
            cleanup_timeout_ms: 1000,
            source: SourceKind::Wmi,
            polling_interval_ms: 1000,
        }
    }
}

impl MonitorSettings {
    /// Copy with every value clamped into its supported range
    #[must_use]
    pub fn validated(&self) -> Self {
        Self {
            queue_capacity: self.queue_capacity.clamp(1, 100_000),
            dedup_capacity: self.dedup_capacity.clamp(2, 100_000),
            wait_timeout_ms: self.wait_timeout_ms.clamp(50, 1000),
            drain_batch_size: self.drain_batch_size.clamp(1, 10_000),
            cleanup_timeout_ms: self.cleanup_timeout_ms.min(30_000),
            source: self.source,
            polling_interval_ms: self.polling_interval_ms.clamp(100, 60_000),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine tunables
    pub settings: MonitorSettings,
    /// Processes with start/stop tracking
    pub watched_processes: Vec<WatchedProcess>,
}

fn default_true() -> bool {
    true
}
