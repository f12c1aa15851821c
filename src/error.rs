//! Error types for the process monitor
//!
//! This module defines all error types used throughout the crate, the shared
//! last-error slot that backs `get_last_error()`, and user-facing messages.
//!
//! Error variants use `#[source]` to preserve error chains for better
//! observability and debugging.

use crate::monitor::EventKind;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Simple error type for wrapping string messages while implementing `std::error::Error`
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StringError(pub String);

impl StringError {
    /// Create a new `StringError` from a string message
    pub fn new(msg: impl Into<String>) -> Box<Self> {
        Box::new(Self(msg.into()))
    }
}

/// Main error type for the process monitor
#[derive(Debug, Error)]
pub enum ProcessMonitorError {
    /// The platform notification facility could not be reached or rejected a query
    /// Preserves the underlying error source for full error chain transparency
    #[error("Failed to subscribe to process notifications: {0}")]
    Subscription(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A start call was made while monitoring is already active
    #[error("Process monitor is already running")]
    AlreadyRunning,

    /// Process-specific monitoring was requested without any process configuration
    #[error("At least one process configuration is required")]
    NoProcessConfigs,

    /// A user-supplied start/stop callback panicked
    #[error("{kind} callback for '{process_name}' failed: {message}")]
    CallbackFault {
        /// Configured process name the callback belongs to
        process_name: String,
        /// Transition that triggered the callback
        kind: EventKind,
        /// Panic payload rendered as text
        message: String,
    },

    /// A worker thread could not be spawned
    #[error("Failed to start monitoring thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// A wire record carried an unknown event kind tag
    #[error("Malformed process event record: unknown event type '{0}'")]
    MalformedEvent(String),

    /// Configuration error
    /// Preserves the underlying error source for full error chain transparency
    #[error("Configuration error: {0}")]
    ConfigError(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Windows API error
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsApiError(#[from] windows::core::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for process monitor operations
pub type Result<T> = std::result::Result<T, ProcessMonitorError>;

/// Shared, human-readable record of the most recent failure
///
/// Cloning yields another handle to the same slot. The bridge, the lifecycle
/// controller and the consumer pipeline all write into one slot so a host can
/// retrieve the last failure after any call.
#[derive(Debug, Clone, Default)]
pub struct LastError(Arc<Mutex<String>>);

impl LastError {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing any previous message
    pub fn set(&self, error: &ProcessMonitorError) {
        *self.0.lock() = error.to_string();
    }

    /// Record a plain message
    pub fn set_message(&self, message: impl Into<String>) {
        *self.0.lock() = message.into();
    }

    /// Current message, empty when no failure has been recorded
    pub fn get(&self) -> String {
        self.0.lock().clone()
    }

    /// Forget the recorded failure
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Render a `catch_unwind` payload as text
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Convert an error to a user-friendly message
///
/// This function takes a `ProcessMonitorError` and returns a message suitable
/// for displaying to end users, including troubleshooting hints for the
/// common failure modes.
pub fn get_user_friendly_error(error: &ProcessMonitorError) -> String {
    match error {
        ProcessMonitorError::Subscription(e) => {
            format!(
                "Unable to receive process notifications:\n\n{e}\n\n\
                 Please ensure:\n\
                 - The Windows Management Instrumentation service is running\n\
                 - You have permission to query Win32_Process events\n\
                 - Or select the polling source in the configuration"
            )
        }
        ProcessMonitorError::AlreadyRunning => "Process monitoring is already active.\n\n\
             Stop the current session before starting a new one."
            .to_string(),
        ProcessMonitorError::NoProcessConfigs => "No processes were selected for monitoring.\n\n\
             Add at least one process name to watch."
            .to_string(),
        ProcessMonitorError::CallbackFault {
            process_name, kind, ..
        } => {
            format!(
                "The {kind} handler for {process_name} failed.\n\n\
                 Monitoring continues; other handlers are not affected."
            )
        }
        ProcessMonitorError::ThreadSpawn(_) => "Failed to start the monitoring thread.\n\n\
             The system may be low on resources.\n\
             Try restarting the application."
            .to_string(),
        ProcessMonitorError::MalformedEvent(tag) => {
            format!(
                "Received an unreadable process event (type '{tag}').\n\n\
                 The event was skipped."
            )
        }
        ProcessMonitorError::ConfigError(_) => "Failed to load or save configuration.\n\n\
             Your settings may not persist.\n\
             Check that you have write permissions to:\n\
             %APPDATA%\\ProcessMonitor"
            .to_string(),
        #[cfg(windows)]
        ProcessMonitorError::WindowsApiError(e) => {
            format!(
                "A Windows API error occurred:\n\n{e}\n\n\
                 Please ensure your Windows installation is up to date."
            )
        }
        ProcessMonitorError::IoError(e) => {
            format!(
                "A file system error occurred:\n\n{e}\n\n\
                 Please check file permissions and disk space."
            )
        }
        ProcessMonitorError::JsonError(e) => {
            format!(
                "Configuration file is corrupted:\n\n{e}\n\n\
                 The application will use default settings."
            )
        }
    }
}
