//! Logging system initialization
//!
//! Sets up tracing-based logging with file output to
//! %APPDATA%\ProcessMonitor\monitor.log and rotation on startup keeping the
//! logs of the last 10 sessions.

use crate::error::{ProcessMonitorError, Result, StringError};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt};

/// Maximum number of historical log files to keep (monitor.log.1 through monitor.log.9)
const MAX_LOG_FILES: u8 = 9;

/// Directory holding the log files
///
/// %APPDATA%\ProcessMonitor, or `.\ProcessMonitor` when APPDATA is unset.
pub fn log_dir() -> PathBuf {
    let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(appdata).join("ProcessMonitor")
}

/// Initialize the logging system
///
/// Log level defaults to INFO but can be configured via `RUST_LOG` environment variable.
/// Rotates existing logs on startup to maintain a history of the last 10 sessions.
pub fn init_logging() -> Result<()> {
    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir)?;

    rotate_logs_on_startup(&log_dir.join("monitor.log"))?;

    // Rotation is handled above, per session rather than per time period
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix("monitor")
        .filename_suffix("log")
        .build(&log_dir)
        .map_err(|e| ProcessMonitorError::ConfigError(Box::new(e)))?;

    let subscriber = fmt()
        .with_writer(file_appender)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ProcessMonitorError::ConfigError(Box::new(e)))?;

    tracing::info!("process-monitor v{} started", env!("CARGO_PKG_VERSION"));

    Ok(())
}

/// Shift `monitor.log` to `monitor.log.1`, `.1` to `.2` and so on, dropping `.9`
///
/// A fresh `monitor.log` is created by the appender afterwards.
fn rotate_logs_on_startup(log_path: &Path) -> Result<()> {
    if !log_path.exists() {
        return Ok(());
    }

    let log_dir = log_path.parent().ok_or_else(|| {
        ProcessMonitorError::ConfigError(StringError::new("Invalid log path"))
    })?;
    let log_name = log_path
        .file_name()
        .ok_or_else(|| ProcessMonitorError::ConfigError(StringError::new("Invalid log filename")))?
        .to_string_lossy();

    let oldest_log = log_dir.join(format!("{log_name}.{MAX_LOG_FILES}"));
    if oldest_log.exists() {
        std::fs::remove_file(&oldest_log)?;
    }

    for i in (1..MAX_LOG_FILES).rev() {
        let current_log = log_dir.join(format!("{log_name}.{i}"));
        if current_log.exists() {
            std::fs::rename(&current_log, log_dir.join(format!("{log_name}.{}", i + 1)))?;
        }
    }

    std::fs::rename(log_path, log_dir.join(format!("{log_name}.1")))?;

    Ok(())
}
