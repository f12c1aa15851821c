//! `process-monitor` - Process lifecycle monitoring
//!
//! Observes process creation and termination and delivers them as an ordered,
//! deduplicated event stream, with optional per-process start/stop callbacks
//! that track how many instances of each watched name are running.
//!
//! Uses a producer/consumer architecture: a `NotificationSource` (WMI on
//! Windows, snapshot polling elsewhere) feeds a bounded drop-oldest
//! `EventQueue` from platform threads, and a dedicated consumer thread drains
//! it through the dedup filter into subscribers and the instance tracker.
//!
//! # Example
//!
//! ```no_run
//! use process_monitor::{MonitorSettings, ProcessConfig, ProcessMonitor};
//!
//! let monitor = ProcessMonitor::from_settings(&MonitorSettings::default());
//! monitor.start_process_specific(vec![
//!     ProcessConfig::new("notepad.exe")
//!         .on_start(|e| println!("started: {}", e.process_id()))
//!         .on_stop(|e| println!("stopped: {}", e.process_id())),
//! ])?;
//! // ...
//! monitor.stop();
//! monitor.cleanup();
//! # Ok::<(), process_monitor::ProcessMonitorError>(())
//! ```

// Module declarations
pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod utils;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager, MonitorSettings, SourceKind, WatchedProcess};
pub use controller::{LoopState, MonitorStats, ProcessConfig, ProcessMonitor};
pub use error::{ProcessMonitorError, Result, get_user_friendly_error};
pub use monitor::{
    EventBridge, EventKind, ProcessCallback, ProcessEvent, ProcessEventData, WaitOutcome,
};
