//! Platform notification sources
//!
//! A [`NotificationSource`] owns the subscription to some facility that reports
//! process creation and termination, and delivers raw record batches to a
//! handler on a thread it controls.
//!
//! - [`WmiSource`] (Windows): asynchronous WMI `__InstanceCreationEvent` /
//!   `__InstanceDeletionEvent` subscriptions
//! - [`PollingSource`]: periodic process snapshots diffed against the previous one
//! - [`ManualSource`]: records injected by the host through a [`ManualSourceHandle`]

pub mod manual;
pub mod polling;
#[cfg(windows)]
pub mod wmi;

pub use manual::{ManualSource, ManualSourceHandle};
pub use polling::PollingSource;
#[cfg(windows)]
pub use wmi::WmiSource;

use crate::config::{MonitorSettings, SourceKind};
use crate::error::Result;
use crate::monitor::event::{CREATION_EVENT_CLASS, DELETION_EVENT_CLASS};
use std::sync::Arc;
use std::time::Duration;

/// A raw notification as delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcessRecord {
    /// Process image name
    pub name: String,
    /// Process identifier
    pub pid: u32,
    /// Class of the notification (`__InstanceCreationEvent`, ...)
    pub origin_class: String,
}

impl RawProcessRecord {
    /// A process creation record
    pub fn creation(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
            origin_class: CREATION_EVENT_CLASS.to_string(),
        }
    }

    /// A process termination record
    pub fn deletion(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
            origin_class: DELETION_EVENT_CLASS.to_string(),
        }
    }
}

/// Handler invoked by a source for each batch of raw records
pub type RecordHandler = Arc<dyn Fn(&[RawProcessRecord]) + Send + Sync>;

/// Subscription to a process lifecycle notification facility
pub trait NotificationSource: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Subscribe to creation and termination notifications
    ///
    /// On error the source may hold partially acquired resources; callers
    /// follow a failed subscribe with [`NotificationSource::unsubscribe`].
    fn subscribe(&mut self, handler: RecordHandler) -> Result<()>;

    /// Cancel the subscription and release platform resources
    ///
    /// Must be safe to call when nothing (or only part) was subscribed.
    fn unsubscribe(&mut self);
}

/// Build the source selected in the settings
pub fn from_settings(settings: &MonitorSettings) -> Box<dyn NotificationSource> {
    match settings.source {
        #[cfg(windows)]
        SourceKind::Wmi => Box::new(WmiSource::new()),
        #[cfg(not(windows))]
        SourceKind::Wmi => {
            tracing::warn!("WMI notifications are only available on Windows; using polling source");
            Box::new(PollingSource::new(Duration::from_millis(
                settings.polling_interval_ms,
            )))
        }
        SourceKind::Polling => Box::new(PollingSource::new(Duration::from_millis(
            settings.polling_interval_ms,
        ))),
    }
}
