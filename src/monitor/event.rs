//! Process event model
//!
//! `ProcessEvent` is the canonical, immutable record produced by the
//! notification adapter and consumed read-only downstream. `ProcessEventData`
//! is its fixed-width wire form handed across the host boundary.

use crate::error::{ProcessMonitorError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// WMI class name of process creation notifications
pub const CREATION_EVENT_CLASS: &str = "__InstanceCreationEvent";

/// WMI class name of process termination notifications
pub const DELETION_EVENT_CLASS: &str = "__InstanceDeletionEvent";

/// Byte width of the event kind tag in [`ProcessEventData`]
pub const EVENT_TYPE_LEN: usize = 32;

/// Byte width of the process name in [`ProcessEventData`]
pub const PROCESS_NAME_LEN: usize = 512;

/// Callback receiving process events
///
/// Used for per-process start/stop callbacks and for the immediate callback
/// registered through `EventBridge::start_monitoring_with_callback`.
pub type ProcessCallback = Arc<dyn Fn(&ProcessEvent) + Send + Sync>;

/// Lifecycle transition reported by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The process came into existence
    Start,
    /// The process terminated
    Stop,
}

impl EventKind {
    /// Wire tag for this kind
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
        }
    }

    /// Parse a wire tag (`"start"` / `"stop"`)
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            _ => None,
        }
    }

    /// Classify a raw notification by its origin class
    ///
    /// Only creation notifications are starts; every other class is treated
    /// as a termination.
    pub fn from_origin_class(origin_class: &str) -> Self {
        if origin_class == CREATION_EVENT_CLASS {
            EventKind::Start
        } else {
            EventKind::Stop
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single process start or stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvent {
    #[serde(rename = "eventType")]
    kind: EventKind,
    process_name: String,
    process_id: u32,
    timestamp_ms: i64,
}

impl ProcessEvent {
    /// Create an event with an explicit timestamp (epoch milliseconds)
    pub fn new(
        kind: EventKind,
        process_name: impl Into<String>,
        process_id: u32,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            kind,
            process_name: process_name.into(),
            process_id,
            timestamp_ms,
        }
    }

    /// Create an event stamped with the current wall-clock time
    pub fn now(kind: EventKind, process_name: impl Into<String>, process_id: u32) -> Self {
        Self::new(kind, process_name, process_id, current_timestamp_ms())
    }

    /// Start or stop
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Process image name as reported by the platform (e.g. `app.exe`)
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Process identifier
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Milliseconds since the Unix epoch at which the event was observed
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (pid {}) at {}",
            self.kind, self.process_name, self.process_id, self.timestamp_ms
        )
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fixed-width wire record for a process event
///
/// Strings are UTF-8, NUL-terminated and truncated on a character boundary,
/// so `event_type` holds at most 31 bytes and `process_name` at most 511.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProcessEventData {
    /// `"start"` or `"stop"`
    pub event_type: [u8; EVENT_TYPE_LEN],
    /// Process image name
    pub process_name: [u8; PROCESS_NAME_LEN],
    /// Process identifier
    pub process_id: u32,
    /// Timestamp in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl ProcessEventData {
    /// Event kind tag up to the first NUL
    pub fn event_type_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(until_nul(&self.event_type))
    }

    /// Process name up to the first NUL
    pub fn process_name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(until_nul(&self.process_name))
    }
}

impl Default for ProcessEventData {
    fn default() -> Self {
        Self {
            event_type: [0; EVENT_TYPE_LEN],
            process_name: [0; PROCESS_NAME_LEN],
            process_id: 0,
            timestamp_ms: 0,
        }
    }
}

impl fmt::Debug for ProcessEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEventData")
            .field("event_type", &self.event_type_str())
            .field("process_name", &self.process_name_str())
            .field("process_id", &self.process_id)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

impl From<&ProcessEvent> for ProcessEventData {
    fn from(event: &ProcessEvent) -> Self {
        let mut data = Self {
            process_id: event.process_id,
            timestamp_ms: event.timestamp_ms,
            ..Self::default()
        };
        copy_truncated(&mut data.event_type, event.kind.as_str());
        copy_truncated(&mut data.process_name, &event.process_name);
        data
    }
}

impl TryFrom<&ProcessEventData> for ProcessEvent {
    type Error = ProcessMonitorError;

    fn try_from(data: &ProcessEventData) -> Result<Self> {
        let tag = data.event_type_str();
        let kind = EventKind::parse(&tag)
            .ok_or_else(|| ProcessMonitorError::MalformedEvent(tag.clone().into_owned()))?;
        Ok(ProcessEvent::new(
            kind,
            data.process_name_str().into_owned(),
            data.process_id,
            data.timestamp_ms,
        ))
    }
}

/// Copy `value` into `dest`, leaving room for the terminating NUL and never
/// splitting a UTF-8 sequence.
fn copy_truncated(dest: &mut [u8], value: &str) {
    let mut len = value.len().min(dest.len().saturating_sub(1));
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    dest[..len].copy_from_slice(&value.as_bytes()[..len]);
    dest[len..].fill(0);
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..len]
}
