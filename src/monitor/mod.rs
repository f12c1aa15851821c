//! Process notification acquisition
//!
//! This module receives raw process creation and termination notifications
//! from the operating system and buffers them as [`ProcessEvent`]s.
//!
//! # Overview
//!
//! - **Sources** ([`source`]): WMI subscriptions on Windows, snapshot polling
//!   everywhere, or records injected by the host
//! - **Adapter** ([`NotificationAdapter`]): normalizes raw records, stamps them
//!   and pushes them to the queue from the platform's own threads
//! - **Queue** ([`EventQueue`]): bounded, drop-oldest, with an auto-reset
//!   availability signal the consumer blocks on
//! - **Bridge** ([`EventBridge`]): the pull-style host API over all of the above
//!
//! # Data flow
//!
//! ```text
//! NotificationSource ──records──▶ NotificationAdapter ──push──▶ EventQueue
//!                                                                   │
//!                             host / consumer loop ◀──drain── EventBridge
//! ```
//!
//! Deduplication and per-process callback routing happen downstream in
//! [`crate::controller`].

pub mod adapter;
pub mod bridge;
pub mod event;
pub mod queue;
pub mod source;

pub use adapter::{AdapterStats, Clock, NotificationAdapter, system_clock};
pub use bridge::{BridgeStats, EventBridge};
pub use event::{
    EventKind, ProcessCallback, ProcessEvent, ProcessEventData, current_timestamp_ms,
};
pub use queue::{DEFAULT_QUEUE_CAPACITY, EventQueue, WaitOutcome};
pub use source::{
    ManualSource, ManualSourceHandle, NotificationSource, PollingSource, RawProcessRecord,
    RecordHandler,
};
#[cfg(windows)]
pub use source::WmiSource;
