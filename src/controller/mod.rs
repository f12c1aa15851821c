//! Event consumption and lifecycle control
//!
//! This module consumes the events buffered by [`crate::monitor`] and turns
//! them into the application-facing stream and callbacks.
//!
//! # Overview
//!
//! - **Consumer loop** ([`ConsumerLoop`]): a dedicated thread draining the
//!   bridge in batches
//! - **Deduplication** ([`DedupFilter`]): drops repeats of the same transition
//!   within one second
//! - **Instance tracking** ([`InstanceTracker`]): per watched name, the set of
//!   running PIDs and the start/stop callback decision
//! - **Lifecycle** ([`ProcessMonitor`]): starts and tears down all of it
//!
//! # Event Flow
//!
//! ```text
//! EventBridge → ConsumerLoop → DedupFilter → subscribers (mpsc)
//!                                   ↓
//!                           InstanceTracker → on_start / on_stop
//! ```
//!
//! # Callback Rules
//!
//! With both multiplicity flags set (the default) every instance fires its
//! own start and stop callback. Clearing `allow_multiple_start_callbacks`
//! fires `on_start` only when the first instance appears; clearing
//! `allow_multiple_stop_callbacks` fires `on_stop` only when the last
//! instance exits.

pub mod consumer;
pub mod dedup;
pub mod lifecycle;
pub mod pipeline;
pub mod tracker;

pub use consumer::{ConsumerLoop, LoopControl, LoopState};
pub use dedup::{DedupFilter, EventSignature};
pub use lifecycle::{MonitorStats, ProcessMonitor};
pub use pipeline::{EventHandler, EventPipeline, PipelineStats};
pub use tracker::{InstanceTracker, PendingCallback, ProcessConfig};
