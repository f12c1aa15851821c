//! Per-process instance tracking and callback routing
//!
//! For every watched process name the tracker keeps the set of PIDs it
//! believes are running and decides, per event, whether that name's start or
//! stop callback fires:
//!
//! - start fires when multiple start callbacks are allowed, or when this is
//!   the first running instance
//! - stop fires when multiple stop callbacks are allowed, or when the last
//!   running instance exited
//!
//! Decisions are taken with `&mut self` (the caller holds the lock); the
//! returned [`PendingCallback`] is invoked after the lock is released.

use crate::error::{ProcessMonitorError, describe_panic};
use crate::monitor::{EventKind, ProcessCallback, ProcessEvent};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::debug;

/// Watch configuration for one process name
#[derive(Clone)]
pub struct ProcessConfig {
    process_name: String,
    on_start: Option<ProcessCallback>,
    on_stop: Option<ProcessCallback>,
    allow_multiple_start_callbacks: bool,
    allow_multiple_stop_callbacks: bool,
}

impl ProcessConfig {
    /// Watch `process_name` with no callbacks and per-instance firing
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            on_start: None,
            on_stop: None,
            allow_multiple_start_callbacks: true,
            allow_multiple_stop_callbacks: true,
        }
    }

    /// Callback for process starts
    #[must_use]
    pub fn on_start(mut self, callback: impl Fn(&ProcessEvent) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(callback));
        self
    }

    /// Callback for process exits
    #[must_use]
    pub fn on_stop(mut self, callback: impl Fn(&ProcessEvent) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(callback));
        self
    }

    /// Fire `on_start` for every instance (`true`) or only the first (`false`)
    #[must_use]
    pub fn allow_multiple_start_callbacks(mut self, allow: bool) -> Self {
        self.allow_multiple_start_callbacks = allow;
        self
    }

    /// Fire `on_stop` for every instance (`true`) or only the last (`false`)
    #[must_use]
    pub fn allow_multiple_stop_callbacks(mut self, allow: bool) -> Self {
        self.allow_multiple_stop_callbacks = allow;
        self
    }

    /// Configured process name
    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("process_name", &self.process_name)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field(
                "allow_multiple_start_callbacks",
                &self.allow_multiple_start_callbacks,
            )
            .field(
                "allow_multiple_stop_callbacks",
                &self.allow_multiple_stop_callbacks,
            )
            .finish()
    }
}

/// A routed callback waiting to run outside the tracker lock
pub struct PendingCallback {
    process_name: String,
    kind: EventKind,
    callback: ProcessCallback,
    event: ProcessEvent,
}

impl PendingCallback {
    /// Run the callback, converting a panic into [`ProcessMonitorError::CallbackFault`]
    pub fn invoke(self) -> Result<(), ProcessMonitorError> {
        let Self {
            process_name,
            kind,
            callback,
            event,
        } = self;

        catch_unwind(AssertUnwindSafe(|| callback(&event))).map_err(|payload| {
            ProcessMonitorError::CallbackFault {
                process_name,
                kind,
                message: describe_panic(payload.as_ref()),
            }
        })
    }

    /// Transition the callback belongs to
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Configured process name the callback belongs to
    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

struct Tracked {
    config: ProcessConfig,
    instances: BTreeSet<u32>,
}

/// Running-instance table for the watched process names
///
/// Names are matched ASCII-case-insensitively.
#[derive(Default)]
pub struct InstanceTracker {
    tracked: HashMap<String, Tracked>,
}

impl InstanceTracker {
    /// Create an empty tracker (routes nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the watched set with `configs`, each starting with no instances
    ///
    /// A later entry for the same name replaces an earlier one.
    pub fn configure(&mut self, configs: Vec<ProcessConfig>) {
        self.tracked = configs
            .into_iter()
            .map(|config| {
                (
                    config.process_name.to_ascii_lowercase(),
                    Tracked {
                        config,
                        instances: BTreeSet::new(),
                    },
                )
            })
            .collect();
    }

    /// Update the instance table for `event` and pick the callback to fire, if any
    pub fn route(&mut self, event: &ProcessEvent) -> Option<PendingCallback> {
        let tracked = self
            .tracked
            .get_mut(&event.process_name().to_ascii_lowercase())?;
        let config = &tracked.config;

        let (fire, callback) = match event.kind() {
            EventKind::Start => {
                let was_empty = tracked.instances.is_empty();
                tracked.instances.insert(event.process_id());
                (
                    config.allow_multiple_start_callbacks || was_empty,
                    config.on_start.as_ref(),
                )
            }
            EventKind::Stop => {
                tracked.instances.remove(&event.process_id());
                (
                    config.allow_multiple_stop_callbacks || tracked.instances.is_empty(),
                    config.on_stop.as_ref(),
                )
            }
        };

        debug!(
            "Routed {event}: {} instance(s) running, callback {}",
            tracked.instances.len(),
            if fire { "due" } else { "suppressed" }
        );

        if !fire {
            return None;
        }
        callback.map(|callback| PendingCallback {
            process_name: config.process_name.clone(),
            kind: event.kind(),
            callback: Arc::clone(callback),
            event: event.clone(),
        })
    }

    /// PIDs believed running for `process_name`, ascending
    pub fn running_instances(&self, process_name: &str) -> Vec<u32> {
        self.tracked
            .get(&process_name.to_ascii_lowercase())
            .map(|tracked| tracked.instances.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `process_name` is watched
    pub fn is_tracked(&self, process_name: &str) -> bool {
        self.tracked
            .contains_key(&process_name.to_ascii_lowercase())
    }

    /// Whether no process names are watched
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Drop all configurations and instance sets
    pub fn clear(&mut self) {
        self.tracked.clear();
    }
}
