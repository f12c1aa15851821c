//! Downstream event pipeline
//!
//! Runs on the consumer thread for every drained event, in queue order:
//! duplicate filtering, fan-out to subscriber channels, then instance
//! tracking and callback routing.

use crate::controller::dedup::DedupFilter;
use crate::controller::tracker::InstanceTracker;
use crate::error::LastError;
use crate::monitor::ProcessEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use tracing::{debug, error};

/// Receiver of events drained by the consumer loop
pub trait EventHandler: Send + Sync {
    /// Handle one event
    fn handle(&self, event: ProcessEvent);
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Events that passed the duplicate filter
    pub emitted: u64,
    /// Events dropped as duplicates
    pub duplicates: u64,
    /// Start/stop callbacks that panicked
    pub callback_faults: u64,
}

/// Subscribers and counters outliving a single session
#[derive(Default)]
struct SharedState {
    subscribers: Mutex<Vec<Sender<ProcessEvent>>>,
    emitted: AtomicU64,
    duplicates: AtomicU64,
    callback_faults: AtomicU64,
}

/// Dedup, subscriber fan-out and callback routing for one session
///
/// Every session gets its own dedup window and instance tracker via
/// [`EventPipeline::next_session`], so a consumer left over from an earlier
/// session can only ever touch state nobody reads anymore. Subscribers and
/// counters carry over.
pub struct EventPipeline {
    dedup: Mutex<DedupFilter>,
    tracker: Mutex<InstanceTracker>,
    shared: Arc<SharedState>,
    last_error: LastError,
}

impl EventPipeline {
    /// Create a pipeline with an empty tracker
    pub fn new(dedup_capacity: usize, last_error: LastError) -> Self {
        Self {
            dedup: Mutex::new(DedupFilter::new(dedup_capacity)),
            tracker: Mutex::new(InstanceTracker::new()),
            shared: Arc::new(SharedState::default()),
            last_error,
        }
    }

    /// Pipeline for the next session, routing into `tracker`
    pub fn next_session(&self, tracker: InstanceTracker) -> Self {
        Self {
            dedup: Mutex::new(DedupFilter::new(self.dedup.lock().capacity())),
            tracker: Mutex::new(tracker),
            shared: Arc::clone(&self.shared),
            last_error: self.last_error.clone(),
        }
    }

    /// Register a channel receiving every emitted event
    pub fn add_subscriber(&self, sender: Sender<ProcessEvent>) {
        self.shared.subscribers.lock().push(sender);
    }

    /// PIDs of `process_name` seen running in this session
    pub fn running_instances(&self, process_name: &str) -> Vec<u32> {
        self.tracker.lock().running_instances(process_name)
    }

    /// Current counters
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            emitted: self.shared.emitted.load(Ordering::Relaxed),
            duplicates: self.shared.duplicates.load(Ordering::Relaxed),
            callback_faults: self.shared.callback_faults.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, event: &ProcessEvent) {
        // Disconnected receivers are pruned
        self.shared
            .subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl EventHandler for EventPipeline {
    fn handle(&self, event: ProcessEvent) {
        if !self.dedup.lock().should_emit(&event) {
            self.shared.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping duplicate event: {event}");
            return;
        }
        self.shared.emitted.fetch_add(1, Ordering::Relaxed);

        self.publish(&event);

        let pending = self.tracker.lock().route(&event);
        if let Some(pending) = pending
            && let Err(e) = pending.invoke()
        {
            self.shared.callback_faults.fetch_add(1, Ordering::Relaxed);
            error!("{e}");
            self.last_error.set(&e);
        }
    }
}
