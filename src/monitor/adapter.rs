//! Notification adapter
//!
//! Owns the subscription to a [`NotificationSource`] and turns the raw records
//! it delivers into [`ProcessEvent`]s pushed onto the shared [`EventQueue`].
//!
//! The record handler runs on threads owned by the platform facility. It never
//! blocks beyond the queue's short critical section, and every record is
//! processed under `catch_unwind` so no panic crosses back into the platform.

use crate::error::{Result, describe_panic};
use crate::monitor::event::{EventKind, ProcessCallback, ProcessEvent, current_timestamp_ms};
use crate::monitor::queue::EventQueue;
use crate::monitor::source::{NotificationSource, RawProcessRecord, RecordHandler};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Source of event timestamps in epoch milliseconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Wall-clock time source used when no clock is injected
pub fn system_clock() -> Clock {
    Arc::new(current_timestamp_ms)
}

/// Snapshot of adapter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    /// Raw records delivered by the source
    pub received: u64,
    /// Events pushed onto the queue
    pub enqueued: u64,
    /// Records dropped because monitoring was not active
    pub discarded: u64,
    /// Records or immediate callbacks that panicked
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    enqueued: AtomicU64,
    discarded: AtomicU64,
    faults: AtomicU64,
}

/// State reachable from the record handler
struct HandlerState {
    queue: Arc<EventQueue>,
    accepting: Arc<AtomicBool>,
    clock: Clock,
    callback: Mutex<Option<ProcessCallback>>,
    counters: Counters,
}

impl HandlerState {
    fn handle_batch(&self, records: &[RawProcessRecord]) {
        for record in records {
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            if !self.accepting.load(Ordering::SeqCst) {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Discarding {} record for {} (pid {}): monitoring stopped",
                    record.origin_class, record.name, record.pid
                );
                continue;
            }

            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.enqueue(record))) {
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Failed to process record for {} (pid {}): {}",
                    record.name,
                    record.pid,
                    describe_panic(payload.as_ref())
                );
            }
        }
    }

    fn enqueue(&self, record: &RawProcessRecord) {
        let event = ProcessEvent::new(
            EventKind::from_origin_class(&record.origin_class),
            record.name.clone(),
            record.pid,
            (self.clock)(),
        );
        debug!("Process event: {event}");

        let evicted = self.queue.push(event.clone());
        if evicted > 0 {
            debug!("Event queue full, evicted {evicted} oldest event(s)");
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        // Clone out so the slot lock is not held while user code runs
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback
            && let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&event)))
        {
            self.counters.faults.fetch_add(1, Ordering::Relaxed);
            error!(
                "Immediate callback panicked for {event}: {}",
                describe_panic(payload.as_ref())
            );
        }
    }
}

/// Bridges a notification source to the event queue
pub struct NotificationAdapter {
    source: Mutex<Box<dyn NotificationSource>>,
    state: Arc<HandlerState>,
    subscribed: AtomicBool,
}

impl NotificationAdapter {
    /// Create an adapter feeding `queue`
    ///
    /// Records are accepted only while `accepting` is set; the flag is owned by
    /// whoever controls the monitoring session.
    pub fn new(
        source: Box<dyn NotificationSource>,
        queue: Arc<EventQueue>,
        accepting: Arc<AtomicBool>,
        clock: Clock,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            state: Arc::new(HandlerState {
                queue,
                accepting,
                clock,
                callback: Mutex::new(None),
                counters: Counters::default(),
            }),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Subscribe to the source
    ///
    /// A no-op when already subscribed. A failed subscription is unwound
    /// through `unsubscribe` before the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut source = self.source.lock();
        if self.subscribed.load(Ordering::SeqCst) {
            debug!("Notification adapter already subscribed");
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let handler: RecordHandler =
            Arc::new(move |records: &[RawProcessRecord]| state.handle_batch(records));

        if let Err(e) = source.subscribe(handler) {
            source.unsubscribe();
            return Err(e);
        }

        self.subscribed.store(true, Ordering::SeqCst);
        info!("Subscribed to {} process notifications", source.name());
        Ok(())
    }

    /// Cancel the subscription
    ///
    /// Runs the source's unsubscribe at most once per successful `start`.
    pub fn stop(&self) {
        let mut source = self.source.lock();
        if self.subscribed.swap(false, Ordering::SeqCst) {
            source.unsubscribe();
            info!("Unsubscribed from {} process notifications", source.name());
        }
    }

    /// Whether the source subscription is active
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Install or remove the callback invoked for every queued event
    pub fn set_callback(&self, callback: Option<ProcessCallback>) {
        *self.state.callback.lock() = callback;
    }

    /// Name of the underlying source
    pub fn source_name(&self) -> &'static str {
        self.source.lock().name()
    }

    /// Current counters
    pub fn stats(&self) -> AdapterStats {
        let counters = &self.state.counters;
        AdapterStats {
            received: counters.received.load(Ordering::Relaxed),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            faults: counters.faults.load(Ordering::Relaxed),
        }
    }
}
