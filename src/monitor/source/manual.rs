//! Manually driven notification source
//!
//! For hosts that receive process notifications through their own channel
//! (ETW consumers, job objects, test harnesses) and want the queueing,
//! deduplication and routing of this crate on top.

use crate::error::{ProcessMonitorError, Result, StringError};
use crate::monitor::source::{NotificationSource, RawProcessRecord, RecordHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Shared {
    handler: Mutex<Option<RecordHandler>>,
    fail_subscribe: Mutex<Option<String>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

/// Source whose notifications are injected through a [`ManualSourceHandle`]
pub struct ManualSource {
    shared: Arc<Shared>,
}

/// Cloneable handle used to inject records into a [`ManualSource`]
#[derive(Clone)]
pub struct ManualSourceHandle {
    shared: Arc<Shared>,
}

impl ManualSource {
    /// Create a source and its injection handle
    pub fn new() -> (Self, ManualSourceHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ManualSourceHandle { shared },
        )
    }
}

impl NotificationSource for ManualSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn subscribe(&mut self, handler: RecordHandler) -> Result<()> {
        self.shared.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.shared.fail_subscribe.lock().clone() {
            return Err(ProcessMonitorError::Subscription(StringError::new(message)));
        }
        *self.shared.handler.lock() = Some(handler);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.shared.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.handler.lock().take();
    }
}

impl ManualSourceHandle {
    /// Deliver a batch of records on the calling thread
    ///
    /// Returns false (and drops the batch) when nothing is subscribed.
    pub fn emit(&self, records: &[RawProcessRecord]) -> bool {
        // Clone the handler out so the lock is not held while it runs
        let handler = self.shared.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(records);
                true
            }
            None => false,
        }
    }

    /// Make subsequent subscribe calls fail with `message` (`None` restores success)
    pub fn fail_subscribe(&self, message: Option<&str>) {
        *self.shared.fail_subscribe.lock() = message.map(str::to_string);
    }

    /// Whether a handler is currently registered
    pub fn is_subscribed(&self) -> bool {
        self.shared.handler.lock().is_some()
    }

    /// Number of subscribe calls seen so far
    pub fn subscribe_calls(&self) -> usize {
        self.shared.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls seen so far
    pub fn unsubscribe_calls(&self) -> usize {
        self.shared.unsubscribe_calls.load(Ordering::SeqCst)
    }
}
