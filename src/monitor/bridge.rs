//! Host-boundary event bridge
//!
//! `EventBridge` is the pull-style surface a host drives directly: initialize,
//! start and stop monitoring, wait for events, fetch them as fixed-width
//! [`ProcessEventData`] records, and tear everything down with `cleanup`.
//!
//! All state that a native library would keep in process-wide globals (the
//! queue, the monitoring flag, the cleanup guard, the last error) lives in one
//! explicitly constructed value.

use crate::error::{LastError, ProcessMonitorError, Result, describe_panic};
use crate::monitor::adapter::{AdapterStats, Clock, NotificationAdapter, system_clock};
use crate::monitor::event::{ProcessCallback, ProcessEvent, ProcessEventData};
use crate::monitor::queue::{EventQueue, WaitOutcome};
use crate::monitor::source::NotificationSource;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Snapshot of bridge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Events waiting in the queue
    pub pending: usize,
    /// Events evicted by queue overflow
    pub evicted: u64,
    /// Adapter counters
    #[serde(flatten)]
    pub adapter: AdapterStats,
}

/// Queue, adapter and session flags behind the host API
pub struct EventBridge {
    adapter: NotificationAdapter,
    queue: Arc<EventQueue>,
    monitoring: Arc<AtomicBool>,
    initialized: AtomicBool,
    cleanup_in_progress: AtomicBool,
    start_lock: Mutex<()>,
    last_error: LastError,
}

impl EventBridge {
    /// Create a bridge over `source` with a queue of `queue_capacity` events
    pub fn new(source: Box<dyn NotificationSource>, queue_capacity: usize) -> Self {
        Self::with_clock(source, queue_capacity, system_clock())
    }

    /// Create a bridge stamping events with `clock`
    pub fn with_clock(
        source: Box<dyn NotificationSource>,
        queue_capacity: usize,
        clock: Clock,
    ) -> Self {
        Self::with_last_error(source, queue_capacity, clock, LastError::new())
    }

    pub(crate) fn with_last_error(
        source: Box<dyn NotificationSource>,
        queue_capacity: usize,
        clock: Clock,
        last_error: LastError,
    ) -> Self {
        let queue = Arc::new(EventQueue::new(queue_capacity));
        // Waits fail until the bridge is initialized
        queue.close();

        let monitoring = Arc::new(AtomicBool::new(false));
        let adapter = NotificationAdapter::new(
            source,
            Arc::clone(&queue),
            Arc::clone(&monitoring),
            clock,
        );

        Self {
            adapter,
            queue,
            monitoring,
            initialized: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            last_error,
        }
    }

    /// Prepare the queue and signal
    ///
    /// Idempotent; always succeeds. `start_monitoring` initializes implicitly.
    pub fn initialize(&self) -> bool {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.queue.reopen();
            debug!("Event bridge initialized");
        }
        true
    }

    /// Whether `initialize` (or a start) has run since the last cleanup
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Start a monitoring session
    ///
    /// Fails with [`ProcessMonitorError::AlreadyRunning`] while a session is
    /// active. Leftovers of a stopped but not cleaned-up session (subscription,
    /// queued events) are released first.
    pub fn start_monitoring(&self) -> Result<()> {
        self.start_session(None)
    }

    /// Start monitoring and invoke `callback` for every event as it arrives
    ///
    /// The callback runs on the notification thread after the event has been
    /// queued, so pull-style consumers still see it.
    pub fn start_monitoring_with_callback(&self, callback: ProcessCallback) -> Result<()> {
        self.start_session(Some(callback))
    }

    fn start_session(&self, callback: Option<ProcessCallback>) -> Result<()> {
        let _guard = self.start_lock.lock();

        if self.monitoring.load(Ordering::SeqCst) {
            let err = ProcessMonitorError::AlreadyRunning;
            self.last_error.set(&err);
            return Err(err);
        }

        self.initialize();
        self.adapter.stop();
        self.queue.reopen();
        self.cleanup_in_progress.store(false, Ordering::SeqCst);
        self.adapter.set_callback(callback);

        // Accept records from the first notification on
        self.monitoring.store(true, Ordering::SeqCst);
        if let Err(e) = self.adapter.start() {
            self.monitoring.store(false, Ordering::SeqCst);
            self.adapter.set_callback(None);
            error!("Failed to start process monitoring: {e}");
            self.last_error.set(&e);
            return Err(e);
        }

        self.last_error.clear();
        info!(
            "Process monitoring started ({} source)",
            self.adapter.source_name()
        );
        Ok(())
    }

    /// Stop accepting events and wake any waiter
    ///
    /// Only flips flags; the subscription stays in place until `cleanup`.
    /// Records arriving in between are discarded. Always succeeds.
    pub fn stop_monitoring(&self) -> bool {
        if self.monitoring.swap(false, Ordering::SeqCst) {
            info!("Process monitoring stopped");
        }
        self.adapter.set_callback(None);
        self.queue.interrupt();
        true
    }

    /// Whether a session is active
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout_ms` for the availability signal
    ///
    /// Returns the number of pending events when signaled, 0 on timeout and -1
    /// when the bridge is not initialized or has been cleaned up.
    pub fn wait_for_events(&self, timeout_ms: u32) -> i32 {
        if !self.is_initialized() {
            self.last_error.set_message("Process monitor not initialized");
            return -1;
        }

        match self.wait_for_availability(Duration::from_millis(u64::from(timeout_ms))) {
            WaitOutcome::Available => i32::try_from(self.queue.len()).unwrap_or(i32::MAX),
            WaitOutcome::TimedOut => 0,
            WaitOutcome::Error => -1,
        }
    }

    /// Wait on the availability signal with a typed outcome
    pub fn wait_for_availability(&self, timeout: Duration) -> WaitOutcome {
        self.queue.wait_for_availability(timeout)
    }

    /// Remove and return the oldest pending event as a wire record
    pub fn get_next_event(&self) -> Option<ProcessEventData> {
        self.queue.pop().map(|event| ProcessEventData::from(&event))
    }

    /// Remove and return up to `max_events` pending events as wire records
    pub fn get_all_events(&self, max_events: usize) -> Vec<ProcessEventData> {
        self.queue
            .drain(max_events)
            .iter()
            .map(ProcessEventData::from)
            .collect()
    }

    /// Remove and return up to `max_events` pending events
    pub fn drain_events(&self, max_events: usize) -> Vec<ProcessEvent> {
        self.queue.drain(max_events)
    }

    /// Identifier of the current monitoring session
    ///
    /// Changes on every start and cleanup.
    pub fn session_generation(&self) -> u64 {
        self.queue.generation()
    }

    /// Like [`EventBridge::drain_events`], but empty once the session
    /// `generation` has ended
    pub fn drain_session_events(&self, generation: u64, max_events: usize) -> Vec<ProcessEvent> {
        self.queue.drain_generation(generation, max_events)
    }

    /// Number of events waiting in the queue
    pub fn get_pending_event_count(&self) -> usize {
        self.queue.len()
    }

    /// Release the subscription and the queue
    ///
    /// Only the first call after a start does any work; concurrent and repeated
    /// calls return immediately. The next successful start re-arms it.
    pub fn cleanup(&self) {
        if self.cleanup_in_progress.swap(true, Ordering::SeqCst) {
            debug!("Event bridge cleanup already performed");
            return;
        }

        self.monitoring.store(false, Ordering::SeqCst);
        self.adapter.set_callback(None);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.adapter.stop())) {
            warn!(
                "Notification source failed during unsubscribe: {}",
                describe_panic(payload.as_ref())
            );
        }

        self.queue.close();
        self.initialized.store(false, Ordering::SeqCst);
        self.last_error.clear();
        info!("Event bridge cleaned up");
    }

    /// Message of the most recent failure, empty when none
    pub fn get_last_error(&self) -> String {
        self.last_error.get()
    }

    /// Handle to the shared last-error slot
    pub fn last_error(&self) -> &LastError {
        &self.last_error
    }

    /// Whether the source subscription is currently held
    pub fn is_subscribed(&self) -> bool {
        self.adapter.is_subscribed()
    }

    /// Current counters
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            pending: self.queue.len(),
            evicted: self.queue.evicted_count(),
            adapter: self.adapter.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::event::EventKind;
    use crate::monitor::source::{ManualSource, ManualSourceHandle, RawProcessRecord};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn bridge(capacity: usize) -> (EventBridge, ManualSourceHandle) {
        let (source, handle) = ManualSource::new();
        (EventBridge::new(Box::new(source), capacity), handle)
    }

    #[test]
    fn test_wait_before_initialize_fails() {
        let (bridge, _handle) = bridge(10);
        assert_eq!(bridge.wait_for_events(10), -1);
        assert!(!bridge.get_last_error().is_empty());

        assert!(bridge.initialize());
        assert_eq!(bridge.wait_for_events(10), 0);
    }

    #[test]
    fn test_pull_api_delivers_wire_records() {
        let (bridge, handle) = bridge(10);
        bridge.start_monitoring().unwrap();
        assert!(bridge.is_monitoring());

        handle.emit(&[
            RawProcessRecord::creation("notepad.exe", 100),
            RawProcessRecord::deletion("notepad.exe", 100),
        ]);

        assert_eq!(bridge.wait_for_events(1000), 2);
        let first = bridge.get_next_event().unwrap();
        assert_eq!(first.event_type_str(), "start");
        assert_eq!(first.process_name_str(), "notepad.exe");
        assert_eq!(first.process_id, 100);

        let rest = bridge.get_all_events(10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_type_str(), "stop");
        assert_eq!(bridge.get_pending_event_count(), 0);
    }

    #[test]
    fn test_start_while_monitoring_fails() {
        let (bridge, handle) = bridge(10);
        bridge.start_monitoring().unwrap();

        let result = bridge.start_monitoring();
        assert!(matches!(result, Err(ProcessMonitorError::AlreadyRunning)));
        assert_eq!(bridge.get_last_error(), "Process monitor is already running");
        assert_eq!(handle.subscribe_calls(), 1);
        assert!(bridge.is_monitoring());
    }

    #[test]
    fn test_subscription_failure_leaves_bridge_stopped() {
        let (bridge, handle) = bridge(10);
        handle.fail_subscribe(Some("access denied"));

        assert!(bridge.start_monitoring().is_err());
        assert!(!bridge.is_monitoring());
        assert!(!bridge.is_subscribed());
        assert!(bridge.get_last_error().contains("access denied"));

        handle.fail_subscribe(None);
        bridge.start_monitoring().unwrap();
        assert!(bridge.is_monitoring());
    }

    #[test]
    fn test_stop_discards_late_records_and_wakes_waiter() {
        let (bridge, handle) = bridge(10);
        let bridge = Arc::new(bridge);
        bridge.start_monitoring().unwrap();

        let waiter = Arc::clone(&bridge);
        let wait = thread::spawn(move || waiter.wait_for_events(5000));
        thread::sleep(Duration::from_millis(30));
        assert!(bridge.stop_monitoring());
        assert_eq!(wait.join().unwrap(), 0, "interrupt carries no data");

        handle.emit(&[RawProcessRecord::creation("late.exe", 1)]);
        assert_eq!(bridge.get_pending_event_count(), 0);
        assert_eq!(bridge.stats().adapter.discarded, 1);
        assert!(bridge.is_subscribed(), "stop must not release the subscription");
    }

    #[test]
    fn test_cleanup_releases_once_and_rearms() {
        let (bridge, handle) = bridge(10);
        bridge.start_monitoring().unwrap();
        handle.emit(&[RawProcessRecord::creation("a.exe", 1)]);

        bridge.stop_monitoring();
        bridge.cleanup();
        bridge.cleanup();

        assert_eq!(handle.unsubscribe_calls(), 1);
        assert_eq!(bridge.get_pending_event_count(), 0);
        assert_eq!(bridge.wait_for_events(10), -1);

        bridge.start_monitoring().unwrap();
        bridge.cleanup();
        assert_eq!(handle.unsubscribe_calls(), 2);
    }

    #[test]
    fn test_restart_after_stop_releases_stale_session() {
        let (bridge, handle) = bridge(10);
        bridge.start_monitoring().unwrap();
        handle.emit(&[RawProcessRecord::creation("old.exe", 1)]);
        bridge.stop_monitoring();

        bridge.start_monitoring().unwrap();
        assert_eq!(handle.unsubscribe_calls(), 1);
        assert_eq!(handle.subscribe_calls(), 2);
        assert_eq!(bridge.get_pending_event_count(), 0, "stale events are dropped");
    }

    #[test]
    fn test_immediate_callback_sees_every_event() {
        let (bridge, handle) = bridge(10);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bridge
            .start_monitoring_with_callback(Arc::new(move |event: &ProcessEvent| {
                assert_eq!(event.kind(), EventKind::Start);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        handle.emit(&[
            RawProcessRecord::creation("a.exe", 1),
            RawProcessRecord::creation("b.exe", 2),
        ]);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.get_pending_event_count(), 2);

        bridge.stop_monitoring();
        bridge.start_monitoring().unwrap();
        handle.emit(&[RawProcessRecord::creation("c.exe", 3)]);
        assert_eq!(seen.load(Ordering::SeqCst), 2, "stop clears the callback");
    }

    #[test]
    fn test_callback_installed_only_by_the_winning_start() {
        let (bridge, handle) = bridge(10);
        let bridge = Arc::new(bridge);

        for round in 0..50 {
            let seen = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&seen);
            let with_callback = Arc::clone(&bridge);
            let plain = Arc::clone(&bridge);

            let a = thread::spawn(move || {
                with_callback
                    .start_monitoring_with_callback(Arc::new(move |_: &ProcessEvent| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }))
                    .is_ok()
            });
            let b = thread::spawn(move || plain.start_monitoring().is_ok());
            let callback_won = a.join().unwrap();
            let plain_won = b.join().unwrap();
            assert!(callback_won != plain_won, "exactly one start succeeds");

            handle.emit(&[RawProcessRecord::creation("race.exe", round)]);
            let expected = usize::from(callback_won);
            assert_eq!(seen.load(Ordering::SeqCst), expected, "round {round}");

            bridge.stop_monitoring();
        }
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let (bridge, handle) = bridge(2);
        bridge.start_monitoring().unwrap();
        for pid in 1..=4 {
            handle.emit(&[RawProcessRecord::creation("burst.exe", pid)]);
        }

        let pids: Vec<u32> = bridge.get_all_events(10).iter().map(|e| e.process_id).collect();
        assert_eq!(pids, vec![3, 4]);
        assert_eq!(bridge.stats().evicted, 2);
    }
}
