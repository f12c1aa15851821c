//! Consumer loop
//!
//! A dedicated thread that blocks on the bridge's availability signal, drains
//! queued events in batches and hands them to an [`EventHandler`] in order.
//!
//! State machine: `Idle → Running → Stopping → Stopped`. The loop leaves
//! `Running` when the stop flag is set, when the queue is closed, or when the
//! handler panics; `Stopping` delivers whatever is still queued once, then the
//! loop reports completion over a channel so `cleanup` can wait with a bound.

use crate::controller::pipeline::EventHandler;
use crate::error::{ProcessMonitorError, Result, describe_panic};
use crate::monitor::{EventBridge, ProcessEvent, WaitOutcome};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default wait on the availability signal per iteration
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Shortest accepted wait timeout
pub const MIN_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Longest accepted wait timeout
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of events drained per batch
pub const DEFAULT_DRAIN_BATCH: usize = 100;

/// Consumer loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Not started
    Idle = 0,
    /// Waiting for and delivering events
    Running = 1,
    /// Final drain in progress
    Stopping = 2,
    /// Thread finished
    Stopped = 3,
}

impl LoopState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            3 => LoopState::Stopped,
            _ => LoopState::Idle,
        }
    }
}

/// Shared view of one consumer session: its state and stop flag
///
/// Stays valid after the thread has been joined or detached.
#[derive(Clone)]
pub struct LoopControl {
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
}

impl LoopControl {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LoopState::Idle as u8)),
            stop: Arc::new(AtomicBool::new(false)),
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Ask the loop to finish; returns immediately
    ///
    /// The caller is expected to also wake the wait (`stop_monitoring`
    /// interrupts the queue), otherwise the loop notices within one timeout.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether the thread was abandoned by [`ConsumerLoop::wait_stopped`]
    ///
    /// A detached loop delivers nothing more, not even the event after the
    /// one it is currently handling.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Handle to a running consumer thread
pub struct ConsumerLoop {
    control: LoopControl,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

struct Worker {
    bridge: Arc<EventBridge>,
    handler: Arc<dyn EventHandler>,
    stop: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    /// Queue session this loop belongs to
    generation: u64,
    wait_timeout: Duration,
    batch_size: usize,
}

impl ConsumerLoop {
    /// Spawn the consumer thread
    ///
    /// The loop is bound to the bridge's current session: once that session
    /// ends (cleanup or restart) it never drains another session's events.
    /// `wait_timeout` is clamped to 50-1000 ms and `batch_size` to at least 1.
    pub fn spawn(
        bridge: Arc<EventBridge>,
        handler: Arc<dyn EventHandler>,
        wait_timeout: Duration,
        batch_size: usize,
    ) -> Result<Self> {
        let control = LoopControl::new();
        let (done_tx, done_rx) = mpsc::channel();

        let generation = bridge.session_generation();
        let worker = Worker {
            bridge,
            handler,
            stop: Arc::clone(&control.stop),
            detached: Arc::clone(&control.detached),
            state: Arc::clone(&control.state),
            generation,
            wait_timeout: wait_timeout.clamp(MIN_WAIT_TIMEOUT, MAX_WAIT_TIMEOUT),
            batch_size: batch_size.max(1),
        };

        let handle = thread::Builder::new()
            .name("process-event-consumer".to_string())
            .spawn(move || worker.run(&done_tx))
            .map_err(ProcessMonitorError::ThreadSpawn)?;

        Ok(Self {
            control,
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// Clonable state and stop flag of this session
    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    /// Ask the loop to finish; see [`LoopControl::request_stop`]
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Wait up to `timeout` for the loop to finish
    ///
    /// Joins the thread on success. On timeout the thread is detached, marked
    /// so it delivers nothing further, and `false` is returned.
    pub fn wait_stopped(mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take()
                    && handle.join().is_err()
                {
                    warn!("Event consumer thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Event consumer did not stop within {timeout:?}, detaching");
                self.control.detached.store(true, Ordering::SeqCst);
                drop(self.handle.take());
                false
            }
        }
    }
}

impl Worker {
    fn run(&self, done: &Sender<()>) {
        self.set_state(LoopState::Running);
        debug!(
            "Event consumer started (wait {:?}, batch {})",
            self.wait_timeout, self.batch_size
        );

        while !self.stop.load(Ordering::SeqCst) {
            match self.bridge.wait_for_availability(self.wait_timeout) {
                WaitOutcome::Available => {
                    if !self.drain_batches() {
                        break;
                    }
                }
                WaitOutcome::TimedOut => {}
                WaitOutcome::Error => {
                    debug!("Event queue closed, consumer stopping");
                    break;
                }
            }
        }

        self.set_state(LoopState::Stopping);
        let remaining = if self.detached.load(Ordering::SeqCst) {
            Vec::new()
        } else {
            self.bridge.drain_session_events(self.generation, usize::MAX)
        };
        if !remaining.is_empty() {
            debug!("Delivering {} remaining event(s)", remaining.len());
            self.deliver(remaining);
        }

        self.set_state(LoopState::Stopped);
        let _ = done.send(());
        info!("Event consumer stopped");
    }

    /// Drain until a short batch or a stop request; false if the handler panicked
    fn drain_batches(&self) -> bool {
        loop {
            let batch = self
                .bridge
                .drain_session_events(self.generation, self.batch_size);
            let count = batch.len();
            if count == 0 {
                return true;
            }
            if !self.deliver(batch) {
                return false;
            }
            if count < self.batch_size || self.stop.load(Ordering::SeqCst) {
                return true;
            }
        }
    }

    /// False if the handler panicked or the loop was detached meanwhile
    fn deliver(&self, events: Vec<ProcessEvent>) -> bool {
        let total = events.len();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for (index, event) in events.into_iter().enumerate() {
                if self.detached.load(Ordering::SeqCst) {
                    debug!(
                        "Consumer detached, dropping {} undelivered event(s)",
                        total - index
                    );
                    return false;
                }
                self.handler.handle(event);
            }
            true
        }));

        match outcome {
            Ok(delivered) => delivered,
            Err(payload) => {
                error!(
                    "Event handler panicked: {}",
                    describe_panic(payload.as_ref())
                );
                false
            }
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ManualSource, ManualSourceHandle, RawProcessRecord};
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ProcessEvent>>,
        panic_on_pid: Option<u32>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: ProcessEvent) {
            if Some(event.process_id()) == self.panic_on_pid {
                panic!("handler failure");
            }
            self.events.lock().push(event);
        }
    }

    fn started_bridge() -> (Arc<EventBridge>, ManualSourceHandle) {
        let (source, handle) = ManualSource::new();
        let bridge = Arc::new(EventBridge::new(Box::new(source), 1000));
        bridge.start_monitoring().unwrap();
        (bridge, handle)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_delivers_events_in_order() {
        let (bridge, handle) = started_bridge();
        let recorder = Arc::new(Recorder::default());
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            DEFAULT_WAIT_TIMEOUT,
            2,
        )
        .unwrap();

        let records: Vec<RawProcessRecord> =
            (1..=5).map(|pid| RawProcessRecord::creation("a.exe", pid)).collect();
        handle.emit(&records);

        wait_until(|| recorder.events.lock().len() == 5);
        let pids: Vec<u32> = recorder.events.lock().iter().map(ProcessEvent::process_id).collect();
        assert_eq!(pids, vec![1, 2, 3, 4, 5]);
        assert_eq!(consumer.state(), LoopState::Running);

        consumer.request_stop();
        bridge.stop_monitoring();
        assert!(consumer.wait_stopped(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_is_prompt() {
        let (bridge, _handle) = started_bridge();
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::new(Recorder::default()),
            MAX_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();
        wait_until(|| consumer.state() == LoopState::Running);

        let start = Instant::now();
        consumer.request_stop();
        bridge.stop_monitoring();
        assert!(consumer.wait_stopped(Duration::from_secs(1)));
        assert!(start.elapsed() < MAX_WAIT_TIMEOUT, "interrupt must wake the wait");
    }

    #[test]
    fn test_closed_queue_stops_loop() {
        let (bridge, _handle) = started_bridge();
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::new(Recorder::default()),
            DEFAULT_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();

        bridge.cleanup();
        wait_until(|| consumer.state() == LoopState::Stopped);
        assert!(consumer.wait_stopped(Duration::from_secs(1)));
    }

    #[test]
    fn test_handler_panic_stops_loop() {
        let (bridge, handle) = started_bridge();
        let recorder = Arc::new(Recorder {
            panic_on_pid: Some(2),
            ..Recorder::default()
        });
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::clone(&recorder) as Arc<dyn EventHandler>,
            DEFAULT_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();

        handle.emit(&[
            RawProcessRecord::creation("a.exe", 1),
            RawProcessRecord::creation("a.exe", 2),
        ]);

        wait_until(|| consumer.state() == LoopState::Stopped);
        assert_eq!(recorder.events.lock().len(), 1);
        assert!(consumer.wait_stopped(Duration::from_secs(1)));
    }

    #[test]
    fn test_wait_stopped_times_out_and_detaches() {
        struct Slow;
        impl EventHandler for Slow {
            fn handle(&self, _event: ProcessEvent) {
                thread::sleep(Duration::from_millis(300));
            }
        }

        let (bridge, handle) = started_bridge();
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::new(Slow),
            DEFAULT_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();

        handle.emit(&[
            RawProcessRecord::creation("slow.exe", 1),
            RawProcessRecord::creation("slow.exe", 2),
        ]);
        wait_until(|| bridge.get_pending_event_count() == 0);

        consumer.request_stop();
        bridge.stop_monitoring();
        assert!(!consumer.wait_stopped(Duration::from_millis(50)));
    }

    /// Blocks inside the handler for pid 1 until released
    struct Gated {
        entered: Sender<()>,
        release: Mutex<Receiver<()>>,
        seen: Mutex<Vec<u32>>,
    }

    impl Gated {
        fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let gated = Arc::new(Self {
                entered: entered_tx,
                release: Mutex::new(release_rx),
                seen: Mutex::new(Vec::new()),
            });
            (gated, entered_rx, release_tx)
        }
    }

    impl EventHandler for Gated {
        fn handle(&self, event: ProcessEvent) {
            if event.process_id() == 1 {
                let _ = self.entered.send(());
                let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            }
            self.seen.lock().push(event.process_id());
        }
    }

    #[test]
    fn test_stopping_delivers_events_queued_before_stop() {
        let (bridge, handle) = started_bridge();
        let (gated, entered, release) = Gated::new();
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::clone(&gated) as Arc<dyn EventHandler>,
            DEFAULT_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();

        handle.emit(&[RawProcessRecord::creation("a.exe", 1)]);
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        // Queued while the handler is busy, then stop without interrupting
        handle.emit(&[
            RawProcessRecord::creation("a.exe", 2),
            RawProcessRecord::creation("a.exe", 3),
        ]);
        consumer.request_stop();
        release.send(()).unwrap();

        let control = consumer.control();
        assert!(consumer.wait_stopped(Duration::from_secs(5)));
        assert_eq!(control.state(), LoopState::Stopped);
        assert_eq!(*gated.seen.lock(), vec![1, 2, 3]);
        assert_eq!(bridge.get_pending_event_count(), 0);
    }

    #[test]
    fn test_detached_loop_leaves_next_session_alone() {
        let (bridge, handle) = started_bridge();
        let (gated, entered, release) = Gated::new();
        let consumer = ConsumerLoop::spawn(
            Arc::clone(&bridge),
            Arc::clone(&gated) as Arc<dyn EventHandler>,
            DEFAULT_WAIT_TIMEOUT,
            DEFAULT_DRAIN_BATCH,
        )
        .unwrap();
        let control = consumer.control();

        handle.emit(&[
            RawProcessRecord::creation("a.exe", 1),
            RawProcessRecord::creation("a.exe", 2),
        ]);
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        consumer.request_stop();
        bridge.stop_monitoring();
        assert!(!consumer.wait_stopped(Duration::from_millis(50)));
        assert!(control.is_detached());

        // Next session starts while the old handler is still blocked
        bridge.cleanup();
        bridge.start_monitoring().unwrap();
        handle.emit(&[RawProcessRecord::creation("a.exe", 3)]);
        assert_eq!(bridge.get_pending_event_count(), 1);

        release.send(()).unwrap();
        wait_until(|| control.state() == LoopState::Stopped);

        assert_eq!(*gated.seen.lock(), vec![1]);
        assert_eq!(bridge.get_pending_event_count(), 1);
        assert_eq!(bridge.drain_events(usize::MAX).len(), 1);
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(LoopState::from_u8(0), LoopState::Idle);
        assert_eq!(LoopState::from_u8(3), LoopState::Stopped);
        assert_eq!(LoopState::from_u8(200), LoopState::Idle);
    }
}
