//! Lifecycle controller
//!
//! `ProcessMonitor` owns the event bridge, the consumer loop and the event
//! pipeline, and starts and tears them down together.
//!
//! # Sessions
//!
//! - `start_global` / `start_process_specific` subscribe the source and spawn
//!   the consumer
//! - `stop` only signals: the stop flag is set and the bridge stops accepting
//!   events, waking the consumer
//! - `cleanup` releases everything once; repeated or concurrent calls are
//!   no-ops until the next start
//!
//! Each start builds a fresh [`EventPipeline`] session (dedup window and
//! instance tracker). A consumer detached by a slow cleanup keeps its own
//! session and cannot reach the next one.
//!
//! Dropping a running monitor signals stop but releases nothing.

use crate::config::{MonitorSettings, WatchedProcess};
use crate::controller::consumer::{ConsumerLoop, LoopControl, LoopState};
use crate::controller::pipeline::{EventHandler, EventPipeline, PipelineStats};
use crate::controller::tracker::{InstanceTracker, ProcessConfig};
use crate::error::{LastError, ProcessMonitorError, Result, describe_panic};
use crate::monitor::source::{self, NotificationSource};
use crate::monitor::{BridgeStats, Clock, EventBridge, ProcessEvent, system_clock};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Combined counters of a monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Queue and adapter counters
    #[serde(flatten)]
    pub bridge: BridgeStats,
    /// Dedup and callback counters
    #[serde(flatten)]
    pub pipeline: PipelineStats,
}

/// Process lifecycle monitor
pub struct ProcessMonitor {
    settings: MonitorSettings,
    bridge: Arc<EventBridge>,
    /// Pipeline of the latest session
    pipeline: Mutex<Arc<EventPipeline>>,
    /// Serializes start and cleanup; holds the live consumer
    consumer: Mutex<Option<ConsumerLoop>>,
    /// Control of the latest session, readable without the lifecycle lock
    ///
    /// Also orders `stop` against the end of a start.
    control: Mutex<Option<LoopControl>>,
    running: AtomicBool,
    cleaned_up: AtomicBool,
    last_error: LastError,
}

impl ProcessMonitor {
    /// Create a monitor over `source`
    pub fn new(source: Box<dyn NotificationSource>, settings: &MonitorSettings) -> Self {
        Self::with_clock(source, settings, system_clock())
    }

    /// Create a monitor over the source selected in `settings`
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self::new(source::from_settings(settings), settings)
    }

    /// Create a monitor whose events are stamped by `clock`
    pub fn with_clock(
        source: Box<dyn NotificationSource>,
        settings: &MonitorSettings,
        clock: Clock,
    ) -> Self {
        let settings = settings.validated();
        let last_error = LastError::new();

        let bridge = Arc::new(EventBridge::with_last_error(
            source,
            settings.queue_capacity,
            clock,
            last_error.clone(),
        ));
        let pipeline = EventPipeline::new(settings.dedup_capacity, last_error.clone());

        Self {
            settings,
            bridge,
            pipeline: Mutex::new(Arc::new(pipeline)),
            consumer: Mutex::new(None),
            control: Mutex::new(None),
            running: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            last_error,
        }
    }

    /// Receive every deduplicated event
    ///
    /// Events are sent without blocking; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<ProcessEvent> {
        let (tx, rx) = mpsc::channel();
        self.current_pipeline().add_subscriber(tx);
        rx
    }

    /// Monitor every process without callback routing
    ///
    /// Returns `Ok` without doing anything while a session is running.
    pub fn start_global(&self) -> Result<()> {
        let mut consumer = self.consumer.lock();
        if self.running.load(Ordering::SeqCst) {
            debug!("Process monitor already running");
            return Ok(());
        }

        self.start_session(&mut consumer, InstanceTracker::new())
    }

    /// Monitor every process and route start/stop callbacks for `configs`
    pub fn start_process_specific(&self, configs: Vec<ProcessConfig>) -> Result<()> {
        if configs.is_empty() {
            return Err(self.fail(ProcessMonitorError::NoProcessConfigs));
        }

        let mut consumer = self.consumer.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(self.fail(ProcessMonitorError::AlreadyRunning));
        }

        info!(
            "Starting process-specific monitoring for {} process(es)",
            configs.len()
        );
        let mut tracker = InstanceTracker::new();
        tracker.configure(configs);
        self.start_session(&mut consumer, tracker)
    }

    /// Start with callback rules taken from configuration entries
    pub fn start_watching(
        &self,
        watched: &[WatchedProcess],
        on_start: impl Fn(&ProcessEvent) + Send + Sync + Clone + 'static,
        on_stop: impl Fn(&ProcessEvent) + Send + Sync + Clone + 'static,
    ) -> Result<()> {
        let configs = watched
            .iter()
            .map(|entry| {
                ProcessConfig::new(entry.process_name.clone())
                    .on_start(on_start.clone())
                    .on_stop(on_stop.clone())
                    .allow_multiple_start_callbacks(entry.allow_multiple_start_callbacks)
                    .allow_multiple_stop_callbacks(entry.allow_multiple_stop_callbacks)
            })
            .collect();
        self.start_process_specific(configs)
    }

    /// Runs with the lifecycle lock held
    ///
    /// A `stop` racing with the start wins: the session is torn down again
    /// and `Ok` is returned without the monitor running.
    fn start_session(
        &self,
        consumer: &mut Option<ConsumerLoop>,
        tracker: InstanceTracker,
    ) -> Result<()> {
        if let Some(stale) = consumer.take() {
            debug!("Retiring stopped session before restart");
            stale.request_stop();
            self.bridge.stop_monitoring();
            stale.wait_stopped(self.cleanup_timeout());
        }

        self.bridge.start_monitoring()?;

        let session = Arc::new(self.current_pipeline().next_session(tracker));
        let spawned = match ConsumerLoop::spawn(
            Arc::clone(&self.bridge),
            Arc::clone(&session) as Arc<dyn EventHandler>,
            Duration::from_millis(self.settings.wait_timeout_ms),
            self.settings.drain_batch_size,
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to spawn event consumer: {e}");
                self.bridge.stop_monitoring();
                self.bridge.cleanup();
                return Err(self.fail(e));
            }
        };
        *self.pipeline.lock() = session;
        self.cleaned_up.store(false, Ordering::SeqCst);

        let mut control = self.control.lock();
        *control = Some(spawned.control());
        if !self.bridge.is_monitoring() {
            warn!("Process monitor stopped while starting");
            spawned.request_stop();
            self.bridge.stop_monitoring();
            *consumer = Some(spawned);
            return Ok(());
        }

        *consumer = Some(spawned);
        self.running.store(true, Ordering::SeqCst);
        info!("Process monitor started");
        Ok(())
    }

    /// Signal the session to stop and return immediately
    ///
    /// Resources stay allocated until [`ProcessMonitor::cleanup`].
    pub fn stop(&self) {
        let guard = self.control.lock();
        if let Some(control) = guard.as_ref() {
            control.request_stop();
        }
        self.bridge.stop_monitoring();
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Process monitor stopping");
        }
    }

    /// Stop and release every resource
    ///
    /// Waits up to the cleanup timeout for the consumer, then detaches it. Each
    /// step runs even if an earlier one panicked.
    pub fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("Process monitor cleanup already performed");
            return;
        }

        let mut consumer = self.consumer.lock();
        self.run_step("stop", || self.stop());

        if let Some(consumer) = consumer.take() {
            let timeout = self.cleanup_timeout();
            self.run_step("consumer shutdown", move || {
                consumer.wait_stopped(timeout);
            });
        }

        self.run_step("bridge cleanup", || self.bridge.cleanup());
        self.run_step("session reset", || self.reset_session());
        self.last_error.clear();
        info!("Process monitor cleaned up");
    }

    /// Whether a session is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// State of the latest consumer loop (`Idle` before the first start)
    pub fn loop_state(&self) -> LoopState {
        self.control
            .lock()
            .as_ref()
            .map_or(LoopState::Idle, LoopControl::state)
    }

    /// Message of the most recent failure, empty when none
    pub fn get_last_error(&self) -> String {
        self.last_error.get()
    }

    /// PIDs believed running for a watched `process_name`, ascending
    pub fn running_instances(&self, process_name: &str) -> Vec<u32> {
        self.current_pipeline().running_instances(process_name)
    }

    /// Current counters
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            bridge: self.bridge.stats(),
            pipeline: self.current_pipeline().stats(),
        }
    }

    /// Effective (validated) settings
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    fn current_pipeline(&self) -> Arc<EventPipeline> {
        Arc::clone(&self.pipeline.lock())
    }

    /// Replace the session with an empty one; subscribers carry over
    fn reset_session(&self) {
        let mut pipeline = self.pipeline.lock();
        let empty = Arc::new(pipeline.next_session(InstanceTracker::new()));
        *pipeline = empty;
    }

    fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.cleanup_timeout_ms)
    }

    fn fail(&self, error: ProcessMonitorError) -> ProcessMonitorError {
        self.last_error.set(&error);
        error
    }

    fn run_step(&self, step: &str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            warn!(
                "Cleanup step '{step}' failed: {}",
                describe_panic(payload.as_ref())
            );
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("ProcessMonitor dropped while running; call cleanup() to release resources");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::source::RecordHandler;
    use crate::monitor::{ManualSource, ManualSourceHandle, RawProcessRecord};
    use std::sync::{OnceLock, Weak};
    use std::thread;
    use std::time::Instant;

    fn monitor() -> (ProcessMonitor, ManualSourceHandle) {
        let (source, handle) = ManualSource::new();
        (
            ProcessMonitor::new(Box::new(source), &MonitorSettings::default()),
            handle,
        )
    }

    fn wait_for_state(monitor: &ProcessMonitor, state: LoopState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.loop_state() != state {
            assert!(Instant::now() < deadline, "consumer never reached {state:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_global_is_idempotent() {
        let (monitor, handle) = monitor();
        assert_eq!(monitor.loop_state(), LoopState::Idle);

        monitor.start_global().unwrap();
        monitor.start_global().unwrap();
        assert!(monitor.is_running());
        assert_eq!(handle.subscribe_calls(), 1);

        wait_for_state(&monitor, LoopState::Running);
        monitor.cleanup();
    }

    #[test]
    fn test_process_specific_requires_configs() {
        let (monitor, handle) = monitor();
        let result = monitor.start_process_specific(Vec::new());

        assert!(matches!(result, Err(ProcessMonitorError::NoProcessConfigs)));
        assert!(!monitor.is_running());
        assert_eq!(handle.subscribe_calls(), 0);
        assert!(!monitor.get_last_error().is_empty());
    }

    #[test]
    fn test_process_specific_while_running_fails() {
        let (monitor, _handle) = monitor();
        monitor.start_global().unwrap();

        let result = monitor.start_process_specific(vec![ProcessConfig::new("a.exe")]);
        assert!(matches!(result, Err(ProcessMonitorError::AlreadyRunning)));
        monitor.cleanup();
    }

    #[test]
    fn test_subscription_failure_starts_nothing() {
        let (monitor, handle) = monitor();
        handle.fail_subscribe(Some("WMI service stopped"));

        let result = monitor.start_process_specific(vec![ProcessConfig::new("a.exe")]);
        assert!(matches!(result, Err(ProcessMonitorError::Subscription(_))));
        assert!(!monitor.is_running());
        assert_eq!(monitor.loop_state(), LoopState::Idle, "no consumer was spawned");
        assert!(monitor.get_last_error().contains("WMI service stopped"));
        assert!(monitor.running_instances("a.exe").is_empty());
    }

    #[test]
    fn test_stop_then_cleanup() {
        let (monitor, handle) = monitor();
        monitor.start_global().unwrap();
        wait_for_state(&monitor, LoopState::Running);

        monitor.stop();
        assert!(!monitor.is_running());
        assert!(handle.is_subscribed(), "stop keeps the subscription");
        wait_for_state(&monitor, LoopState::Stopped);

        monitor.cleanup();
        assert!(!handle.is_subscribed());
        assert_eq!(handle.unsubscribe_calls(), 1);

        monitor.cleanup();
        assert_eq!(handle.unsubscribe_calls(), 1);
    }

    #[test]
    fn test_restart_after_stop_without_cleanup() {
        let (monitor, handle) = monitor();
        let events = monitor.subscribe();
        monitor.start_global().unwrap();
        monitor.stop();

        monitor.start_global().unwrap();
        wait_for_state(&monitor, LoopState::Running);
        handle.emit(&[RawProcessRecord::creation("again.exe", 1)]);

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.process_name(), "again.exe");
        monitor.cleanup();
    }

    #[test]
    fn test_restart_after_cleanup_rearms_guard() {
        let (monitor, handle) = monitor();
        monitor.start_global().unwrap();
        monitor.cleanup();
        monitor.start_global().unwrap();
        monitor.cleanup();
        assert_eq!(handle.unsubscribe_calls(), 2);
    }

    #[test]
    fn test_drop_while_running_only_signals() {
        let (monitor, handle) = monitor();
        monitor.start_global().unwrap();
        drop(monitor);
        assert!(handle.is_subscribed(), "drop must not release the subscription");
    }

    /// Calls `stop` on the monitor from inside the first subscribe
    struct StopDuringSubscribe {
        monitor: Arc<OnceLock<Weak<ProcessMonitor>>>,
        fired: bool,
    }

    impl NotificationSource for StopDuringSubscribe {
        fn name(&self) -> &'static str {
            "stop-during-subscribe"
        }

        fn subscribe(&mut self, _handler: RecordHandler) -> Result<()> {
            if !self.fired {
                self.fired = true;
                if let Some(monitor) = self.monitor.get().and_then(Weak::upgrade) {
                    monitor.stop();
                }
            }
            Ok(())
        }

        fn unsubscribe(&mut self) {}
    }

    #[test]
    fn test_stop_during_start_is_not_lost() {
        let slot = Arc::new(OnceLock::new());
        let source = StopDuringSubscribe {
            monitor: Arc::clone(&slot),
            fired: false,
        };
        let monitor = Arc::new(ProcessMonitor::new(
            Box::new(source),
            &MonitorSettings::default(),
        ));
        slot.set(Arc::downgrade(&monitor)).unwrap();

        monitor.start_global().unwrap();
        assert!(!monitor.is_running());
        wait_for_state(&monitor, LoopState::Stopped);

        // The stopped session does not block the next start
        monitor.start_global().unwrap();
        assert!(monitor.is_running());
        wait_for_state(&monitor, LoopState::Running);
        monitor.cleanup();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_cleanup_starts_an_empty_session() {
        let (monitor, handle) = monitor();
        monitor
            .start_process_specific(vec![ProcessConfig::new("a.exe")])
            .unwrap();
        handle.emit(&[RawProcessRecord::creation("a.exe", 7)]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.running_instances("a.exe").is_empty() {
            assert!(Instant::now() < deadline, "pid 7 never tracked");
            thread::sleep(Duration::from_millis(5));
        }

        monitor.cleanup();
        assert!(monitor.running_instances("a.exe").is_empty());
        assert_eq!(monitor.stats().pipeline.emitted, 1);
    }
}
