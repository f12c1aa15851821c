//! Bounded event queue with an availability signal
//!
//! Decouples the notification adapter (running on platform-owned threads) from
//! the consumer. One `parking_lot::Mutex` guards the events, the signal flag and
//! the closed flag; a `Condvar` lets the consumer block without polling.
//!
//! Overflow policy is drop-oldest: a push never blocks and never fails, but the
//! earliest queued events are evicted once capacity is exceeded.

use crate::monitor::event::ProcessEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Result of waiting on the availability signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The signal was set (new events, or an interrupt from `stop`)
    Available,
    /// The timeout elapsed without a signal; this is not an error
    TimedOut,
    /// The queue is closed (never started or already cleaned up)
    Error,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<ProcessEvent>,
    /// Auto-reset: consumed by the waiter that observes it
    signaled: bool,
    closed: bool,
    evicted: u64,
    /// Bumped by `close` and `reopen`; identifies one monitoring session
    generation: u64,
}

/// Thread-safe FIFO of process events with a fixed capacity
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Create an open queue holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                signaled: false,
                closed: false,
                evicted: 0,
                generation: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of queued events
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest entries on overflow
    ///
    /// Always sets the availability signal, even when an eviction occurred.
    /// Returns the number of events evicted by this push.
    pub fn push(&self, event: ProcessEvent) -> usize {
        let evicted = {
            let mut state = self.state.lock();
            state.events.push_back(event);
            let mut evicted = 0;
            while state.events.len() > self.capacity {
                state.events.pop_front();
                evicted += 1;
            }
            state.evicted += evicted as u64;
            state.signaled = true;
            evicted
        };
        self.available.notify_one();
        evicted
    }

    /// Remove and return up to `max_count` events, oldest first
    pub fn drain(&self, max_count: usize) -> Vec<ProcessEvent> {
        let mut state = self.state.lock();
        let count = max_count.min(state.events.len());
        state.events.drain(..count).collect()
    }

    /// Like [`EventQueue::drain`], but only while the queue is still in
    /// `generation`
    ///
    /// A consumer left over from an earlier session gets nothing from a
    /// queue that has since been closed or reopened.
    pub fn drain_generation(&self, generation: u64, max_count: usize) -> Vec<ProcessEvent> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Vec::new();
        }
        let count = max_count.min(state.events.len());
        state.events.drain(..count).collect()
    }

    /// Current session generation
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Remove and return the oldest event
    pub fn pop(&self) -> Option<ProcessEvent> {
        self.state.lock().events.pop_front()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Whether no events are queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    /// Total events evicted by overflow since creation
    pub fn evicted_count(&self) -> u64 {
        self.state.lock().evicted
    }

    /// Drop all queued events and reset the signal
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.signaled = false;
    }

    /// Block until the signal is set or `timeout` elapses
    pub fn wait_for_availability(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        while !state.signaled && !state.closed {
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.available.wait(&mut state),
            }
        }

        if state.closed {
            WaitOutcome::Error
        } else if state.signaled {
            state.signaled = false;
            WaitOutcome::Available
        } else {
            WaitOutcome::TimedOut
        }
    }

    /// Set the signal without adding data so a blocked waiter re-checks its stop flag
    pub fn interrupt(&self) {
        self.state.lock().signaled = true;
        self.available.notify_all();
    }

    /// Discard all events and make every wait return [`WaitOutcome::Error`]
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.signaled = false;
            state.generation += 1;
            state.events.clear();
        }
        self.available.notify_all();
    }

    /// Reopen a closed queue for a new session, starting empty
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.signaled = false;
        state.generation += 1;
        state.events.clear();
    }

    /// Whether the queue is closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::event::EventKind;
    use std::sync::Arc;
    use std::thread;

    fn event(pid: u32) -> ProcessEvent {
        ProcessEvent::new(EventKind::Start, "app.exe", pid, i64::from(pid))
    }

    #[test]
    fn test_push_and_drain_fifo() {
        let queue = EventQueue::new(10);
        for pid in 1..=3 {
            queue.push(event(pid));
        }

        let drained = queue.drain(10);
        let pids: Vec<u32> = drained.iter().map(ProcessEvent::process_id).collect();
        assert_eq!(pids, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_respects_max_count() {
        let queue = EventQueue::new(10);
        for pid in 1..=5 {
            queue.push(event(pid));
        }

        let first = queue.drain(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].process_id(), 1);
        assert_eq!(queue.len(), 3);

        assert!(queue.drain(0).is_empty());
    }

    #[test]
    fn test_drain_generation_ignores_later_sessions() {
        let queue = EventQueue::new(10);
        let first = queue.generation();
        queue.push(event(1));
        assert_eq!(queue.drain_generation(first, 10).len(), 1);

        queue.close();
        queue.reopen();
        queue.push(event(2));
        assert!(queue.drain_generation(first, 10).is_empty());
        assert_eq!(queue.len(), 1, "the new session keeps its events");

        let pids: Vec<u32> = queue
            .drain_generation(queue.generation(), 10)
            .iter()
            .map(ProcessEvent::process_id)
            .collect();
        assert_eq!(pids, vec![2]);
    }

    #[test]
    fn test_drain_empty_queue() {
        let queue = EventQueue::new(10);
        assert!(queue.drain(100).is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = EventQueue::new(3);
        for pid in 1..=5 {
            queue.push(event(pid));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.evicted_count(), 2);
        let pids: Vec<u32> = queue.drain(10).iter().map(ProcessEvent::process_id).collect();
        assert_eq!(pids, vec![3, 4, 5], "most recent events must survive");
    }

    #[test]
    fn test_push_signals_even_when_evicting() {
        let queue = EventQueue::new(1);
        queue.push(event(1));
        assert_eq!(queue.wait_for_availability(Duration::ZERO), WaitOutcome::Available);

        assert_eq!(queue.push(event(2)), 1);
        assert_eq!(queue.wait_for_availability(Duration::ZERO), WaitOutcome::Available);
    }

    #[test]
    fn test_signal_is_auto_reset() {
        let queue = EventQueue::new(10);
        queue.push(event(1));

        assert_eq!(queue.wait_for_availability(Duration::ZERO), WaitOutcome::Available);
        assert_eq!(
            queue.wait_for_availability(Duration::from_millis(20)),
            WaitOutcome::TimedOut,
            "signal must be consumed by the first waiter"
        );
        // The data itself is still there
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let queue = EventQueue::new(10);
        let start = Instant::now();
        assert_eq!(
            queue.wait_for_availability(Duration::from_millis(50)),
            WaitOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_wakes_on_push_from_other_thread() {
        let queue = Arc::new(EventQueue::new(10));
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(event(7));
        });

        let outcome = queue.wait_for_availability(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Available);
        assert_eq!(queue.pop().map(|e| e.process_id()), Some(7));
    }

    #[test]
    fn test_interrupt_wakes_waiter_without_data() {
        let queue = Arc::new(EventQueue::new(10));
        let interrupter = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            interrupter.interrupt();
        });

        let start = Instant::now();
        let outcome = queue.wait_for_availability(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Available);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_reports_error() {
        let queue = EventQueue::new(10);
        queue.push(event(1));
        queue.close();

        assert!(queue.is_closed());
        assert!(queue.is_empty(), "close discards queued events");
        assert_eq!(queue.wait_for_availability(Duration::from_secs(1)), WaitOutcome::Error);

        queue.reopen();
        assert!(!queue.is_closed());
        assert_eq!(
            queue.wait_for_availability(Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_close_wakes_blocked_waiter() {
        let queue = Arc::new(EventQueue::new(10));
        let closer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            closer.close();
        });

        assert_eq!(queue.wait_for_availability(Duration::from_secs(5)), WaitOutcome::Error);
        handle.join().unwrap();
    }

    #[test]
    fn test_clear_resets_signal() {
        let queue = EventQueue::new(10);
        queue.push(event(1));
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(
            queue.wait_for_availability(Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = EventQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.pop().map(|e| e.process_id()), Some(2));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: the queue never exceeds its capacity and keeps the newest events
            #[test]
            fn queue_is_bounded_and_keeps_newest(
                capacity in 1usize..64,
                pushes in 0usize..256,
            ) {
                let queue = EventQueue::new(capacity);
                for pid in 0..pushes {
                    queue.push(event(u32::try_from(pid).unwrap()));
                    prop_assert!(queue.len() <= capacity);
                }

                let expected: Vec<u32> = (pushes.saturating_sub(capacity)..pushes)
                    .map(|pid| u32::try_from(pid).unwrap())
                    .collect();
                let drained: Vec<u32> =
                    queue.drain(usize::MAX).iter().map(ProcessEvent::process_id).collect();
                prop_assert_eq!(drained, expected);
            }
        }
    }
}
