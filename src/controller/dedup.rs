//! Event deduplication
//!
//! The notification facility may report the same transition more than once
//! (overlapping queries, polling jitter). Two events are duplicates when kind,
//! process name, PID and the whole second of their timestamp all match.

use crate::monitor::{EventKind, ProcessEvent};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Default number of remembered signatures
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Identity of an event for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSignature {
    kind: EventKind,
    process_name: String,
    process_id: u32,
    second: i64,
}

impl EventSignature {
    /// Signature of `event`, with its timestamp truncated to whole seconds
    pub fn of(event: &ProcessEvent) -> Self {
        Self {
            kind: event.kind(),
            process_name: event.process_name().to_string(),
            process_id: event.process_id(),
            second: event.timestamp_ms().div_euclid(1000),
        }
    }
}

impl fmt::Display for EventSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.kind, self.process_name, self.process_id, self.second
        )
    }
}

/// Bounded set of recently seen signatures
///
/// Once more than `capacity` signatures are held, the older half (by insertion
/// order) is forgotten in one step.
#[derive(Debug)]
pub struct DedupFilter {
    seen: HashSet<EventSignature>,
    order: VecDeque<EventSignature>,
    capacity: usize,
}

impl DedupFilter {
    /// Create a filter remembering up to `capacity` signatures (minimum 2)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            seen: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Record `event` and report whether it is new
    pub fn should_emit(&mut self, event: &ProcessEvent) -> bool {
        let signature = EventSignature::of(event);
        if self.seen.contains(&signature) {
            return false;
        }

        self.seen.insert(signature.clone());
        self.order.push_back(signature);

        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Forget every signature
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    /// Number of remembered signatures
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no signatures are remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of remembered signatures
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
