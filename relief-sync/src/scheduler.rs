//! Deterministic retry scheduling
//!
//! A min-heap of `(fire_at, change_id)` pairs polled by the engine's
//! driver loop. Keeping this a plain data structure with an explicit
//! clock argument means retry timing is unit-testable with synthetic
//! timestamps instead of mocked timers.
//!
//! Cancellation is lazy: the `armed` map is authoritative, and heap
//! entries whose fire time no longer matches it are discarded when they
//! surface. A stale entry that fires early is harmless anyway, because
//! the store re-checks `next_retry` before handing an item out.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryTask {
    fire_at: DateTime<Utc>,
    change_id: Uuid,
}

impl Ord for RetryTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.change_id.cmp(&other.change_id))
    }
}

impl PartialOrd for RetryTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending per-item retry timers
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<RetryTask>>,
    /// Authoritative fire time per change; heap entries that disagree are stale
    armed: HashMap<Uuid, DateTime<Utc>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the retry timer for a change
    pub fn schedule(&mut self, change_id: Uuid, fire_at: DateTime<Utc>) {
        self.armed.insert(change_id, fire_at);
        self.heap.push(Reverse(RetryTask { fire_at, change_id }));
    }

    /// Disarm the retry timer for a change, if one is pending
    pub fn cancel(&mut self, change_id: Uuid) {
        self.armed.remove(&change_id);
    }

    /// Take every change whose timer has fired by `now`
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        loop {
            let head = match self.heap.peek() {
                Some(Reverse(task)) => *task,
                None => break,
            };
            if head.fire_at > now {
                break;
            }
            self.heap.pop();
            if self.armed.get(&head.change_id) == Some(&head.fire_at) {
                self.armed.remove(&head.change_id);
                due.push(head.change_id);
            }
        }
        due
    }

    /// Earliest pending fire time, discarding stale heap entries
    pub fn next_fire_at(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let head = match self.heap.peek() {
                Some(Reverse(task)) => *task,
                None => return None,
            };
            if self.armed.get(&head.change_id) == Some(&head.fire_at) {
                return Some(head.fire_at);
            }
            self.heap.pop();
        }
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.heap.clear();
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
