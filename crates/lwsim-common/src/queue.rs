//! Deterministic event queue.
//!
//! Min-heap keyed by `(timestamp, sequence)`. Sequence numbers are
//! allocated monotonically at insertion, so events scheduled for the same
//! instant dispatch in insertion order. Cancellation marks the entry dead
//! and the heap skips it at pop time instead of removing it in place.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::{EventKind, SimTime};

/// Handle returned by [`EventQueue::insert`], usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// An event popped from the queue.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: SimTime,
    pub seq: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
struct QueuedEvent {
    time: SimTime,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap: earliest time first, then FIFO
        // by sequence number.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of timestamped events with dead-entry cancellation.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
    dead: HashSet<u64>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Schedule `kind` at `time`. O(log n).
    pub fn insert(&mut self, time: SimTime, kind: EventKind) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEvent { time, seq, kind });
        EventHandle(seq)
    }

    /// Mark an event dead. It will be silently skipped at pop time.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.dead.insert(handle.0);
    }

    /// Pop the earliest live event.
    pub fn pop(&mut self) -> Option<ScheduledEvent> {
        while let Some(ev) = self.heap.pop() {
            if self.dead.remove(&ev.seq) {
                continue;
            }
            return Some(ScheduledEvent {
                time: ev.time,
                seq: ev.seq,
                kind: ev.kind,
            });
        }
        None
    }

    /// Timestamp of the earliest live event without removing it.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        while let Some(ev) = self.heap.peek() {
            if self.dead.contains(&ev.seq) {
                let seq = ev.seq;
                self.heap.pop();
                self.dead.remove(&seq);
                continue;
            }
            return Some(ev.time);
        }
        None
    }

    /// Number of entries still in the heap (live and dead).
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every pending event. Used when a time or packet budget is hit
    /// and the remaining queue must be drained without dispatch.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.dead.clear();
    }
}
