//! Virtual-Time Event Queue
//!
//! Single-threaded discrete-event queue. Time is the absolute slot number.
//! Events scheduled for the same instant are delivered in scheduling order.

use std::collections::{BinaryHeap, HashSet};
use tracing::trace;

/// Handle to a scheduled event, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

struct ScheduledEvent<E> {
    at: u64,
    seq: u64,
    event: E,
}

impl<E> PartialEq for ScheduledEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for ScheduledEvent<E> {}

impl<E> PartialOrd for ScheduledEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for ScheduledEvent<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time, then earliest scheduled)
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of future events keyed by virtual time
pub struct EventQueue<E> {
    now: u64,
    next_seq: u64,
    heap: BinaryHeap<ScheduledEvent<E>>,
    pending: HashSet<u64>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_seq: 0,
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
        }
    }

    /// Current virtual time (time of the last delivered event)
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule an event at an absolute time. Times in the past are clamped to now.
    pub fn schedule_at(&mut self, at: u64, event: E) -> EventId {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent { at, seq, event });
        self.pending.insert(seq);
        trace!("Scheduled event {} at slot {}", seq, at);
        EventId(seq)
    }

    /// Schedule an event `delay` slots after now
    pub fn schedule_in(&mut self, delay: u64, event: E) -> EventId {
        self.schedule_at(self.now + delay, event)
    }

    /// Cancel a scheduled event. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id.0)
    }

    /// Time of the next live event
    pub fn peek_time(&mut self) -> Option<u64> {
        while let Some(head) = self.heap.peek() {
            if self.pending.contains(&head.seq) {
                return Some(head.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Deliver the next live event, advancing virtual time to it
    pub fn pop(&mut self) -> Option<(u64, E)> {
        while let Some(scheduled) = self.heap.pop() {
            if !self.pending.remove(&scheduled.seq) {
                continue;
            }
            self.now = scheduled.at;
            return Some((scheduled.at, scheduled.event));
        }
        None
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule_at(5, "late");
        queue.schedule_at(1, "early");
        queue.schedule_at(3, "middle");

        assert_eq!(queue.pop(), Some((1, "early")));
        assert_eq!(queue.pop(), Some((3, "middle")));
        assert_eq!(queue.pop(), Some((5, "late")));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.now(), 5);
    }

    #[test]
    fn test_same_instant_is_fifo() {
        let mut queue = EventQueue::new();
        for i in 0..10 {
            queue.schedule_at(7, i);
        }
        let order: Vec<i32> = std::iter::from_fn(|| queue.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut queue = EventQueue::new();
        let a = queue.schedule_at(2, 'a');
        let b = queue.schedule_at(4, 'b');

        assert!(queue.cancel(a));
        assert!(!queue.cancel(a));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some((4, 'b')));

        // Cancelling an event that already fired has no effect
        assert!(!queue.cancel(b));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_schedule_in_is_relative_to_now() {
        let mut queue = EventQueue::new();
        queue.schedule_at(10, 0u8);
        queue.pop();
        queue.schedule_in(3, 1u8);
        queue.schedule_at(2, 2u8);
        assert_eq!(queue.peek_time(), Some(10));
        assert_eq!(queue.pop(), Some((10, 2)));
        assert_eq!(queue.pop(), Some((13, 1)));
    }
}
