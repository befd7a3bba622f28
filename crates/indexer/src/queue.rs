//! Priority-ordered buffer of decoded events.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use logtide_common::types::Event;

struct QueuedEvent(Event);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.position() == other.0.position()
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
        self.0.position().cmp(&other.0.position())
    }
}

/// Min-heap of events, ordered by `(block_number, log_index)`. Repeated
/// `pop` calls drain the buffer in ascending chain order regardless of
/// push order.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.heap.push(Reverse(QueuedEvent(event)));
    }

    /// Remove and return the earliest buffered event.
    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(QueuedEvent(event))| event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256};

    fn make_event(block_number: u64, log_index: u64) -> Event {
        Event {
            name: "Ping".to_string(),
            params: serde_json::json!({}),
            address: Address::repeat_byte(0x01),
            topic0: B256::repeat_byte(0x02),
            transaction_hash: B256::repeat_byte(0x03),
            block_number,
            log_index,
        }
    }

    #[test]
    fn test_drains_in_chain_order() {
        let mut queue = EventQueue::new();
        for (block, index) in [(5, 0), (1, 2), (3, 0), (1, 0), (3, 7)] {
            queue.push(make_event(block, index));
        }
        assert_eq!(queue.len(), 5);

        let mut drained = Vec::new();
        while let Some(event) = queue.pop() {
            drained.push(event.position());
        }
        assert_eq!(drained, vec![(1, 0), (1, 2), (3, 0), (3, 7), (5, 0)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pushes_during_drain_keep_order() {
        let mut queue = EventQueue::new();
        queue.push(make_event(2, 0));
        queue.push(make_event(4, 0));

        assert_eq!(queue.pop().unwrap().position(), (2, 0));
        queue.push(make_event(3, 0));
        assert_eq!(queue.pop().unwrap().position(), (3, 0));
        assert_eq!(queue.pop().unwrap().position(), (4, 0));
        assert!(queue.pop().is_none());
    }
}
