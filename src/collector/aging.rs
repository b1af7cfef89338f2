//! Min-heap of per-record age deadlines.
//!
//! Each live record owns exactly one entry. Touching a record does not move
//! its entry; when the entry fires early the collector reschedules it at the
//! record's current deadline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::types::Tuple;

#[derive(Default)]
pub struct ExpiryQueue {
    heap: BinaryHeap<Reverse<(Instant, Tuple)>>,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, tuple: Tuple, deadline: Instant) {
        self.heap.push(Reverse((deadline, tuple)));
    }

    /// Earliest scheduled deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pops the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, Tuple)> {
        match self.heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => self.heap.pop().map(|Reverse(entry)| entry),
            _ => None,
        }
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
    use crate::types::PROTO_UDP;
    use std::time::Duration;

    fn tuple(port: u16) -> Tuple {
        Tuple::new("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), PROTO_UDP, port, 53)
    }

    #[test]
    fn test_pops_in_deadline_order_when_due() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        queue.schedule(tuple(3), base + Duration::from_secs(3));
        queue.schedule(tuple(1), base + Duration::from_secs(1));
        queue.schedule(tuple(2), base + Duration::from_secs(2));

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(1)));
        assert!(queue.pop_due(base).is_none());

        let now = base + Duration::from_secs(2);
        assert_eq!(queue.pop_due(now).map(|(_, t)| t), Some(tuple(1)));
        assert_eq!(queue.pop_due(now).map(|(_, t)| t), Some(tuple(2)));
        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);
    }
}
