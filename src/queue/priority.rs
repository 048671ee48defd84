//! Bounded priority heap.
//!
//! Higher [`Priority`] pops first; within one priority items pop in push
//! order. The lock is a `parking_lot` mutex and is never held across an
//! `.await`.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::types::Priority;

/// Heap entry. Ordered by `(priority, Reverse(seq))` only.
struct Slot<T> {
    rank: (Priority, Reverse<u64>),
    item: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

struct Inner<T> {
    heap: BinaryHeap<Slot<T>>,
    next_seq: u64,
}

/// Bounded priority queue.
pub struct PriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    /// Queue holding at most `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
        }
    }

    /// Push `item`, returning the new depth.
    ///
    /// # Errors
    ///
    /// Gives the item back when the queue is at capacity.
    pub fn push(&self, priority: Priority, item: T) -> Result<usize, T> {
        let mut inner = self.inner.lock();
        if inner.heap.len() >= self.capacity {
            return Err(item);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Slot {
            rank: (priority, Reverse(seq)),
            item,
        });
        Ok(inner.heap.len())
    }

    /// Pop the highest-priority item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().heap.pop().map(|slot| slot.item)
    }

    /// Pop up to `max` items in priority order under one lock.
    pub fn pop_many(&self, max: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.heap.len());
        (0..take)
            .filter_map(|_| inner.heap.pop().map(|slot| slot.item))
            .collect()
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_before_normal_before_low() {
        let queue = PriorityQueue::with_capacity(10);
        for (p, name) in [
            (Priority::Low, "low"),
            (Priority::High, "high"),
            (Priority::Normal, "normal"),
        ] {
            queue.push(p, name).expect("test: push");
        }
        assert_eq!(queue.pop_many(10), vec!["high", "normal", "low"]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_same_priority_keeps_arrival_order() {
        let queue = PriorityQueue::with_capacity(10);
        for n in 0..5 {
            queue.push(Priority::Normal, n).expect("test: push");
        }
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop_many(2), vec![1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_returns_the_item() {
        let queue = PriorityQueue::with_capacity(2);
        assert_eq!(queue.push(Priority::Normal, 'a'), Ok(1));
        assert_eq!(queue.push(Priority::Normal, 'b'), Ok(2));
        assert_eq!(queue.push(Priority::High, 'c'), Err('c'));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_pop_many_on_empty_is_empty() {
        let queue: PriorityQueue<u8> = PriorityQueue::with_capacity(4);
        assert!(queue.is_empty());
        assert!(queue.pop_many(3).is_empty());
    }
}
