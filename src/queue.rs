//! Blocking FIFO queues ordered by chain sequence id.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::job::JobRef;

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    order: u64,
    tick: u64,
    job: JobRef,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<Entry>>,
    tick: u64,
    closed: bool,
}

/// FIFO queue keyed by an ordering value.
///
/// Entries with the same key pop in push order. Across keys the smallest
/// key wins, so one chain's jobs resolve before a later chain's.
/// `pop` blocks the calling thread. It is only ever called from a
/// per-thread scheduling loop, never from inside a suspended job.
pub(crate) struct OrderedQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl OrderedQueue {
    pub fn new() -> Self {
        OrderedQueue {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                tick: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, job: JobRef, order: u64) {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.closed, "pushed to a closed queue");
        let tick = inner.tick;
        inner.tick += 1;
        inner.heap.push(Reverse(Entry { order, tick, job }));
        drop(inner);
        self.available.notify_one();
    }

    /// Blocks until an entry is available or the queue is closed; `None`
    /// means closed. Remaining entries still drain after close.
    pub fn pop(&self) -> Option<JobRef> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(Reverse(entry)) = inner.heap.pop() {
                return Some(entry.job);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<JobRef> {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.pop().map(|Reverse(entry)| entry.job)
    }

    /// Permanently wakes every blocked popper.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(slot: u32) -> JobRef {
        JobRef {
            slot,
            generation: 1,
        }
    }

    #[test]
    fn fifo_within_one_order_key() {
        let queue = OrderedQueue::new();
        for slot in 0..5 {
            queue.push(job(slot), 42);
        }
        for slot in 0..5 {
            assert_eq!(queue.try_pop(), Some(job(slot)));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn lower_order_keys_pop_first() {
        let queue = OrderedQueue::new();
        queue.push(job(1), 9);
        queue.push(job(2), 3);
        queue.push(job(3), 9);
        queue.push(job(4), 3);
        assert_eq!(queue.try_pop(), Some(job(2)));
        assert_eq!(queue.try_pop(), Some(job(4)));
        assert_eq!(queue.try_pop(), Some(job(1)));
        assert_eq!(queue.try_pop(), Some(job(3)));
    }

    #[test]
    fn close_wakes_blocked_poppers() {
        let queue = Arc::new(OrderedQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn entries_drain_after_close() {
        let queue = OrderedQueue::new();
        queue.push(job(1), 1);
        queue.close();
        assert_eq!(queue.pop(), Some(job(1)));
        assert_eq!(queue.pop(), None);
    }
}
