//! Pooled completion counters (generalized counting semaphores).
//!
//! A counter is created with a positive count and signaled down to zero by
//! collaborating jobs. The moment the count reaches zero the counter
//! *settles*: every waiter is released, the slot goes back to the free list
//! and its generation is bumped, which invalidates every handle copy still
//! held by callers. Checking a stale handle is the one expected soft outcome
//! ("already done"); signaling or waiting on one without checking first is a
//! protocol violation.

use std::sync::{Condvar, Mutex};

use crate::job::JobRef;

/// Handle to a pooled counter: a stable slot index plus the generation the
/// slot had when the counter was created. Generation zero is reserved for
/// the empty handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle {
    slot: u32,
    generation: u32,
}

impl CounterHandle {
    /// The empty handle: always settled, never signalable.
    pub const EMPTY: CounterHandle = CounterHandle {
        slot: 0,
        generation: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.generation == 0
    }

    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        CounterHandle { slot, generation }
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for CounterHandle {
    fn default() -> Self {
        Self::EMPTY
    }
}

struct CounterSlot {
    /// Current generation; a handle is live only while this matches.
    generation: u32,
    /// Live count; meaningful only while allocated.
    count: u32,
    allocated: bool,
    /// Jobs parked on this counter, released in insertion order on settle.
    waiters: Vec<JobRef>,
    name: &'static str,
}

struct PoolInner {
    slots: Vec<CounterSlot>,
    free: Vec<u32>,
}

/// Fixed-capacity counter pool guarded by a single mutex.
///
/// The live count and the waiter list of a slot only ever change under that
/// mutex; nothing suspends while holding it. There is deliberately no
/// fast-path decrement outside the lock.
pub(crate) struct CounterPool {
    inner: Mutex<PoolInner>,
    /// Notified on every settle; backs blocking waits from threads that are
    /// not part of the scheduler.
    settled: Condvar,
}

fn bump_generation(generation: u32) -> u32 {
    let next = generation.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

impl CounterPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(CounterSlot {
                generation: 1,
                count: 0,
                allocated: false,
                waiters: Vec::new(),
                name: "",
            });
        }
        let free = (0..capacity as u32).rev().collect();
        CounterPool {
            inner: Mutex::new(PoolInner { slots, free }),
            settled: Condvar::new(),
        }
    }

    /// Allocates a counter with the given initial count. A zero count means
    /// there is nothing to wait for and yields the empty handle. Exhausting
    /// the pool is fatal.
    pub fn create(&self, name: &'static str, count: u32) -> CounterHandle {
        if count == 0 {
            return CounterHandle::EMPTY;
        }
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.free.pop().expect("counter pool exhausted");
        let entry = &mut inner.slots[slot as usize];
        assert!(!entry.allocated, "free-list counter slot marked allocated");
        assert!(entry.waiters.is_empty(), "free-list counter slot has waiters");
        entry.allocated = true;
        entry.count = count;
        entry.name = name;
        CounterHandle {
            slot,
            generation: entry.generation,
        }
    }

    /// True once the counter has reached zero and been recycled (or the
    /// handle is empty). This is the only non-fatal stale-handle operation.
    pub fn is_settled(&self, handle: CounterHandle) -> bool {
        if handle.is_empty() {
            return true;
        }
        let inner = self.inner.lock().unwrap();
        inner.slots[handle.slot() as usize].generation != handle.generation()
    }

    /// Links `job` onto the counter's wait list. Returns false if the
    /// counter already settled, in which case the caller must reschedule
    /// the job instead.
    pub fn add_waiter(&self, handle: CounterHandle, job: JobRef) -> bool {
        if handle.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.slots[handle.slot() as usize];
        if entry.generation != handle.generation() {
            return false;
        }
        debug_assert!(entry.allocated);
        entry.waiters.push(job);
        true
    }

    /// Decrements the live count by `n`. Returns the detached waiter list
    /// when the count reaches exactly zero; by then the slot has been
    /// recycled and its generation bumped, so the handle is already dead
    /// when the waiters are handed back. Signaling a settled counter or
    /// dropping the count below zero is a fatal protocol violation.
    pub fn signal(&self, handle: CounterHandle, n: u32) -> Option<Vec<JobRef>> {
        assert!(!handle.is_empty(), "signaled an empty counter handle");
        assert!(n > 0);
        let mut inner = self.inner.lock().unwrap();
        let waiters = {
            let entry = &mut inner.slots[handle.slot() as usize];
            assert_eq!(
                entry.generation,
                handle.generation(),
                "counter slot {} signaled after it settled",
                handle.slot(),
            );
            assert!(
                entry.count >= n,
                "counter '{}' would drop below zero ({} - {})",
                entry.name,
                entry.count,
                n
            );
            entry.count -= n;
            if entry.count > 0 {
                return None;
            }
            let waiters = std::mem::take(&mut entry.waiters);
            entry.allocated = false;
            entry.name = "";
            entry.generation = bump_generation(entry.generation);
            waiters
        };
        inner.free.push(handle.slot());
        drop(inner);
        self.settled.notify_all();
        Some(waiters)
    }

    /// Blocks the calling OS thread until the counter settles. Used only by
    /// threads that are neither workers nor the main thread.
    pub fn block_until_settled(&self, handle: CounterHandle) {
        if handle.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        while inner.slots[handle.slot() as usize].generation == handle.generation() {
            inner = self.settled.wait(inner).unwrap();
        }
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() - inner.free.len()
    }

    /// Consistency check over the whole pool. Panics on violation.
    pub fn validate(&self) {
        let inner = self.inner.lock().unwrap();
        let mut seen = vec![false; inner.slots.len()];
        for &slot in &inner.free {
            assert!(!seen[slot as usize], "counter free list has a duplicate");
            seen[slot as usize] = true;
            let entry = &inner.slots[slot as usize];
            assert!(!entry.allocated, "free counter slot marked allocated");
            assert!(entry.waiters.is_empty(), "free counter slot has waiters");
        }
        let allocated = inner.slots.iter().filter(|s| s.allocated).count();
        assert_eq!(
            allocated + inner.free.len(),
            inner.slots.len(),
            "counter pool slot accounting broken"
        );
        for entry in inner.slots.iter().filter(|s| s.allocated) {
            assert!(entry.count > 0, "live counter with a zero count");
        }
    }
}
