//! Job submission records and the pending-job descriptor arena.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::counter::CounterHandle;
use crate::fiber::Fiber;

/// A job body. Invoked once per requested invocation with the invocation
/// index; shared between invocations, hence `Fn` rather than `FnOnce`.
pub type JobFn = Arc<dyn Fn(u32) + Send + Sync + 'static>;

/// Caller-facing submission record. Immutable once submitted; its fields are
/// copied into one internal descriptor per invocation.
#[derive(Clone)]
pub struct JobSpec {
    pub(crate) name: &'static str,
    pub(crate) func: JobFn,
    pub(crate) invocations: u32,
    pub(crate) child: bool,
    pub(crate) main_thread: bool,
    pub(crate) log_sink: Option<tracing::Dispatch>,
}

impl JobSpec {
    pub fn new<F>(name: &'static str, func: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        JobSpec {
            name,
            func: Arc::new(func),
            invocations: 1,
            child: false,
            main_thread: false,
            log_sink: None,
        }
    }

    /// Requests `n` invocations of the body, indexed `0..n`.
    pub fn invocations(mut self, n: u32) -> Self {
        assert!(n > 0, "a job needs at least one invocation");
        self.invocations = n;
        self
    }

    /// Inherit the submitting job's ordering chain instead of starting a
    /// new one, so this job sorts into its parent's queue bucket.
    pub fn child(mut self) -> Self {
        self.child = true;
        self
    }

    /// Restrict execution to the main thread's own queue.
    pub fn main_thread(mut self) -> Self {
        self.main_thread = true;
        self
    }

    /// Log sink installed around every resume segment of this job, on
    /// whichever thread happens to run it.
    pub fn log_sink(mut self, sink: tracing::Dispatch) -> Self {
        self.log_sink = Some(sink);
        self
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("invocations", &self.invocations)
            .field("child", &self.child)
            .field("main_thread", &self.main_thread)
            .finish()
    }
}

/// Lifecycle of one pending job invocation.
///
/// `Free → Scheduled → Running → {Yielded, Waiting} → Running → Finished → Free`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// In the pool, referenced by nothing else.
    Free,
    /// Submitted and sitting in a queue; no fiber attached yet.
    Scheduled,
    /// Attached to a fiber and executing on some thread.
    Running,
    /// Gave up its turn; requeued at the back of its bucket.
    Yielded,
    /// Parked on a counter's wait list. Keeps its fiber attached: resuming
    /// must continue exactly where the wait left off.
    Waiting,
    /// Body returned; fiber detached, descriptor about to be recycled.
    Finished,
}

/// Stable reference to a pending-job arena slot. The generation guards
/// against a recycled slot being mistaken for the job that used to live
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct JobRef {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

pub(crate) struct PendingJob {
    pub state: JobState,
    pub generation: u32,
    /// Unique, ever-increasing id.
    pub job_id: u64,
    /// Chain sequence id: queue-ordering bucket shared with the parent when
    /// submitted as a child.
    pub sequence: u64,
    /// Which of the requested invocations this descriptor is.
    pub invocation: u32,
    /// Index of the thread that last ran (or is running) this job.
    pub last_thread: Option<usize>,
    pub main_thread: bool,
    pub name: &'static str,
    pub body: Option<JobFn>,
    /// Attached while Running, Yielded or Waiting; only `Finished` releases
    /// the fiber back to its pool.
    pub fiber: Option<Box<Fiber>>,
    /// Counter this job is blocked on, while Waiting.
    pub wait_counter: CounterHandle,
    pub log_sink: Option<tracing::Dispatch>,
}

impl PendingJob {
    fn vacant() -> Self {
        PendingJob {
            state: JobState::Free,
            generation: 1,
            job_id: 0,
            sequence: 0,
            invocation: 0,
            last_thread: None,
            main_thread: false,
            name: "",
            body: None,
            fiber: None,
            wait_counter: CounterHandle::EMPTY,
            log_sink: None,
        }
    }
}

struct ArenaInner {
    slots: Vec<PendingJob>,
    free: Vec<u32>,
}

/// Recycling arena of pending-job descriptors.
///
/// Allocation pops the free list or grows the arena. Release demands the
/// terminal state with no outstanding linkage. Calls are infrequent
/// relative to job execution, so one mutex is plenty.
pub(crate) struct JobPool {
    inner: Mutex<ArenaInner>,
    next_job_id: AtomicU64,
}

impl JobPool {
    pub fn new() -> Self {
        JobPool {
            inner: Mutex::new(ArenaInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// Allocates a descriptor for one invocation of `spec` and tags it with
    /// a fresh unique id. The descriptor comes out in `Scheduled` state.
    pub fn alloc(&self, spec: &JobSpec, sequence: u64, invocation: u32) -> JobRef {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = inner.slots.len() as u32;
                inner.slots.push(PendingJob::vacant());
                slot
            }
        };
        let entry = &mut inner.slots[slot as usize];
        assert_eq!(entry.state, JobState::Free, "allocated job slot not free");
        debug_assert!(entry.fiber.is_none());
        debug_assert!(entry.wait_counter.is_empty());
        entry.state = JobState::Scheduled;
        entry.job_id = job_id;
        entry.sequence = sequence;
        entry.invocation = invocation;
        entry.last_thread = None;
        entry.main_thread = spec.main_thread;
        entry.name = spec.name;
        entry.body = Some(spec.func.clone());
        entry.log_sink = spec.log_sink.clone();
        JobRef {
            slot,
            generation: entry.generation,
        }
    }

    /// Runs `f` with exclusive access to the descriptor behind `job`.
    pub fn with<R>(&self, job: JobRef, f: impl FnOnce(&mut PendingJob) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.slots[job.slot as usize];
        assert_eq!(entry.generation, job.generation, "stale job reference");
        f(entry)
    }

    /// Returns a `Finished` descriptor to the free list. The descriptor
    /// must be unlinked from every queue, wait list and fiber by now.
    pub fn release(&self, job: JobRef) {
        let mut inner = self.inner.lock().unwrap();
        {
            let entry = &mut inner.slots[job.slot as usize];
            assert_eq!(entry.generation, job.generation, "stale job reference");
            assert_eq!(
                entry.state,
                JobState::Finished,
                "released a job in state {:?}",
                entry.state
            );
            assert!(entry.fiber.is_none(), "released a job with an attached fiber");
            assert!(
                entry.wait_counter.is_empty(),
                "released a job still linked to a counter"
            );
            entry.state = JobState::Free;
            entry.job_id = 0;
            entry.sequence = 0;
            entry.invocation = 0;
            entry.last_thread = None;
            entry.main_thread = false;
            entry.name = "";
            entry.body = None;
            entry.log_sink = None;
            entry.generation = entry.generation.wrapping_add(1);
            if entry.generation == 0 {
                entry.generation = 1;
            }
        }
        inner.free.push(job.slot);
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() - inner.free.len()
    }

    /// Consistency check over the whole arena. Panics on violation.
    pub fn validate(&self) {
        let inner = self.inner.lock().unwrap();
        let mut seen = vec![false; inner.slots.len()];
        for &slot in &inner.free {
            assert!(!seen[slot as usize], "job free list has a duplicate");
            seen[slot as usize] = true;
            let entry = &inner.slots[slot as usize];
            assert_eq!(entry.state, JobState::Free, "free-list job not Free");
            assert!(entry.fiber.is_none(), "free job slot holds a fiber");
            assert!(entry.body.is_none(), "free job slot holds a body");
        }
        let live = inner
            .slots
            .iter()
            .filter(|s| s.state != JobState::Free)
            .count();
        assert_eq!(
            live + inner.free.len(),
            inner.slots.len(),
            "job arena slot accounting broken"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn spec() -> JobSpec {
        JobSpec::new("test", |_| {})
    }

    #[test]
    fn alloc_assigns_unique_increasing_ids() {
        let pool = JobPool::new();
        let spec = spec();
        let a = pool.alloc(&spec, 1, 0);
        let b = pool.alloc(&spec, 1, 1);
        let (id_a, id_b) = (
            pool.with(a, |j| j.job_id),
            pool.with(b, |j| j.job_id),
        );
        assert!(id_b > id_a);
        assert_eq!(pool.with(b, |j| j.invocation), 1);
    }

    #[test]
    fn release_recycles_and_bumps_generation() {
        let pool = JobPool::new();
        let job = pool.alloc(&spec(), 7, 0);
        pool.with(job, |j| {
            j.state = JobState::Running;
            j.state = JobState::Finished;
        });
        pool.release(job);
        let reused = pool.alloc(&spec(), 8, 0);
        assert_eq!(reused.slot, job.slot);
        assert_ne!(reused.generation, job.generation);
        pool.validate();
    }

    #[test]
    #[should_panic(expected = "stale job reference")]
    fn stale_reference_is_fatal() {
        let pool = JobPool::new();
        let job = pool.alloc(&spec(), 1, 0);
        pool.with(job, |j| j.state = JobState::Finished);
        pool.release(job);
        let _ = pool.alloc(&spec(), 2, 0); // reuses the slot
        pool.with(job, |_| {});
    }

    #[test]
    #[should_panic(expected = "released a job in state")]
    fn release_of_non_finished_job_is_fatal() {
        let pool = JobPool::new();
        let job = pool.alloc(&spec(), 1, 0);
        pool.release(job);
    }

    #[test]
    fn random_interleaved_round_trip_leaks_nothing() {
        let pool = JobPool::new();
        let mut rng = rand::thread_rng();
        let mut live: Vec<JobRef> = Vec::new();
        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                live.push(pool.alloc(&spec(), rng.gen_range(1..100), 0));
            } else {
                let idx = rng.gen_range(0..live.len());
                let job = live.swap_remove(idx);
                pool.with(job, |j| j.state = JobState::Finished);
                pool.release(job);
            }
            pool.validate();
        }
        assert_eq!(pool.live_count(), live.len());
        for job in live {
            pool.with(job, |j| j.state = JobState::Finished);
            pool.release(job);
        }
        assert_eq!(pool.live_count(), 0);
        pool.validate();
    }
}
