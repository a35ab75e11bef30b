//! Public scheduler surface.
//!
//! A [`Scheduler`] is a cheap clonable handle over one of two backends
//! selected at construction time: the cooperative fiber scheduler or the
//! thread-per-job fallback. Both expose identical job and counter
//! semantics; the background bucket scheduler rides along for work that is
//! too long-lived or blocking for either.

use std::sync::Arc;

use thiserror::Error;

use crate::background::BackgroundScheduler;
use crate::config::{SchedulerConfig, SchedulerMode};
use crate::counter::CounterHandle;
use crate::fiber_scheduler::FiberScheduler;
use crate::job::JobSpec;
use crate::thread_scheduler::ThreadScheduler;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn worker thread")]
    WorkerSpawn(#[from] std::io::Error),
    #[error("{0} worker thread(s) panicked during shutdown")]
    WorkerPanicked(usize),
}

enum Backend {
    Fiber(Arc<FiberScheduler>),
    Thread(Arc<ThreadScheduler>),
}

/// Handle to a running scheduler. Clones share the same backend; the thread
/// that calls [`Scheduler::new`] becomes the main thread.
#[derive(Clone)]
pub struct Scheduler {
    backend: Arc<Backend>,
    background: Arc<BackgroundScheduler>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let backend = match config.mode {
            SchedulerMode::Fiber => Backend::Fiber(FiberScheduler::new(config)?),
            SchedulerMode::ThreadPerJob => Backend::Thread(ThreadScheduler::new(config)?),
        };
        Ok(Scheduler {
            backend: Arc::new(backend),
            background: Arc::new(BackgroundScheduler::new()),
        })
    }

    /// Fire-and-forget submission of every invocation described by `spec`.
    pub fn schedule(&self, spec: JobSpec) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.schedule(spec),
            Backend::Thread(scheduler) => scheduler.schedule(spec),
        }
    }

    /// Convenience for the common single-invocation case.
    pub fn spawn<F>(&self, name: &'static str, func: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.schedule(JobSpec::new(name, func));
    }

    /// Creates a counter that settles after `count` signals. A zero count
    /// yields the always-settled empty handle.
    pub fn create_counter(&self, name: &'static str, count: u32) -> CounterHandle {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.create_counter(name, count),
            Backend::Thread(scheduler) => scheduler.create_counter(name, count),
        }
    }

    /// Non-blocking: has this counter settled (or was it always empty)?
    pub fn check_counter(&self, counter: CounterHandle) -> bool {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.check_counter(counter),
            Backend::Thread(scheduler) => scheduler.check_counter(counter),
        }
    }

    /// Signals `counter` by `n`, releasing all waiters if it settles.
    /// Signaling a settled counter is a protocol violation and panics.
    pub fn signal_counter(&self, counter: CounterHandle, n: u32) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.signal_counter(counter, n),
            Backend::Thread(scheduler) => scheduler.signal_counter(counter, n),
        }
    }

    /// Suspends (a job) or blocks (a plain thread) until `counter` settles.
    /// Once it returns the handle is dead; every copy of it reports settled
    /// forever.
    pub fn wait_for_counter_and_release(&self, counter: CounterHandle) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.wait_for_counter_and_release(counter),
            Backend::Thread(scheduler) => scheduler.wait_for_counter_and_release(counter),
        }
    }

    /// Waits until every one of `counters` has settled. Already-settled
    /// handles are skipped; with several live ones the wait is merged
    /// through an internal counter so the caller suspends only once.
    pub fn wait_for_multiple_and_release(&self, counters: &[CounterHandle]) {
        let live: Vec<CounterHandle> = counters
            .iter()
            .copied()
            .filter(|&counter| !self.check_counter(counter))
            .collect();
        match live.len() {
            0 => {}
            1 => self.wait_for_counter_and_release(live[0]),
            n => {
                let merged = self.create_counter("merged-wait", n as u32);
                for counter in live {
                    let scheduler = self.clone();
                    self.schedule(
                        JobSpec::new("wait-merged", move |_| {
                            scheduler.wait_for_counter_and_release(counter);
                            scheduler.signal_counter(merged, 1);
                        })
                        .child(),
                    );
                }
                self.wait_for_counter_and_release(merged);
            }
        }
    }

    /// Cooperatively gives up the current job's turn, or yields the OS
    /// thread when called outside a job.
    pub fn yield_now(&self) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.yield_now(),
            Backend::Thread(scheduler) => scheduler.yield_now(),
        }
    }

    /// Waits until every scheduled job invocation has finished. In-flight
    /// jobs run to completion; nothing is cancelled. Calling this from
    /// inside a job deadlocks by construction (the caller is itself an
    /// outstanding job), so only call it from outside.
    pub fn flush(&self) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.flush(),
            Backend::Thread(scheduler) => scheduler.flush(),
        }
    }

    /// Runs every job currently parked on the main-thread-only queue. Must
    /// be called from the main thread; typically once per frame.
    pub fn run_main_thread_jobs(&self) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.run_main_thread_jobs(),
            Backend::Thread(scheduler) => scheduler.run_main_thread_jobs(),
        }
    }

    pub fn is_main_thread(&self) -> bool {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.is_main_thread(),
            Backend::Thread(scheduler) => scheduler.is_main_thread(),
        }
    }

    /// True on the main thread while it runs its own code rather than a
    /// scheduled job.
    pub fn is_main_fiber(&self) -> bool {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.is_main_fiber(),
            Backend::Thread(scheduler) => {
                scheduler.is_main_thread() && scheduler.current_job_id().is_none()
            }
        }
    }

    pub fn worker_thread_count(&self) -> usize {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.worker_thread_count(),
            Backend::Thread(scheduler) => scheduler.worker_thread_count(),
        }
    }

    /// Unique id of the job executing on the current thread, if any.
    pub fn current_job_id(&self) -> Option<u64> {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.current_job_id(),
            Backend::Thread(scheduler) => scheduler.current_job_id(),
        }
    }

    /// Scheduler thread index of the current thread: 0 for the main thread,
    /// 1.. for workers, `None` on foreign threads.
    pub fn current_thread_index(&self) -> Option<usize> {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.current_thread_index(),
            Backend::Thread(scheduler) => scheduler.current_thread_index(),
        }
    }

    /// Number of scheduled-but-not-finished job invocations.
    pub fn outstanding_jobs(&self) -> u64 {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.outstanding_jobs(),
            Backend::Thread(scheduler) => scheduler.outstanding_jobs(),
        }
    }

    /// Consistency check over every internal pool. Panics on violation;
    /// meant for tests and debug builds at quiescent points.
    pub fn debug_validate(&self) {
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.debug_validate(),
            Backend::Thread(scheduler) => scheduler.debug_validate(),
        }
    }

    /// The background bucket scheduler attached to this instance.
    pub fn background(&self) -> &BackgroundScheduler {
        &self.background
    }

    /// Queues a long-running, cancellable job on a named background bucket.
    pub fn schedule_background<F>(
        &self,
        bucket: &'static str,
        name: &'static str,
        body: F,
    ) -> crate::background::CancelToken
    where
        F: FnOnce(&crate::background::CancelToken) + Send + 'static,
    {
        self.background.schedule(bucket, name, body)
    }

    /// Cancels and joins every background bucket. See
    /// [`BackgroundScheduler::flush`].
    pub fn flush_background(&self) {
        self.background.flush();
    }

    /// Drains all foreground work, flushes background buckets and joins
    /// every thread the scheduler owns. Call from the main thread.
    pub fn shutdown(self) -> Result<(), SchedulerError> {
        self.background.flush();
        match &*self.backend {
            Backend::Fiber(scheduler) => scheduler.shutdown(),
            Backend::Thread(scheduler) => scheduler.shutdown(),
        }
    }
}
