//! The cooperative fiber scheduler.
//!
//! Worker threads (plus the main thread) each run a scheduling loop: pop
//! the next runnable descriptor, attach a fiber, switch into it, and act on
//! the reason the fiber switched back. All pool and queue mutation on
//! behalf of a suspending job is deferred until the switch has landed back
//! in the loop; no lock is ever held across a context switch.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::SchedulerConfig;
use crate::counter::{CounterHandle, CounterPool};
use crate::fiber::{Fiber, FiberInput, FiberPool, FiberPtr, RunPacket, Suspend};
use crate::job::{JobFn, JobPool, JobRef, JobSpec, JobState};
use crate::queue::OrderedQueue;
use crate::scheduler::SchedulerError;
use crate::trace::{SegmentEnd, TraceGuard};

/// Thread index reserved for the main thread; workers are numbered from 1.
pub(crate) const MAIN_THREAD_INDEX: usize = 0;

#[derive(Clone, Copy)]
struct ThreadSlot {
    index: usize,
    is_main: bool,
}

#[derive(Clone, Copy)]
struct CurrentJob {
    job_id: u64,
    sequence: u64,
}

thread_local! {
    /// Identity of this thread within the scheduler; set once by the loop
    /// (or by construction, for the main thread) and never from job bodies.
    static THREAD_SLOT: Cell<Option<ThreadSlot>> = const { Cell::new(None) };
    /// The job currently attached to this thread; set only around a resume.
    static CURRENT_JOB: Cell<Option<CurrentJob>> = const { Cell::new(None) };
}

pub(crate) struct FiberScheduler {
    jobs: JobPool,
    counters: CounterPool,
    fibers: FiberPool,
    worker_queue: OrderedQueue,
    main_queue: OrderedQueue,
    /// Scheduled-but-not-finished invocation count; `flush` drains it to 0.
    outstanding: AtomicU64,
    next_sequence: AtomicU64,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FiberScheduler {
    /// Builds the scheduler and spawns its workers. The calling thread
    /// becomes the main thread: it owns the main-thread-only queue and is
    /// registered in thread-local state here.
    pub fn new(config: &SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        let worker_count = config.effective_worker_count();
        let scheduler = Arc::new(FiberScheduler {
            jobs: JobPool::new(),
            counters: CounterPool::new(config.max_counters),
            fibers: FiberPool::new(config.stack_size, config.initial_fiber_count),
            worker_queue: OrderedQueue::new(),
            main_queue: OrderedQueue::new(),
            outstanding: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
            worker_count,
            workers: Mutex::new(Vec::new()),
        });

        THREAD_SLOT.set(Some(ThreadSlot {
            index: MAIN_THREAD_INDEX,
            is_main: true,
        }));
        crate::trace::register_thread(MAIN_THREAD_INDEX, "main".to_string());

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inner = Arc::clone(&scheduler);
            let index = i + 1;
            let spawned = thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .spawn(move || inner.worker_loop(index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    scheduler.worker_queue.close();
                    scheduler.main_queue.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::WorkerSpawn(error));
                }
            }
        }
        *scheduler.workers.lock().unwrap() = handles;
        tracing::debug!(workers = worker_count, "fiber scheduler started");
        Ok(scheduler)
    }

    fn worker_loop(&self, index: usize) {
        THREAD_SLOT.set(Some(ThreadSlot {
            index,
            is_main: false,
        }));
        crate::trace::register_thread(index, format!("worker-{index}"));
        tracing::trace!(worker = index, "worker loop entered");
        while let Some(job) = self.worker_queue.pop() {
            self.run_job_once(job, index);
        }
        crate::trace::collect_thread_events();
        tracing::trace!(worker = index, "worker loop exited");
    }

    /// One iteration of a per-thread scheduling loop: attach a fiber to the
    /// popped descriptor, switch into it, then perform the bookkeeping the
    /// fiber could not do for itself once the switch returns here.
    fn run_job_once(&self, job: JobRef, thread_index: usize) {
        struct Prep {
            fiber: Option<Box<Fiber>>,
            fresh: Option<(JobFn, u32)>,
            sink: Option<tracing::Dispatch>,
            name: &'static str,
            job_id: u64,
            sequence: u64,
        }

        let prep = self.jobs.with(job, |entry| {
            entry.last_thread = Some(thread_index);
            match entry.state {
                JobState::Scheduled => {
                    entry.state = JobState::Running;
                    Prep {
                        fiber: None,
                        fresh: Some((
                            entry.body.clone().expect("scheduled job without a body"),
                            entry.invocation,
                        )),
                        sink: entry.log_sink.clone(),
                        name: entry.name,
                        job_id: entry.job_id,
                        sequence: entry.sequence,
                    }
                }
                JobState::Yielded => {
                    entry.state = JobState::Running;
                    Prep {
                        fiber: Some(entry.fiber.take().expect("yielded job lost its fiber")),
                        fresh: None,
                        sink: entry.log_sink.clone(),
                        name: entry.name,
                        job_id: entry.job_id,
                        sequence: entry.sequence,
                    }
                }
                state => panic!("job {} popped from a queue in state {state:?}", entry.job_id),
            }
        });

        let mut fiber = match prep.fiber {
            Some(fiber) => fiber,
            None => self.fibers.acquire(),
        };
        let input = match prep.fresh {
            Some((body, invocation)) => FiberInput::Run(RunPacket {
                body,
                invocation,
                fiber: FiberPtr(fiber.as_mut() as *mut Fiber),
            }),
            None => FiberInput::Resume,
        };

        // Thread-affine side state for the segment: current-job cell, trace
        // span and the job's log sink. Re-established here on every resume,
        // on whichever thread this happens to be.
        CURRENT_JOB.set(Some(CurrentJob {
            job_id: prep.job_id,
            sequence: prep.sequence,
        }));
        let mut segment = TraceGuard::new(prep.name, prep.job_id, prep.sequence, thread_index);
        let outcome = match prep.sink.as_ref() {
            Some(sink) => tracing::dispatcher::with_default(sink, || fiber.resume(input)),
            None => fiber.resume(input),
        };
        segment.end_with(match outcome {
            Suspend::Finished => SegmentEnd::Completed,
            Suspend::Yield => SegmentEnd::Yielded,
            Suspend::Wait(_) => SegmentEnd::Parked,
        });
        drop(segment);
        CURRENT_JOB.set(None);

        match outcome {
            Suspend::Finished => {
                self.jobs.with(job, |entry| {
                    assert_eq!(entry.state, JobState::Running, "finished job was not running");
                    entry.state = JobState::Finished;
                });
                self.fibers.release(fiber);
                self.jobs.release(job);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
            Suspend::Yield => {
                let (sequence, to_main) = self.jobs.with(job, move |entry| {
                    assert_eq!(entry.state, JobState::Running, "yielded job was not running");
                    entry.state = JobState::Yielded;
                    entry.fiber = Some(fiber);
                    (entry.sequence, entry.main_thread)
                });
                self.push_to_queue(job, sequence, to_main);
            }
            Suspend::Wait(counter) => {
                // Park the fiber with the descriptor first: the instant the
                // job is on the wait list, a signal from another thread may
                // requeue and resume it.
                self.jobs.with(job, move |entry| {
                    assert_eq!(entry.state, JobState::Running, "waiting job was not running");
                    entry.state = JobState::Waiting;
                    entry.fiber = Some(fiber);
                    entry.wait_counter = counter;
                });
                if !self.counters.add_waiter(counter, job) {
                    // The counter settled between the caller's fast-path
                    // check and the switch; run the job again instead.
                    let (sequence, to_main) = self.jobs.with(job, |entry| {
                        assert_eq!(entry.state, JobState::Waiting);
                        entry.state = JobState::Yielded;
                        entry.wait_counter = CounterHandle::EMPTY;
                        (entry.sequence, entry.main_thread)
                    });
                    self.push_to_queue(job, sequence, to_main);
                }
            }
        }
    }

    fn push_to_queue(&self, job: JobRef, sequence: u64, main_thread: bool) {
        if main_thread {
            self.main_queue.push(job, 0);
        } else {
            debug_assert_ne!(sequence, 0);
            self.worker_queue.push(job, sequence);
        }
    }

    fn fresh_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget submission of every invocation of `spec`.
    pub fn schedule(&self, spec: JobSpec) {
        let sequence = if spec.child {
            CURRENT_JOB
                .get()
                .map(|current| current.sequence)
                .unwrap_or_else(|| self.fresh_sequence())
        } else {
            self.fresh_sequence()
        };
        self.outstanding
            .fetch_add(spec.invocations as u64, Ordering::SeqCst);
        for invocation in 0..spec.invocations {
            let job = self.jobs.alloc(&spec, sequence, invocation);
            self.push_to_queue(job, sequence, spec.main_thread);
        }
    }

    pub fn create_counter(&self, name: &'static str, count: u32) -> CounterHandle {
        self.counters.create(name, count)
    }

    pub fn check_counter(&self, counter: CounterHandle) -> bool {
        self.counters.is_settled(counter)
    }

    /// Signals `counter` by `n`. If that settles it, every parked waiter
    /// moves `Waiting → Yielded` and goes back onto its run queue.
    pub fn signal_counter(&self, counter: CounterHandle, n: u32) {
        let Some(waiters) = self.counters.signal(counter, n) else {
            return;
        };
        for job in waiters {
            let (sequence, to_main) = self.jobs.with(job, |entry| {
                assert_eq!(
                    entry.state,
                    JobState::Waiting,
                    "counter released a job that was not waiting"
                );
                entry.state = JobState::Yielded;
                entry.wait_counter = CounterHandle::EMPTY;
                (entry.sequence, entry.main_thread)
            });
            self.push_to_queue(job, sequence, to_main);
        }
    }

    /// Suspends the calling job until `counter` settles. Settled (or empty)
    /// counters return immediately. Resumption may land on a different
    /// thread than the one that suspended.
    pub fn wait_for_counter_and_release(&self, counter: CounterHandle) {
        if self.counters.is_settled(counter) {
            return;
        }
        if Fiber::in_fiber() {
            Fiber::suspend(Suspend::Wait(counter));
            // Resumed here; thread-affine state was re-installed by
            // whichever thread's loop picked the job back up.
        } else if self.is_main_thread() {
            // The main thread services its own queue while it waits.
            while !self.counters.is_settled(counter) {
                if !self.main_iteration() {
                    thread::yield_now();
                }
            }
        } else {
            self.counters.block_until_settled(counter);
        }
    }

    /// Cooperatively gives up this job's turn; it goes to the back of its
    /// queue bucket and will get a (possibly different) thread next time.
    pub fn yield_now(&self) {
        if Fiber::in_fiber() {
            Fiber::suspend(Suspend::Yield);
        } else {
            thread::yield_now();
        }
    }

    /// Drain barrier: returns once every scheduled invocation has finished.
    /// In-flight jobs always run to completion; nothing is cancelled.
    pub fn flush(&self) {
        if Fiber::in_fiber() {
            while self.outstanding.load(Ordering::SeqCst) > 0 {
                self.yield_now();
            }
        } else if self.is_main_thread() {
            while self.outstanding.load(Ordering::SeqCst) > 0 {
                if !self.main_iteration() {
                    thread::yield_now();
                }
            }
        } else {
            while self.outstanding.load(Ordering::SeqCst) > 0 {
                thread::yield_now();
            }
        }
    }

    /// One iteration of the main thread's loop. Drains the main-thread-only
    /// queue first; with zero workers this thread is also the only executor
    /// for the worker queue. Worker jobs never flow the other way.
    fn main_iteration(&self) -> bool {
        debug_assert!(self.is_main_thread());
        if let Some(job) = self.main_queue.try_pop() {
            self.run_job_once(job, MAIN_THREAD_INDEX);
            return true;
        }
        if self.worker_count == 0 {
            if let Some(job) = self.worker_queue.try_pop() {
                self.run_job_once(job, MAIN_THREAD_INDEX);
                return true;
            }
        }
        false
    }

    /// Runs every job currently parked on the main-thread-only queue.
    pub fn run_main_thread_jobs(&self) {
        assert!(
            self.is_main_thread(),
            "main-thread jobs can only be drained from the main thread"
        );
        while let Some(job) = self.main_queue.try_pop() {
            self.run_job_once(job, MAIN_THREAD_INDEX);
        }
    }

    pub fn is_main_thread(&self) -> bool {
        THREAD_SLOT.get().is_some_and(|slot| slot.is_main)
    }

    /// True on the main thread while it runs its own code rather than a
    /// fiber popped from a queue.
    pub fn is_main_fiber(&self) -> bool {
        self.is_main_thread() && !Fiber::in_fiber()
    }

    pub fn worker_thread_count(&self) -> usize {
        self.worker_count
    }

    pub fn current_job_id(&self) -> Option<u64> {
        CURRENT_JOB.get().map(|current| current.job_id)
    }

    /// Index of the scheduler thread currently executing, if any: 0 for the
    /// main thread, 1.. for workers.
    pub fn current_thread_index(&self) -> Option<usize> {
        THREAD_SLOT.get().map(|slot| slot.index)
    }

    pub fn outstanding_jobs(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Diagnostic consistency check over every pool. Panics on violation.
    pub fn debug_validate(&self) {
        self.jobs.validate();
        self.counters.validate();
        self.fibers.validate();
    }

    /// Drains outstanding work, closes the queues and joins the workers.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.flush();
        self.worker_queue.close();
        self.main_queue.close();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        tracing::debug!("fiber scheduler stopped");
        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}
