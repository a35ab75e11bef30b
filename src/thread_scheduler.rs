//! Thread-per-job fallback scheduler.
//!
//! Same public behavior as the fiber scheduler, without stack switching:
//! every invocation runs on a pooled OS thread, and a waiting job simply
//! blocks that thread on an event. Dispatch binds each invocation to a
//! thread up front: under the pool lock it takes a free thread or creates
//! a new one, then hands the invocation to that thread directly. A thread
//! returns to the free list only after its invocation finishes, so a job
//! that blocks can never starve the jobs it is waiting on. Simpler to
//! debug than the fiber backend, far heavier under load.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::config::SchedulerConfig;
use crate::counter::CounterHandle;
use crate::job::{JobFn, JobSpec};
use crate::scheduler::SchedulerError;
use crate::trace::TraceGuard;

thread_local! {
    static IS_MAIN: Cell<bool> = const { Cell::new(false) };
    static THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_JOB_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// One dispatched invocation of a job.
struct Invocation {
    name: &'static str,
    body: JobFn,
    invocation: u32,
    job_id: u64,
    log_sink: Option<tracing::Dispatch>,
}

enum Message {
    Run(Invocation),
    Stop,
}

pub(crate) struct ThreadScheduler {
    /// Handoff channels of the threads with no invocation bound to them.
    /// Dispatch pops one (or spawns a fresh thread) and sends directly to
    /// it; the thread re-registers itself here when its invocation ends.
    free: Mutex<Vec<Sender<Message>>>,
    spawned: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Invocations dispatched but not yet finished.
    pending: Mutex<u64>,
    drained: Condvar,
    main_queue: Mutex<VecDeque<Invocation>>,
    counters: EventCounterPool,
    next_job_id: AtomicU64,
}

impl ThreadScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        let scheduler = Arc::new(ThreadScheduler {
            free: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            pending: Mutex::new(0),
            drained: Condvar::new(),
            main_queue: Mutex::new(VecDeque::new()),
            counters: EventCounterPool::new(config.max_counters),
            next_job_id: AtomicU64::new(1),
        });
        IS_MAIN.set(true);
        THREAD_INDEX.set(Some(0));
        crate::trace::register_thread(0, "main".to_string());
        tracing::debug!("thread scheduler started");
        Ok(scheduler)
    }

    /// Creates a pool thread and returns its handoff channel. Thread
    /// creation failure is fatal: the dispatched invocation has nowhere
    /// else to run.
    fn spawn_worker(self: &Arc<Self>) -> Sender<Message> {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = unbounded();
        let ticket = sender.clone();
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("weft-pool-{index}"))
            .spawn(move || inner.worker_loop(receiver, ticket, index))
            .expect("failed to spawn pool thread");
        self.threads.lock().unwrap().push(handle);
        sender
    }

    fn worker_loop(&self, receiver: Receiver<Message>, ticket: Sender<Message>, index: usize) {
        THREAD_INDEX.set(Some(index));
        crate::trace::register_thread(index, format!("pool-{index}"));
        while let Ok(Message::Run(invocation)) = receiver.recv() {
            self.run_invocation(invocation, index);
            // Back on the free list before the pending count drops, so a
            // flush/shutdown that sees zero pending also sees this thread.
            self.free.lock().unwrap().push(ticket.clone());
            self.finish_one();
        }
        crate::trace::collect_thread_events();
    }

    fn run_invocation(&self, invocation: Invocation, thread_index: usize) {
        CURRENT_JOB_ID.set(Some(invocation.job_id));
        let segment = TraceGuard::new(invocation.name, invocation.job_id, 0, thread_index);
        let body = AssertUnwindSafe(|| (invocation.body)(invocation.invocation));
        let result = match invocation.log_sink.as_ref() {
            Some(sink) => tracing::dispatcher::with_default(sink, || catch_unwind(body)),
            None => catch_unwind(body),
        };
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic payload");
            tracing::error!(job = invocation.name, panic = message, "job body panicked");
        }
        drop(segment);
        CURRENT_JOB_ID.set(None);
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    pub fn schedule(self: &Arc<Self>, spec: JobSpec) {
        *self.pending.lock().unwrap() += spec.invocations as u64;
        for invocation in 0..spec.invocations {
            let packet = Invocation {
                name: spec.name,
                body: spec.func.clone(),
                invocation,
                job_id: self.next_job_id.fetch_add(1, Ordering::Relaxed),
                log_sink: spec.log_sink.clone(),
            };
            if spec.main_thread {
                self.main_queue.lock().unwrap().push_back(packet);
                continue;
            }
            // Bind the invocation to a thread before letting go of it.
            let slot = {
                let mut free = self.free.lock().unwrap();
                match free.pop() {
                    Some(slot) => slot,
                    None => self.spawn_worker(),
                }
            };
            slot.send(Message::Run(packet))
                .expect("pool thread hung up its handoff channel");
        }
    }

    fn run_one_main_job(&self) -> bool {
        debug_assert!(self.is_main_thread());
        let Some(invocation) = self.main_queue.lock().unwrap().pop_front() else {
            return false;
        };
        self.run_invocation(invocation, 0);
        self.finish_one();
        true
    }

    pub fn run_main_thread_jobs(&self) {
        assert!(
            self.is_main_thread(),
            "main-thread jobs can only be drained from the main thread"
        );
        while self.run_one_main_job() {}
    }

    pub fn create_counter(&self, name: &'static str, count: u32) -> CounterHandle {
        self.counters.create(name, count)
    }

    pub fn check_counter(&self, counter: CounterHandle) -> bool {
        self.counters.is_settled(counter)
    }

    pub fn signal_counter(&self, counter: CounterHandle, n: u32) {
        self.counters.signal(counter, n);
    }

    /// Blocks the calling thread until the counter settles. The main thread
    /// keeps servicing its own queue while it waits, since the signaler may
    /// be parked there.
    pub fn wait_for_counter_and_release(&self, counter: CounterHandle) {
        if self.is_main_thread() {
            while !self.counters.is_settled(counter) {
                if !self.run_one_main_job() {
                    self.counters
                        .wait_with_timeout(counter, Duration::from_millis(1));
                }
            }
        } else {
            self.counters.block_until_settled(counter);
        }
    }

    pub fn yield_now(&self) {
        thread::yield_now();
    }

    /// Blocks until every dispatched invocation has finished. On the main
    /// thread this also drains the main-thread queue, which pool threads
    /// cannot touch.
    pub fn flush(&self) {
        let on_main = self.is_main_thread();
        let mut pending = self.pending.lock().unwrap();
        while *pending > 0 {
            if on_main {
                drop(pending);
                while self.run_one_main_job() {}
                pending = self.pending.lock().unwrap();
                if *pending == 0 {
                    break;
                }
                let (guard, _) = self
                    .drained
                    .wait_timeout(pending, Duration::from_millis(1))
                    .unwrap();
                pending = guard;
            } else {
                pending = self.drained.wait(pending).unwrap();
            }
        }
    }

    pub fn is_main_thread(&self) -> bool {
        IS_MAIN.get()
    }

    pub fn worker_thread_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn current_job_id(&self) -> Option<u64> {
        CURRENT_JOB_ID.get()
    }

    pub fn current_thread_index(&self) -> Option<usize> {
        THREAD_INDEX.get()
    }

    pub fn outstanding_jobs(&self) -> u64 {
        *self.pending.lock().unwrap()
    }

    pub fn debug_validate(&self) {
        self.counters.validate();
        let free = self.free.lock().unwrap().len();
        let spawned = self.spawned.load(Ordering::SeqCst);
        assert!(
            free <= spawned,
            "thread pool free list ({free}) exceeds spawned threads ({spawned})"
        );
    }

    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.flush();
        // After the drain every thread is back on the free list.
        for slot in self.free.lock().unwrap().drain(..) {
            let _ = slot.send(Message::Stop);
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        tracing::debug!("thread scheduler stopped");
        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}

struct Event {
    done: Mutex<bool>,
    settled: Condvar,
}

struct EventSlot {
    generation: u32,
    count: u32,
    allocated: bool,
    /// Shared with every thread currently (or about to be) blocked on this
    /// counter; the `Arc` keeps it alive past slot recycling.
    event: Option<Arc<Event>>,
    name: &'static str,
}

/// Counter pool for the thread backend. Identical handle semantics to the
/// fiber backend's pool, but waiters are blocked OS threads on a per-slot
/// event instead of parked jobs on a wait list.
struct EventCounterPool {
    inner: Mutex<Vec<EventSlot>>,
    free: Mutex<Vec<u32>>,
}

fn bump_generation(generation: u32) -> u32 {
    let next = generation.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

impl EventCounterPool {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(EventSlot {
                generation: 1,
                count: 0,
                allocated: false,
                event: None,
                name: "",
            });
        }
        EventCounterPool {
            inner: Mutex::new(slots),
            free: Mutex::new((0..capacity as u32).rev().collect()),
        }
    }

    fn create(&self, name: &'static str, count: u32) -> CounterHandle {
        if count == 0 {
            return CounterHandle::EMPTY;
        }
        let slot = self.free.lock().unwrap().pop().expect("counter pool exhausted");
        let mut slots = self.inner.lock().unwrap();
        let entry = &mut slots[slot as usize];
        assert!(!entry.allocated);
        entry.allocated = true;
        entry.count = count;
        entry.name = name;
        entry.event = Some(Arc::new(Event {
            done: Mutex::new(false),
            settled: Condvar::new(),
        }));
        CounterHandle::new(slot, entry.generation)
    }

    fn is_settled(&self, handle: CounterHandle) -> bool {
        if handle.is_empty() {
            return true;
        }
        let slots = self.inner.lock().unwrap();
        slots[handle.slot() as usize].generation != handle.generation()
    }

    fn signal(&self, handle: CounterHandle, n: u32) {
        assert!(!handle.is_empty(), "signaled an empty counter handle");
        assert!(n > 0);
        let event = {
            let mut slots = self.inner.lock().unwrap();
            let entry = &mut slots[handle.slot() as usize];
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
                return;
            }
            entry.allocated = false;
            entry.name = "";
            entry.generation = bump_generation(entry.generation);
            entry.event.take().expect("live counter without an event")
        };
        self.free.lock().unwrap().push(handle.slot());
        // The slot is already recycled; waiters hold their own Arc.
        *event.done.lock().unwrap() = true;
        event.settled.notify_all();
    }

    /// Grabs the event while the handle is still live, then blocks on it.
    fn grab_event(&self, handle: CounterHandle) -> Option<Arc<Event>> {
        if handle.is_empty() {
            return None;
        }
        let slots = self.inner.lock().unwrap();
        let entry = &slots[handle.slot() as usize];
        if entry.generation != handle.generation() {
            return None;
        }
        Some(Arc::clone(entry.event.as_ref().expect("live counter without an event")))
    }

    fn block_until_settled(&self, handle: CounterHandle) {
        let Some(event) = self.grab_event(handle) else {
            return;
        };
        let mut done = event.done.lock().unwrap();
        while !*done {
            done = event.settled.wait(done).unwrap();
        }
    }

    fn wait_with_timeout(&self, handle: CounterHandle, timeout: Duration) {
        let Some(event) = self.grab_event(handle) else {
            return;
        };
        let done = event.done.lock().unwrap();
        if !*done {
            let _ = event.settled.wait_timeout(done, timeout).unwrap();
        }
    }

    fn validate(&self) {
        let slots = self.inner.lock().unwrap();
        let free = self.free.lock().unwrap();
        let mut seen = vec![false; slots.len()];
        for &slot in free.iter() {
            assert!(!seen[slot as usize], "counter free list has a duplicate");
            seen[slot as usize] = true;
            let entry = &slots[slot as usize];
            assert!(!entry.allocated, "free counter slot marked allocated");
            assert!(entry.event.is_none(), "free counter slot holds an event");
        }
        let allocated = slots.iter().filter(|s| s.allocated).count();
        assert_eq!(
            allocated + free.len(),
            slots.len(),
            "counter pool slot accounting broken"
        );
    }
}
