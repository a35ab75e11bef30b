//! Stackful execution contexts (fibers) and the fiber pool.
//!
//! A fiber is a dedicated stack plus saved register state, built on
//! `corosensei`. Each fiber runs a trampoline: it executes one job body,
//! yields [`Suspend::Finished`], then parks until the next body arrives, so
//! the expensive stack allocation is reused across many jobs. A suspended
//! fiber is an ordinary movable value and may be resumed by any thread.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::counter::CounterHandle;
use crate::job::JobFn;

/// Reason a fiber handed control back to the scheduling loop.
///
/// Travels across the context switch in the coroutine's yield slot.
/// Code on the fiber must not touch pools or queues for a job that is
/// still mid-switch, so that work is deferred to whichever loop receives
/// this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// Cooperative yield; requeue the job at the back of its bucket.
    Yield,
    /// Park the job on this counter's wait list (or requeue immediately if
    /// the counter settled in the meantime).
    Wait(CounterHandle),
    /// The body returned; finalize the job and recycle this fiber.
    Finished,
}

/// What a resume carries into the fiber: a fresh body on first entry, or
/// nothing when continuing a suspended one.
pub(crate) enum FiberInput {
    Run(RunPacket),
    Resume,
}

pub(crate) struct RunPacket {
    pub body: JobFn,
    pub invocation: u32,
    pub fiber: FiberPtr,
}

/// Raw fiber pointer that rides through the coroutine channel. The pointee
/// is a `Box<Fiber>` held by the resuming worker (or parked in a job slot),
/// so it is stable and uniquely borrowed for the duration of the resume.
#[derive(Clone, Copy)]
pub(crate) struct FiberPtr(pub *mut Fiber);

unsafe impl Send for FiberPtr {}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberPtr>> = const { Cell::new(None) };
}

pub(crate) struct Fiber {
    // Declared before `stack` so it drops first; the coroutine borrows the
    // stack for its whole life.
    coroutine: Option<Coroutine<FiberInput, Suspend, (), &'static mut DefaultStack>>,
    #[allow(dead_code)]
    stack: Box<DefaultStack>,
    /// Set by the trampoline when a body starts; points into the live
    /// coroutine frame and is only dereferenced while the fiber runs.
    yielder: Cell<*const Yielder<FiberInput, Suspend>>,
}

unsafe impl Send for Fiber {}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

impl Fiber {
    /// Creates a fiber with its own stack of `stack_size` bytes.
    pub fn new(stack_size: usize) -> Box<Fiber> {
        let mut stack = Box::new(
            DefaultStack::new(stack_size)
                .unwrap_or_else(|_| DefaultStack::new(1024 * 1024).unwrap()),
        );

        // The coroutine type wants a 'static stack borrow. The stack lives
        // in this same Fiber and outlives the coroutine field, which drops
        // first.
        let stack_ref = unsafe {
            std::mem::transmute::<&mut DefaultStack, &'static mut DefaultStack>(stack.as_mut())
        };

        let coroutine = Coroutine::with_stack(stack_ref, move |yielder, mut input: FiberInput| {
            use std::panic::{catch_unwind, AssertUnwindSafe};
            loop {
                if let FiberInput::Run(packet) = input {
                    unsafe {
                        (*packet.fiber.0).yielder.set(yielder as *const _);
                    }
                    // A panic must not unwind across the context-switch
                    // boundary; contain it here and finalize the job.
                    let result = catch_unwind(AssertUnwindSafe(|| (packet.body)(packet.invocation)));
                    if let Err(payload) = result {
                        tracing::error!(panic = panic_message(payload.as_ref()), "job body panicked");
                    }
                }
                input = yielder.suspend(Suspend::Finished);
            }
        });

        Box::new(Fiber {
            coroutine: Some(coroutine),
            stack,
            yielder: Cell::new(std::ptr::null()),
        })
    }

    /// Switches the current thread into this fiber. Returns the suspension
    /// reason once the fiber switches back.
    pub fn resume(&mut self, input: FiberInput) -> Suspend {
        let self_ptr = FiberPtr(self as *mut Fiber);
        let coroutine = self.coroutine.as_mut().expect("fiber already torn down");
        CURRENT_FIBER.set(Some(self_ptr));
        let result = coroutine.resume(input);
        CURRENT_FIBER.set(None);
        match result {
            CoroutineResult::Yield(reason) => reason,
            // The trampoline loops forever; a plain return only happens if
            // the coroutine was force-unwound during teardown.
            CoroutineResult::Return(()) => Suspend::Finished,
        }
    }

    /// Suspends the fiber running on the current thread with `reason`.
    /// Returns when the scheduler resumes the job, possibly on a different
    /// thread.
    pub fn suspend(reason: Suspend) {
        let handle = CURRENT_FIBER
            .get()
            .expect("suspend called outside a fiber");
        unsafe {
            let fiber = &*handle.0;
            let yielder = fiber.yielder.get();
            assert!(!yielder.is_null(), "fiber suspended before its body started");
            (*yielder).suspend(reason);
        }
    }

    /// True when the current thread is executing inside a fiber.
    pub fn in_fiber() -> bool {
        CURRENT_FIBER.get().is_some()
    }
}

/// Recycling pool of fibers shared by all scheduler threads. When the free
/// list runs dry, `acquire` refills it by creating a brand-new fiber with
/// the configured stack size.
pub(crate) struct FiberPool {
    free: Mutex<Vec<Box<Fiber>>>,
    stack_size: usize,
    active: AtomicUsize,
    created: AtomicUsize,
}

impl FiberPool {
    pub fn new(stack_size: usize, initial: usize) -> Self {
        let mut free = Vec::with_capacity(initial);
        for _ in 0..initial {
            free.push(Fiber::new(stack_size));
        }
        FiberPool {
            free: Mutex::new(free),
            stack_size,
            active: AtomicUsize::new(0),
            created: AtomicUsize::new(initial),
        }
    }

    pub fn acquire(&self) -> Box<Fiber> {
        let recycled = self.free.lock().unwrap().pop();
        let fiber = recycled.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Fiber::new(self.stack_size)
        });
        self.active.fetch_add(1, Ordering::Relaxed);
        fiber
    }

    /// Returns a fiber whose job has fully detached.
    pub fn release(&self, fiber: Box<Fiber>) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().unwrap().push(fiber);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Consistency check: every fiber ever created is either free or
    /// active. Panics on violation.
    pub fn validate(&self) {
        let free = self.free.lock().unwrap().len();
        let active = self.active.load(Ordering::SeqCst);
        let created = self.created.load(Ordering::SeqCst);
        assert_eq!(
            free + active,
            created,
            "fiber pool leak: {free} free + {active} active != {created} created"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn runs_a_body_to_completion() {
        let mut fiber = Fiber::new(64 * 1024);
        let hits = Arc::new(AtomicU32::new(0));
        let inner = hits.clone();
        let body: JobFn = Arc::new(move |invocation| {
            inner.fetch_add(invocation + 1, Ordering::SeqCst);
        });
        let ptr = FiberPtr(fiber.as_mut() as *mut Fiber);
        let outcome = fiber.resume(FiberInput::Run(RunPacket {
            body,
            invocation: 2,
            fiber: ptr,
        }));
        assert_eq!(outcome, Suspend::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn suspends_and_resumes_mid_body() {
        let mut fiber = Fiber::new(64 * 1024);
        let steps = Arc::new(AtomicU32::new(0));
        let inner = steps.clone();
        let body: JobFn = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Fiber::suspend(Suspend::Yield);
            inner.fetch_add(1, Ordering::SeqCst);
        });
        let ptr = FiberPtr(fiber.as_mut() as *mut Fiber);
        let outcome = fiber.resume(FiberInput::Run(RunPacket {
            body,
            invocation: 0,
            fiber: ptr,
        }));
        assert_eq!(outcome, Suspend::Yield);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        let outcome = fiber.resume(FiberInput::Resume);
        assert_eq!(outcome, Suspend::Finished);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn trampoline_reuses_the_same_fiber_for_many_bodies() {
        let mut fiber = Fiber::new(64 * 1024);
        let total = Arc::new(AtomicU32::new(0));
        for round in 0..10 {
            let inner = total.clone();
            let body: JobFn = Arc::new(move |_| {
                inner.fetch_add(1, Ordering::SeqCst);
            });
            let ptr = FiberPtr(fiber.as_mut() as *mut Fiber);
            let outcome = fiber.resume(FiberInput::Run(RunPacket {
                body,
                invocation: round,
                fiber: ptr,
            }));
            assert_eq!(outcome, Suspend::Finished);
        }
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn pool_round_trip_is_leak_free() {
        let pool = FiberPool::new(64 * 1024, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // refill path
        assert_eq!(pool.active_count(), 3);
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.active_count(), 0);
        pool.validate();
    }
}
