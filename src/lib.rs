//! Cooperative job scheduling over pooled fibers.
//!
//! Jobs are small closures multiplexed M:N over a fixed set of worker
//! threads using stackful fibers. A job can suspend mid-body, waiting on a
//! [`CounterHandle`] or just yielding its turn, without blocking the OS
//! thread underneath it. Completion counters tie jobs together: a counter
//! is created with a count, signaled down by producers and settles at
//! zero, releasing every waiter at once.
//!
//! ```no_run
//! use weft::{JobSpec, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(&SchedulerConfig::default())?;
//! let done = scheduler.create_counter("workers", 4);
//!
//! let worker = scheduler.clone();
//! scheduler.schedule(JobSpec::new("work", move |i| {
//!     // ... do the i-th slice ...
//!     worker.signal_counter(done, 1);
//! }).invocations(4));
//!
//! scheduler.wait_for_counter_and_release(done);
//! scheduler.shutdown()?;
//! # Ok::<(), weft::SchedulerError>(())
//! ```
//!
//! A thread-per-job fallback backend ([`SchedulerMode::ThreadPerJob`])
//! trades throughput for debuggability, and a background bucket scheduler
//! handles long-running cancellable work that does not fit the cooperative
//! model.

pub mod background;
pub mod config;
pub mod counter;
pub mod job;
pub mod scheduler;
pub mod trace;

mod fiber;
mod fiber_scheduler;
mod queue;
mod thread_scheduler;

pub use background::{BackgroundScheduler, CancelToken};
pub use config::{SchedulerConfig, SchedulerMode};
pub use counter::CounterHandle;
pub use job::{JobFn, JobSpec, JobState};
pub use scheduler::{Scheduler, SchedulerError};
