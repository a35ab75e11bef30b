//! Background job buckets for long-running, cancellable work.
//!
//! Background jobs are the wrong shape for the cooperative scheduler: they
//! run for seconds, block on IO and must be cancellable. Each named bucket
//! owns one dedicated OS thread that works through its queue in FIFO order,
//! so jobs in the same bucket serialize and jobs in different buckets run
//! concurrently. Cancellation is advisory: a job observes its token at its
//! own checkpoints.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Advisory cancellation flag shared between a background job and the
/// scheduler. The job decides where to check it and how to unwind.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type BackgroundFn = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

struct BackgroundJob {
    name: &'static str,
    body: BackgroundFn,
    token: CancelToken,
}

struct BucketShared {
    queue: Mutex<VecDeque<BackgroundJob>>,
    wake: Condvar,
    shutdown: AtomicBool,
    /// Token of the job the bucket thread is executing right now.
    running: Mutex<Option<CancelToken>>,
}

struct Bucket {
    shared: Arc<BucketShared>,
    thread: JoinHandle<()>,
}

/// Owner of all background buckets; buckets and their threads are created
/// lazily on first submission to a name.
pub struct BackgroundScheduler {
    buckets: Mutex<HashMap<&'static str, Bucket>>,
}

impl BackgroundScheduler {
    pub fn new() -> Self {
        BackgroundScheduler {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `body` on the named bucket and returns its cancellation
    /// token. Jobs on one bucket run strictly one at a time, in submission
    /// order.
    pub fn schedule<F>(&self, bucket: &'static str, name: &'static str, body: F) -> CancelToken
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let job = BackgroundJob {
            name,
            body: Box::new(body),
            token: token.clone(),
        };
        let mut buckets = self.buckets.lock().unwrap();
        let entry = buckets.entry(bucket).or_insert_with(|| {
            let shared = Arc::new(BucketShared {
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
                running: Mutex::new(None),
            });
            let loop_shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("weft-bg-{bucket}"))
                .spawn(move || bucket_loop(&loop_shared))
                .expect("failed to spawn background bucket thread");
            tracing::debug!(bucket, "background bucket created");
            Bucket { shared, thread }
        });
        entry.shared.queue.lock().unwrap().push_back(job);
        entry.shared.wake.notify_one();
        token
    }

    /// Cancels every queued and running background job and joins every
    /// bucket thread. Queued jobs still execute (their token is already
    /// cancelled, so a well-behaved body exits at its first checkpoint).
    pub fn flush(&self) {
        let buckets: Vec<Bucket> = {
            let mut map = self.buckets.lock().unwrap();
            map.drain().map(|(_, bucket)| bucket).collect()
        };
        for bucket in &buckets {
            for job in bucket.shared.queue.lock().unwrap().iter() {
                job.token.cancel();
            }
            if let Some(token) = bucket.shared.running.lock().unwrap().as_ref() {
                token.cancel();
            }
            bucket.shared.shutdown.store(true, Ordering::SeqCst);
            bucket.shared.wake.notify_all();
        }
        for bucket in buckets {
            if bucket.thread.join().is_err() {
                tracing::error!("background bucket thread panicked");
            }
        }
    }
}

impl Default for BackgroundScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_loop(shared: &BucketShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                // Drain before honoring shutdown so queued jobs still run.
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.wake.wait(queue).unwrap();
            }
        };
        *shared.running.lock().unwrap() = Some(job.token.clone());
        let result = catch_unwind(AssertUnwindSafe(|| (job.body)(&job.token)));
        *shared.running.lock().unwrap() = None;
        if result.is_err() {
            tracing::error!(job = job.name, "background job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn jobs_in_one_bucket_run_in_order() {
        let scheduler = BackgroundScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5u32 {
            let order = Arc::clone(&order);
            scheduler.schedule("io", "ordered", move |_| {
                order.lock().unwrap().push(i);
            });
        }
        scheduler.flush();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_is_observed_at_checkpoints() {
        let scheduler = BackgroundScheduler::new();
        let iterations = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&iterations);
        let token = scheduler.schedule("slow", "spin", move |token| {
            while !token.is_cancelled() {
                counted.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        scheduler.flush();
        assert!(token.is_cancelled());
        assert!(iterations.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn flush_cancels_queued_jobs_but_still_runs_them() {
        let scheduler = BackgroundScheduler::new();
        let saw_cancelled = Arc::new(AtomicBool::new(false));
        scheduler.schedule("flush", "block", |_| {
            thread::sleep(Duration::from_millis(30));
        });
        let observed = Arc::clone(&saw_cancelled);
        scheduler.schedule("flush", "queued", move |token| {
            observed.store(token.is_cancelled(), Ordering::SeqCst);
        });
        scheduler.flush();
        assert!(saw_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn buckets_run_concurrently() {
        let scheduler = BackgroundScheduler::new();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        for bucket in ["left", "right"] {
            let barrier = Arc::clone(&barrier);
            // Each job blocks until the other has started; this only
            // completes if the buckets have their own threads.
            scheduler.schedule(bucket, "meet", move |_| {
                barrier.wait();
            });
        }
        scheduler.flush();
    }
}
