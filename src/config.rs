//! Process-startup configuration, read once when the scheduler is built.

use serde::{Deserialize, Serialize};

/// Which implementation backs the public scheduler surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedulerMode {
    /// Cooperative fiber scheduler: many stackful jobs multiplexed over a
    /// small fixed pool of worker threads.
    #[default]
    Fiber,
    /// One pooled OS thread per job invocation. Structurally simpler and
    /// behaviorally equivalent, but every concurrently-waiting job pins a
    /// full OS thread.
    ThreadPerJob,
}

/// Scheduler construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    /// Worker thread count override. Clamped to `[1, cores - 1]` when set.
    pub worker_threads: Option<usize>,
    /// Force a zero-worker configuration: all jobs run on the main thread's
    /// own loop iterations.
    pub no_threads: bool,
    /// Stack size for each fiber in bytes.
    pub stack_size: usize,
    /// Number of fibers created up front. The pool grows on demand past
    /// this.
    pub initial_fiber_count: usize,
    /// Fixed capacity of the counter pool. Exhausting it is fatal.
    pub max_counters: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Fiber,
            worker_threads: None,
            no_threads: false,
            stack_size: 512 * 1024,
            initial_fiber_count: 16,
            max_counters: 16 * 1024,
        }
    }
}

impl SchedulerConfig {
    /// Number of worker threads the scheduler will actually create.
    ///
    /// Defaults to core count minus one so the main thread keeps a core for
    /// itself. An explicit override is clamped to that maximum and
    /// `no_threads` wins over everything.
    pub fn effective_worker_count(&self) -> usize {
        if self.no_threads {
            return 0;
        }
        let max = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .saturating_sub(1)
            .max(1);
        match self.worker_threads {
            Some(n) => n.clamp(1, max),
            None => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.mode, SchedulerMode::Fiber);
        assert_eq!(config.stack_size, 512 * 1024);
        assert_eq!(config.initial_fiber_count, 16);
        assert!(!config.no_threads);
        assert!(config.worker_threads.is_none());
    }

    #[test]
    fn no_threads_forces_zero_workers() {
        let config = SchedulerConfig {
            no_threads: true,
            worker_threads: Some(8),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.effective_worker_count(), 0);
    }

    #[test]
    fn override_is_clamped_to_at_least_one() {
        let config = SchedulerConfig {
            worker_threads: Some(0),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.effective_worker_count(), 1);
    }
}
