//! The process-wide default pool and CPU-count helpers (§6).
//!
//! A `static OnceLock` lazily built on first use, `get_or_init`'d rather
//! than built at program start so that a caller who wants a custom size
//! can call [`set_default_pool_threads`] before ever touching
//! [`global_pool`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::pool::{TaskPool, TaskPoolBuilder};

/// Sentinel meaning "no override has been set yet" for
/// [`DEFAULT_POOL_THREADS`]. Not a valid thread count on its own.
const UNSET: usize = usize::MAX;

static DEFAULT_POOL_THREADS: AtomicUsize = AtomicUsize::new(UNSET);

static GLOBAL_POOL: OnceLock<TaskPool> = OnceLock::new();

/// Number of logical CPUs, via the `num_cpus` crate (there is no portable
/// stdlib equivalent — `std::thread::available_parallelism` exists but
/// reports the *available* parallelism, which on a cgroup-limited container
/// differs from the CPU topology this crate's sizing heuristics want).
pub fn total_cpus() -> usize {
    num_cpus::get()
}

/// The worker count [`global_pool`] builds with, absent an explicit
/// [`set_default_pool_threads`] call: `total_cpus() - 1`, leaving the
/// submitting thread a core of its own.
pub fn default_pool_threads() -> usize {
    match DEFAULT_POOL_THREADS.load(Ordering::Relaxed) {
        UNSET => total_cpus().saturating_sub(1),
        n => n,
    }
}

/// Overrides the size [`global_pool`] is built with. Has no effect once
/// [`global_pool`] has already been called once in this process.
pub fn set_default_pool_threads(n: usize) {
    DEFAULT_POOL_THREADS.store(n, Ordering::Relaxed);
}

/// The lazily-constructed, process-wide pool used by every algorithm in
/// this crate that is not explicitly handed a [`TaskPool`] of its own
/// (§6's "ComputeTaskPool" analogue). Built as a daemon pool: dropping the
/// last reference to it never happens (it is `'static`), but marking it a
/// daemon documents that its workers are not meant to be waited on at
/// process exit.
pub fn global_pool() -> &'static TaskPool {
    GLOBAL_POOL.get_or_init(|| {
        TaskPoolBuilder::new()
            .threads(default_pool_threads())
            .daemon(true)
            .name("task-pool-global")
            .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cpus_is_at_least_one() {
        assert!(total_cpus() >= 1);
    }

    #[test]
    fn global_pool_runs_work() {
        let task = global_pool().submit(|| 6 * 7);
        assert_eq!(task.spin_force(), 42);
    }
}
