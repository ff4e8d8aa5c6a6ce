//! Worker-local storage (§7): one slot per worker thread, plus one shared
//! "outside" slot for every thread that isn't a worker of the owning pool.
//!
//! Under `unsafe_code = "deny"`, the "only the owner touches it" discipline
//! that makes worker-local storage sound is expressed with an uncontended
//! `Mutex<T>` per slot instead of raw aliasing: since no two threads are
//! ever meant to race on the same slot, the lock is never actually
//! contended in the common case, and draining reuses the same lock rather
//! than a bespoke fence.

use std::sync::Mutex;

use crate::pool::{worker_slot, TaskPool};

/// A type padded out to its own cache line, so that two adjacent slots in
/// [`WorkerLocalStorage`] never false-share.
///
/// 128 bytes covers the common cases (64 on most x86_64/ARM, up to 128 on
/// Apple silicon's M-series); over-aligning smaller lines costs a little
/// memory, never correctness. `crossbeam-utils::CachePadded` picks the
/// per-target-exact value with a `cfg_if` table — this crate hand-rolls the
/// simpler superset instead of adding the dependency for one struct (see
/// DESIGN.md).
#[repr(align(128))]
struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// `N + 1` cache-line-padded slots: one per worker of a specific
/// [`TaskPool`], plus slot `0` shared by every non-worker thread.
///
/// Construct one per pool per logical "thing workers accumulate into"
/// (e.g. a per-worker scratch buffer for a `reduce`, or a histogram each
/// worker bins into independently before a final serial merge).
pub struct WorkerLocalStorage<T> {
    pool_identity: usize,
    slots: Vec<CachePadded<Mutex<T>>>,
}

impl<T: Send + 'static> WorkerLocalStorage<T> {
    /// Builds one slot per worker of `pool`, plus the shared outside slot,
    /// each initialized by calling `make`.
    pub fn new(pool: &TaskPool, mut make: impl FnMut() -> T) -> Self {
        let slot_count = pool.size() + 1;
        let slots = (0..slot_count).map(|_| CachePadded::new(Mutex::new(make()))).collect();
        Self { pool_identity: pool.handle().identity(), slots }
    }

    /// Total slot count, i.e. `pool.size() + 1`.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Runs `f` against the calling thread's slot: its own worker slot if
    /// it is currently a worker of the pool this storage was built from,
    /// or the shared slot `0` otherwise.
    ///
    /// Calling this from two distinct non-worker ("outside") threads at
    /// once serializes them on slot `0`'s lock rather than racing — safe,
    /// but defeats the point of worker-local storage; that usage pattern
    /// is a caller bug even though it cannot corrupt memory here.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let index = worker_slot(self.pool_identity);
        let mut guard = self.slots[index].lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Drains every slot into a `Vec<T>` in slot order (slot `0` first),
    /// replacing each with a fresh value from `make`.
    ///
    /// Call only once every task that might still write through
    /// [`WorkerLocalStorage::with`] has already been forced — a slot read
    /// here while a worker is still concurrently writing through it
    /// observes a valid but unspecified interleaving, same as locking any
    /// other `Mutex` out from under an unfinished writer.
    pub fn to_range(&self, mut make: impl FnMut() -> T) -> Vec<T> {
        self.slots
            .iter()
            .map(|slot| {
                let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *guard, make())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreach::parallel_indexed;

    #[test]
    fn outside_thread_uses_slot_zero() {
        let pool = TaskPool::with_threads(0);
        let storage: WorkerLocalStorage<u32> = WorkerLocalStorage::new(&pool, || 0);
        storage.with(|slot| *slot += 1);
        let drained = storage.to_range(|| 0);
        assert_eq!(drained[0], 1);
    }

    #[test]
    fn each_worker_accumulates_independently() {
        let pool = TaskPool::with_threads(4);
        let storage: WorkerLocalStorage<u64> = WorkerLocalStorage::new(&pool, || 0);
        parallel_indexed(&pool, 0..10_000, 16, |_| {
            storage.with(|slot| *slot += 1);
        })
        .unwrap();
        let total: u64 = storage.to_range(|| 0).into_iter().sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn foreach_with_work_unit_one_summed_through_wls_matches_gauss_sum() {
        // §8 scenario 3: parallel(range(1000), W=1), body sums into WLS,
        // folding the drained range with `+` yields 499500.
        let pool = TaskPool::with_threads(4);
        let storage: WorkerLocalStorage<i64> = WorkerLocalStorage::new(&pool, || 0);
        parallel_indexed(&pool, 0..1000, 1, |i| {
            storage.with(|slot| *slot += i as i64);
        })
        .unwrap();
        let total: i64 = storage.to_range(|| 0).into_iter().sum();
        assert_eq!(total, 499_500);
    }
}
