//! Parallel `foreach` (§4.1-§4.3): batched lazy submission of work units
//! over a range, via a small, fixed number of self-resubmitting "submitter"
//! tasks rather than one task per work unit.
//!
//! Each submitter claims the next not-yet-dispatched work unit from a
//! shared, lock-free cursor, runs the body over every index in it, and then
//! asks for another unit instead of settling to `Done` — exactly the
//! [`crate::task::TaskSlot::set_resubmitter`] cycle this module exists to
//! drive. Capping the submitter count at `2 * pool.size()` bounds the
//! number of live tasks at any moment to a small multiple of the worker
//! count, regardless of how many work units the range splits into.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{AggregatedFault, Fault, ForeachBreak, PreconditionError};
use crate::pool::TaskPool;
use crate::task::Task;

/// What a `parallel`/`parallel_indexed` body asks the driver to do next.
///
/// A plain `()`-returning body is always treated as [`ForeachControl::Continue`]
/// (see the blanket [`IntoForeachControl`] impl), so most callers never
/// need to name this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeachControl {
    Continue,
    Break,
}

/// Lets a `parallel`/`parallel_indexed` body return either `()` or a
/// [`ForeachControl`], so a body can fall out of the loop early with a
/// literal `break`-shaped return value.
pub trait IntoForeachControl {
    fn into_foreach_control(self) -> ForeachControl;
}

impl IntoForeachControl for () {
    fn into_foreach_control(self) -> ForeachControl {
        ForeachControl::Continue
    }
}

impl IntoForeachControl for ForeachControl {
    fn into_foreach_control(self) -> ForeachControl {
        self
    }
}

struct Dispatcher {
    /// Next not-yet-claimed offset, relative to the range's own start.
    next: AtomicUsize,
    len: usize,
    work_unit: usize,
    broke: AtomicBool,
    /// Set by either a `Break` or a panicking work unit. Submission checks
    /// this (not `broke` alone) so that a fault stops new claims exactly
    /// like a `Break` does (§4.4: "on the first fault from any work unit,
    /// submission stops immediately"); `broke` is kept separate purely to
    /// decide which error type to report once everything has settled.
    stopped: AtomicBool,
    faults: Mutex<Vec<Fault>>,
}

impl Dispatcher {
    /// Atomically claims the next work unit, returning its `[start, end)`
    /// offsets (relative to the range's start), or `None` once the range is
    /// exhausted, a body has returned [`ForeachControl::Break`], or some
    /// work unit has already faulted.
    fn claim_unit(&self) -> Option<(usize, usize)> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        loop {
            let start = self.next.load(Ordering::Acquire);
            if start >= self.len {
                return None;
            }
            let end = (start + self.work_unit).min(self.len);
            match self.next.compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some((start, end)),
                Err(_) => continue,
            }
        }
    }
}

fn run_unit<F, R>(body: &F, dispatcher: &Dispatcher, offsets: (usize, usize), range_start: usize)
where
    F: Fn(usize) -> R + Sync + Send,
    R: IntoForeachControl,
{
    let (start, end) = offsets;
    for offset in start..end {
        let index = range_start + offset;
        match panic::catch_unwind(AssertUnwindSafe(|| body(index))) {
            Ok(control) => {
                if control.into_foreach_control() == ForeachControl::Break {
                    dispatcher.broke.store(true, Ordering::Release);
                    dispatcher.stopped.store(true, Ordering::Release);
                    return;
                }
            }
            Err(fault) => {
                dispatcher.faults.lock().unwrap_or_else(|e| e.into_inner()).push(fault);
                // Stop new claims immediately, same as a Break: §4.4, "on
                // the first fault from any work unit, submission stops
                // immediately." Other in-flight units (already claimed by
                // other submitters) are left to run to completion, matching
                // ForeachBreak/AggregatedFault's "other faults are chained,
                // not dropped" contract.
                dispatcher.stopped.store(true, Ordering::Release);
                return;
            }
        }
    }
}

fn next_work<F, R>(
    dispatcher: Arc<Dispatcher>,
    body: Arc<F>,
    range_start: usize,
) -> impl FnMut() -> Option<Box<dyn FnOnce() + Send>>
where
    F: Fn(usize) -> R + Sync + Send + 'static,
    R: IntoForeachControl + 'static,
{
    move || {
        let offsets = dispatcher.claim_unit()?;
        let dispatcher = dispatcher.clone();
        let body = body.clone();
        Some(Box::new(move || run_unit(&*body, &dispatcher, offsets, range_start)) as Box<dyn FnOnce() + Send>)
    }
}

/// A reasonable default work-unit size: split the range into roughly
/// `4 * (pool.size() + 1)` pieces, so there is enough batching that a
/// submitter task's overhead is amortized, but enough pieces that a slow
/// unit doesn't leave other workers idle for long.
pub fn recommended_work_unit(pool: &TaskPool, len: usize) -> usize {
    let pieces = 4 * (pool.size() + 1);
    (len / pieces).max(1)
}

/// Runs `body(i)` for every `i` in `range`, in work units of `work_unit`
/// indices at a time, across `pool`'s workers.
///
/// Returns `Err` only for a bad `work_unit`; a panicking or
/// [`ForeachControl::Break`]-returning body instead surfaces by panicking
/// with an [`AggregatedFault`] or [`ForeachBreak`] once every in-flight unit
/// has settled.
pub fn parallel_indexed<F, R>(pool: &TaskPool, range: Range<usize>, work_unit: usize, body: F) -> Result<(), PreconditionError>
where
    F: Fn(usize) -> R + Sync + Send + 'static,
    R: IntoForeachControl + 'static,
{
    if work_unit == 0 {
        return Err(PreconditionError::ZeroWorkUnit);
    }
    let len = range.end.saturating_sub(range.start);
    if len == 0 {
        return Ok(());
    }

    if pool.size() == 0 {
        // Degenerate pool: nothing to submit to: run serially on the
        // caller's own thread, same as caller-steal would end up doing
        // anyway, minus the submission overhead.
        for i in range {
            if body(i).into_foreach_control() == ForeachControl::Break {
                break;
            }
        }
        return Ok(());
    }

    let dispatcher = Arc::new(Dispatcher {
        next: AtomicUsize::new(0),
        len,
        work_unit,
        broke: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
        faults: Mutex::new(Vec::new()),
    });
    let body = Arc::new(body);

    let submitter_cap = 2 * pool.size();
    let mut submitters = Vec::with_capacity(submitter_cap);
    for _ in 0..submitter_cap {
        let mut next = next_work(dispatcher.clone(), body.clone(), range.start);
        let Some(first) = next() else { break };
        let task: Task<()> = Task::new(first);
        task.set_resubmitter(next);
        pool.submit_existing(&task).expect("pool backing parallel_indexed stopped running mid-call");
        submitters.push(task);
    }

    for task in submitters {
        task.work_force();
    }

    let broke = dispatcher.broke.load(Ordering::Acquire);
    let faults = std::mem::take(&mut *dispatcher.faults.lock().unwrap_or_else(|e| e.into_inner()));
    if broke {
        ForeachBreak { other: faults }.resume();
    }
    if let Some(aggregated) = AggregatedFault::from_faults(faults) {
        aggregated.resume();
    }
    Ok(())
}

/// Like [`parallel_indexed`], but `body` receives an element reference
/// rather than a bare index. `items` is an [`Arc`] rather than a borrowed
/// slice because submitter tasks must be able to outlive the calling
/// stack frame between work-unit cycles; share a slice this way instead of
/// cloning it per item. Use [`crate::pool::TaskPool::scope`] directly if a
/// true borrow is required.
pub fn parallel<T, F, R>(pool: &TaskPool, items: Arc<[T]>, work_unit: usize, body: F) -> Result<(), PreconditionError>
where
    T: Sync + Send + 'static,
    F: Fn(&T) -> R + Sync + Send + 'static,
    R: IntoForeachControl + 'static,
{
    let len = items.len();
    parallel_indexed(pool, 0..len, work_unit, move |i| body(&items[i]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_work_unit_is_rejected() {
        let pool = TaskPool::with_threads(2);
        let err = parallel_indexed(&pool, 0..10, 0, |_| ());
        assert!(matches!(err, Err(PreconditionError::ZeroWorkUnit)));
    }

    #[test]
    fn empty_range_is_a_no_op() {
        let pool = TaskPool::with_threads(2);
        assert!(parallel_indexed(&pool, 5..5, 4, |_| panic!("never called")).is_ok());
    }

    #[test]
    fn visits_every_index_exactly_once() {
        let pool = TaskPool::with_threads(4);
        let hits: Arc<[AtomicUsize]> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        {
            let hits = hits.clone();
            parallel_indexed(&pool, 0..1000, 7, move |i| {
                hits[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn degenerate_pool_runs_serially() {
        let pool = TaskPool::with_threads(0);
        let sum = Arc::new(std::sync::Mutex::new(0usize));
        {
            let sum = sum.clone();
            parallel_indexed(&pool, 0..100, 10, move |i| {
                *sum.lock().unwrap() += i;
            })
            .unwrap();
        }
        assert_eq!(*sum.lock().unwrap(), (0..100).sum());
    }

    #[test]
    #[should_panic(expected = "task(s) failed")]
    fn a_panicking_unit_surfaces_as_an_aggregated_fault() {
        let pool = TaskPool::with_threads(2);
        parallel_indexed(&pool, 0..20, 2, |i| {
            if i == 10 {
                panic!("boom");
            }
        })
        .unwrap();
    }

    #[test]
    fn a_panicking_unit_stops_new_submissions() {
        // §4.4: "on the first fault from any work unit, submission stops
        // immediately" — a panic must halt dispatch exactly like `Break`
        // does, not just abort its own work unit while submitters keep
        // claiming the rest of the range.
        let pool = TaskPool::with_threads(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            parallel_indexed(&pool, 0..1_000_000, 1, move |i| {
                calls2.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    panic!("boom");
                }
            })
            .unwrap();
        }));
        assert!(result.is_err());
        assert!(calls.load(Ordering::SeqCst) < 1_000_000);
    }

    #[test]
    #[should_panic(expected = "broke out")]
    fn breaking_stops_new_submissions() {
        let pool = TaskPool::with_threads(2);
        parallel_indexed(&pool, 0..1000, 4, |i| {
            if i == 500 { ForeachControl::Break } else { ForeachControl::Continue }
        })
        .unwrap();
    }

    #[test]
    fn parallel_over_a_shared_slice() {
        let pool = TaskPool::with_threads(2);
        let items: Arc<[i32]> = (0..50).collect::<Vec<_>>().into();
        let total = Arc::new(std::sync::atomic::AtomicI64::new(0));
        {
            let total = total.clone();
            parallel(&pool, items, 5, move |&x| {
                total.fetch_add(x as i64, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), (0..50).sum::<i32>() as i64);
    }
}
