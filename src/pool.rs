//! The task pool itself: a fixed set of worker threads draining one FIFO
//! queue, guarded by a single mutex and two condvars (§3).
//!
//! The worker condvar wakes an idle worker when work is queued; the waiter
//! condvar wakes a forcing thread when a task completes. Using two condvars
//! over the same mutex, rather than one, keeps a `notify_completion` from
//! also waking every idle worker (and vice versa) on every step.

use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{AggregatedFault, PreconditionError};
use crate::queue::TaskQueue;
use crate::task::{QueuedTask, SubmitResult, Task, TaskState};

// -----------------------------------------------------------------------------
// Status

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    /// `finish()` was called: stop pulling new submissions once the queue
    /// drains, but let whatever is already queued run.
    Finishing,
    /// `stop()` was called, or `Finishing` ran the queue dry: workers exit
    /// on their next iteration without looking at the queue again.
    StopNow,
}

struct Shared {
    queue: TaskQueue,
    status: Status,
}

// -----------------------------------------------------------------------------
// PoolInner / PoolHandle

struct PoolInner {
    shared: Mutex<Shared>,
    worker_cv: Condvar,
    waiter_cv: Condvar,
    size: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A cheaply-cloned reference to a running pool, stored inside every
/// [`crate::task::Task`] submitted to it. Not public: callers interact with
/// [`TaskPool`], which owns the one "canonical" handle and joins the worker
/// threads when it is dropped.
#[derive(Clone)]
pub(crate) struct PoolHandle(Arc<PoolInner>);

impl PoolHandle {
    /// An opaque, stable identity for this pool instance, used by
    /// [`crate::wls::WorkerLocalStorage`] to recognize "one of my own
    /// workers" versus an unrelated thread.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn size(&self) -> usize {
        self.0.size
    }

    /// Pushes an already-claimed-or-claimable task back onto the queue and
    /// wakes one idle worker. Used both for ordinary submission and for the
    /// batched driver's self-resubmitting submitter task (§4.3).
    pub(crate) fn requeue(&self, task: Arc<dyn QueuedTask>) {
        let mut guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
        guard.queue.push_back(task);
        drop(guard);
        self.0.worker_cv.notify_one();
    }

    /// Wakes every thread blocked on the waiter condvar. Called once a task
    /// settles into `Done`, so that `yield_force`/`work_force` callers can
    /// re-check their predicate.
    pub(crate) fn notify_completion(&self) {
        // Taking the lock (even though we touch nothing through it) closes
        // the lost-wakeup window against a waiter that is between checking
        // its predicate and calling `Condvar::wait`.
        let _guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
        self.0.waiter_cv.notify_all();
    }

    /// Blocks the calling thread on the waiter condvar until `predicate`
    /// holds. Used for `yield_force` and as the last step of `work_force`,
    /// once there is nothing left for the caller to steal.
    pub(crate) fn wait_until(&self, mut predicate: impl FnMut() -> bool) {
        let mut guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
        while !predicate() {
            guard = self.0.waiter_cv.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Removes `task` from the queue (if it is still there) and runs it
    /// inline on the calling thread. This is the caller-steal half of every
    /// `_force` method: before waiting for someone else to get to it, try to
    /// just do it yourself.
    pub(crate) fn try_steal_and_execute(&self, task: Arc<dyn QueuedTask>) -> bool {
        let id = task.identity();
        let stolen = {
            let mut guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
            guard.queue.remove_by_identity(id)
        };
        match stolen {
            Some(t) if t.try_claim() => {
                t.run();
                true
            }
            _ => false,
        }
    }

    /// Pops and claims the first queued task whose identity is not
    /// `exclude`. Used by `work_force` to find cooperative work while
    /// waiting on one specific task, so the calling thread never idles while
    /// there is other work it could be doing.
    pub(crate) fn try_pop_other(&self, exclude: *const ()) -> Option<Arc<dyn QueuedTask>> {
        let mut guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let candidate = guard.queue.pop_front_excluding(exclude)?;
            if candidate.try_claim() {
                return Some(candidate);
            }
            // Lost a claim race (shouldn't happen: nothing else removes
            // queued tasks except this method and try_steal_and_execute,
            // both of which claim before returning) — try the next one.
        }
    }

    /// Forces a type-erased task to `Done` by the same caller-steal protocol
    /// as [`Task::work_force`], without reading (and so without rethrowing)
    /// its result. Used to drain a [`Scope`]'s still-pending tasks before
    /// it returns.
    pub(crate) fn drain_until_done(&self, task: Arc<dyn QueuedTask>) {
        if self.try_steal_and_execute(task.clone()) {
            return;
        }
        loop {
            if task.state() == TaskState::Done {
                return;
            }
            match self.try_pop_other(task.identity()) {
                Some(other) => other.run(),
                None => break,
            }
        }
        self.wait_until(|| task.state() == TaskState::Done);
    }

    fn submit_erased<T: Send + 'static>(&self, task: &Task<T>) -> SubmitResult<T> {
        let mut guard = self.0.shared.lock().unwrap_or_else(|e| e.into_inner());
        if guard.status != Status::Running {
            return Err(PreconditionError::PoolNotRunning);
        }
        task.set_pool(self.clone());
        guard.queue.push_back(task.dyn_slot());
        drop(guard);
        self.0.worker_cv.notify_one();
        Ok(task.clone())
    }
}

// -----------------------------------------------------------------------------
// Worker-index thread-local

thread_local! {
    /// `(pool identity, 1-based index)` for the pool this thread is a worker
    /// of, if any. Any other thread — including a worker of a *different*
    /// pool — reads back index 0, the "outside" slot (§7).
    static CURRENT_WORKER: std::cell::Cell<Option<(usize, usize)>> = const { std::cell::Cell::new(None) };
}

/// The 1-based slot index of the calling thread within `pool_identity`'s
/// worker-local storage, or `0` if the calling thread is not one of that
/// pool's workers.
pub(crate) fn worker_slot(pool_identity: usize) -> usize {
    CURRENT_WORKER.with(|cell| match cell.get() {
        Some((id, index)) if id == pool_identity => index,
        _ => 0,
    })
}

fn worker_loop(pool: PoolHandle, index: usize) {
    CURRENT_WORKER.with(|cell| cell.set(Some((pool.identity(), index))));
    loop {
        let next = {
            let mut guard = pool.0.shared.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = guard.queue.pop_front() {
                    break Some(task);
                }
                match guard.status {
                    Status::Running => {
                        guard = pool.0.worker_cv.wait(guard).unwrap_or_else(|e| e.into_inner());
                    }
                    Status::Finishing => {
                        guard.status = Status::StopNow;
                        break None;
                    }
                    Status::StopNow => break None,
                }
            }
        };
        match next {
            Some(task) => task.run(),
            None => break,
        }
    }
}

// -----------------------------------------------------------------------------
// TaskPoolBuilder / TaskPool

/// Builds a [`TaskPool`] with a chosen worker count and a couple of
/// best-effort OS hints.
pub struct TaskPoolBuilder {
    threads: Option<usize>,
    daemon: bool,
    name: Option<String>,
    priority: Option<i32>,
}

impl TaskPoolBuilder {
    pub fn new() -> Self {
        Self { threads: None, daemon: false, name: None, priority: None }
    }

    /// Number of worker threads. Defaults to [`crate::global::total_cpus`]`()
    /// - 1` (leaving a core free for the submitting thread), floored at `0`
    /// — a pool with zero workers still runs every submitted task, just
    /// always by caller-steal (§4.9, the degenerate-pool properties).
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    /// Marks this pool as a daemon pool: its worker threads are spawned
    /// detached from the builder's point of view and [`TaskPool::drop`]
    /// does not block joining them. Used by [`crate::global::global_pool`]
    /// so process exit is never blocked on idle global workers.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Best-effort worker thread priority hint. `std::thread` has no
    /// portable priority API, so this is recorded but otherwise unused; see
    /// `SPEC_FULL.md` §6 for the platform-API alternative this stands in
    /// for.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn build(self) -> TaskPool {
        let size = self.threads.unwrap_or_else(|| crate::global::default_pool_threads());
        let inner = Arc::new(PoolInner {
            shared: Mutex::new(Shared { queue: TaskQueue::default(), status: Status::Running }),
            worker_cv: Condvar::new(),
            waiter_cv: Condvar::new(),
            size,
            threads: Mutex::new(Vec::with_capacity(size)),
        });
        let handle = PoolHandle(inner);

        let mut threads = Vec::with_capacity(size);
        for index in 1..=size {
            let worker_pool = handle.clone();
            let mut builder = thread::Builder::new();
            if let Some(name) = &self.name {
                builder = builder.name(format!("{name}-{index}"));
            }
            let spawned = builder
                .spawn(move || worker_loop(worker_pool, index))
                .expect("failed to spawn pool worker thread");
            threads.push(spawned);
        }
        *handle.0.threads.lock().unwrap_or_else(|e| e.into_inner()) = threads;

        TaskPool { handle, daemon: self.daemon, priority: Mutex::new(self.priority) }
    }
}

impl Default for TaskPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size pool of worker threads draining one FIFO task queue.
///
/// Submitting a task never blocks; the three `_force` methods on
/// [`Task`](crate::task::Task) are how a caller waits for (and, if
/// necessary, helps run) a result.
pub struct TaskPool {
    handle: PoolHandle,
    daemon: bool,
    priority: Mutex<Option<i32>>,
}

impl TaskPool {
    /// A pool sized to `total_cpus() - 1` worker threads.
    pub fn new() -> Self {
        TaskPoolBuilder::new().build()
    }

    pub fn with_threads(n: usize) -> Self {
        TaskPoolBuilder::new().threads(n).build()
    }

    /// Number of worker threads (not counting the submitting thread).
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Changes whether [`Drop`] waits for in-flight work. Does not affect
    /// already-running worker threads.
    pub fn set_daemon(&mut self, daemon: bool) {
        self.daemon = daemon;
    }

    pub fn priority(&self) -> Option<i32> {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_priority(&self, priority: Option<i32>) {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner()) = priority;
    }

    /// The calling thread's 1-based worker index within this pool, or `0`
    /// if it is not one of this pool's workers.
    pub fn worker_index(&self) -> usize {
        worker_slot(self.handle.identity())
    }

    pub(crate) fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Submits `body` and returns a handle to it, or an error if the pool
    /// has already been told to [`TaskPool::finish`] or [`TaskPool::stop`].
    pub fn try_submit<T: Send + 'static>(&self, body: impl FnOnce() -> T + Send + 'static) -> SubmitResult<T> {
        let task = Task::new(body);
        self.handle.submit_erased(&task)
    }

    /// Like [`TaskPool::try_submit`], panicking instead of returning an
    /// error. Appropriate when the caller already knows the pool is alive
    /// (e.g. the data-parallel algorithms in this crate, which only submit
    /// from inside a pool-owned call they are already running under).
    pub fn submit<T: Send + 'static>(&self, body: impl FnOnce() -> T + Send + 'static) -> Task<T> {
        self.try_submit(body).expect("submitted to a pool that is no longer running")
    }

    /// Submits a [`Task`] constructed (and possibly already armed with a
    /// resubmitter via [`Task::set_resubmitter`]) by the caller, instead of
    /// building a fresh one. Used by the batched data-parallel drivers to
    /// submit their self-resubmitting "submitter" tasks.
    pub(crate) fn submit_existing<T: Send + 'static>(&self, task: &Task<T>) -> Result<(), PreconditionError> {
        self.handle.submit_erased(task).map(|_| ())
    }

    /// Spawns `body` on its own dedicated OS thread, outside the pool's
    /// queue entirely. Forcing the returned task joins that thread. Used
    /// for the zero-worker degenerate pool (§4.9) and any one-off task a
    /// caller wants to run without touching the shared queue at all.
    pub fn execute_in_new_thread<T: Send + 'static>(body: impl FnOnce() -> T + Send + 'static) -> Task<T> {
        let task = Task::new(body);
        let slot = task.slot_for_new_thread();
        let handle = thread::Builder::new()
            .spawn(move || slot.run())
            .expect("failed to spawn one-shot thread");
        task.set_join_handle(handle);
        task
    }

    /// Stops accepting new conceptual work once the queue drains, then
    /// (if `wait`) blocks until every worker thread has exited.
    pub fn finish(&self, wait: bool) {
        {
            let mut guard = self.handle.0.shared.lock().unwrap_or_else(|e| e.into_inner());
            if guard.status == Status::Running {
                guard.status = Status::Finishing;
            }
        }
        self.handle.0.worker_cv.notify_all();
        if wait {
            self.wait_until_completion();
        }
    }

    /// Tells every worker to exit as soon as it is done with whatever it is
    /// currently running, abandoning anything still queued.
    pub fn stop(&self) {
        {
            let mut guard = self.handle.0.shared.lock().unwrap_or_else(|e| e.into_inner());
            guard.status = Status::StopNow;
        }
        self.handle.0.worker_cv.notify_all();
        self.handle.0.waiter_cv.notify_all();
    }

    /// Blocks until every worker thread has exited (they do so once
    /// `finish`/`stop` has been called and, for `finish`, the queue is dry).
    pub fn wait_until_completion(&self) {
        let mut threads = self.handle.0.threads.lock().unwrap_or_else(|e| e.into_inner());
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Runs `f`, which is handed a [`Scope`] it can spawn borrowed-data
    /// tasks through; blocks until every task spawned into that scope has
    /// settled before returning, so nothing borrowed by a spawned closure
    /// can outlive the borrow the type system sees.
    ///
    /// A scoped task's closure may borrow from the stack frame calling
    /// `scope`, but must produce an owned (`'static`) result, so that
    /// erasing the `'scope` bound on a spawned closure is the only place
    /// this crate needs `unsafe` at all (see [`Scope::spawn`]).
    pub fn scope<'env, F, R>(&self, f: F) -> R
    where
        F: for<'scope> FnOnce(&'scope Scope<'scope, 'env>) -> R,
    {
        let scope = Scope {
            pool: self.handle.clone(),
            pending: Mutex::new(Vec::new()),
            scope: PhantomData,
            env: PhantomData,
        };
        let result = f(&scope);

        let pending = std::mem::take(&mut *scope.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let mut faults = Vec::new();
        for task in pending {
            self.handle.drain_until_done(task.clone());
            if let Some(fault) = task.take_fault() {
                faults.push(fault);
            }
        }
        if let Some(aggregated) = AggregatedFault::from_faults(faults) {
            aggregated.resume();
        }
        result
    }
}

/// A scope a [`TaskPool::scope`] call hands to its closure. Every task
/// spawned through [`Scope::spawn`] is guaranteed to have run to completion
/// before the `scope` call that produced this `Scope` returns.
pub struct Scope<'scope, 'env: 'scope> {
    pool: PoolHandle,
    pending: Mutex<Vec<Arc<dyn QueuedTask>>>,
    scope: PhantomData<&'scope mut &'scope ()>,
    env: PhantomData<&'env mut &'env ()>,
}

impl<'scope, 'env> Scope<'scope, 'env> {
    /// Submits `f` to the scope's pool. `f` may borrow anything that
    /// outlives `'scope` (in particular, anything local to the stack frame
    /// that called [`TaskPool::scope`]); its result type must still be
    /// `'static`, since the task machinery underneath is not itself
    /// lifetime-parameterized.
    #[expect(unsafe_code, reason = "erases the 'scope bound on a spawned closure; TaskPool::scope forces it to Done before 'scope can end")]
    pub fn spawn<F, T>(&self, f: F) -> ScopedTask<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'static,
    {
        let boxed: Box<dyn FnOnce() -> T + Send + 'scope> = Box::new(f);
        // SAFETY: `TaskPool::scope` drains every task recorded in
        // `self.pending` to `Done` before it returns, which happens before
        // the `'scope` borrow erased here can possibly end.
        let boxed: Box<dyn FnOnce() -> T + Send + 'static> = unsafe { std::mem::transmute(boxed) };
        let task = Task::new(boxed);
        self.pool
            .submit_erased(&task)
            .expect("pool backing an open Scope stopped running");
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).push(task.dyn_slot());
        ScopedTask { task, _scope: PhantomData }
    }
}

/// A handle to a task spawned through [`Scope::spawn`]. Unlike
/// [`Task`](crate::task::Task), it cannot outlive the scope it was spawned
/// into.
pub struct ScopedTask<'scope, T> {
    task: Task<T>,
    _scope: PhantomData<&'scope ()>,
}

impl<'scope, T: Send + 'static> ScopedTask<'scope, T> {
    pub fn done(&self) -> bool {
        self.task.done()
    }

    /// Forces this task, consuming its result. Unlike [`Task::spin_force`],
    /// this does not require `T: Clone`: a scoped task is drained to `Done`
    /// by the enclosing [`TaskPool::scope`] regardless of whether it is
    /// ever explicitly forced, so there is no idempotent-reread requirement
    /// to uphold here (see [`crate::task::Task::spin_force_once`]).
    pub fn spin_force(&self) -> T {
        self.task.spin_force_once()
    }

    pub fn yield_force(&self) -> T {
        self.task.yield_force_once()
    }

    pub fn work_force(&self) -> T {
        self.task.work_force_once()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if self.daemon {
            // Let the OS reclaim daemon workers at process exit; this is
            // only reachable for a pool built with `.daemon(true)` that
            // someone chose to drop early rather than leak, so still ask
            // workers to wind down instead of abandoning them mid-task.
            self.stop();
            return;
        }
        self.finish(true);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submit_and_force_round_trip() {
        let pool = TaskPool::with_threads(2);
        let task = pool.submit(|| 1 + 1);
        assert_eq!(task.spin_force(), 2);
    }

    #[test]
    fn zero_worker_pool_runs_via_caller_steal() {
        let pool = TaskPool::with_threads(0);
        assert_eq!(pool.size(), 0);
        let task = pool.submit(|| 40 + 2);
        // No worker thread exists to pop this: spin_force must steal and
        // run it on the calling thread itself.
        assert_eq!(task.spin_force(), 42);
    }

    #[test]
    fn execute_in_new_thread_runs_off_the_queue() {
        let task = TaskPool::execute_in_new_thread(|| "hi");
        assert_eq!(task.yield_force(), "hi");
    }

    #[test]
    fn finish_drains_then_stops_accepting_work() {
        let pool = TaskPool::with_threads(1);
        let counted = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counted = counted.clone();
            pool.submit(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.finish(true);
        assert_eq!(counted.load(Ordering::SeqCst), 8);
        assert!(pool.try_submit(|| ()).is_err());
    }

    #[test]
    fn scope_allows_borrowing_the_caller_stack() {
        let pool = TaskPool::with_threads(4);
        let data = vec![1, 2, 3, 4, 5];
        let sum: i32 = pool.scope(|s| {
            let handles: Vec<_> = data.chunks(2).map(|chunk| s.spawn(move || chunk.iter().sum::<i32>())).collect();
            handles.iter().map(|h| h.spin_force()).sum()
        });
        assert_eq!(sum, data.iter().sum());
    }

    #[test]
    #[should_panic(expected = "task(s) failed")]
    fn scope_surfaces_an_unforced_panic_on_exit() {
        let pool = TaskPool::with_threads(2);
        pool.scope(|s| {
            let _ = s.spawn(|| panic!("boom"));
        });
    }

    #[test]
    fn worker_index_is_zero_outside_any_pool() {
        let pool = TaskPool::with_threads(2);
        assert_eq!(pool.worker_index(), 0);
    }

    #[test]
    fn worker_index_is_nonzero_inside_a_worker() {
        let pool = TaskPool::with_threads(2);
        let pool_identity = pool.handle().identity();
        let index_task = pool.submit(move || worker_slot(pool_identity));
        let index = index_task.spin_force();
        assert!((1..=pool.size()).contains(&index));
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = TaskPool::with_threads(2);
        pool.stop();
        pool.stop();
        pool.wait_until_completion();
    }

    #[test]
    fn finish_then_resubmit_fails() {
        let pool = TaskPool::with_threads(1);
        pool.finish(true);
        assert!(matches!(pool.try_submit(|| ()), Err(PreconditionError::PoolNotRunning)));
    }

    #[test]
    fn work_force_never_deadlocks_on_a_task_dag() {
        // Single worker: the worker thread itself is busy running `parent`,
        // so a child `parent` submits and then `work_force`s must be
        // completed by caller-steal on that same thread, not by waiting for
        // a worker that will never become free (§4.1, §8).
        let pool = Arc::new(TaskPool::with_threads(1));
        let inner = pool.clone();
        let parent = pool.submit(move || {
            let child = inner.submit(|| 41);
            child.work_force() + 1
        });
        assert_eq!(parent.work_force(), 42);
    }
}
