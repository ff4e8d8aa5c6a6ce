//! The task record and the three forcing primitives.
//!
//! A [`Task<T>`] is a thin, cheaply-cloned handle around a shared
//! [`TaskSlot<T>`]. The slot is what actually lives on the queue (type-erased
//! behind the object-safe [`QueuedTask`] trait) so that a single
//! `Mutex<VecDeque<Arc<dyn QueuedTask>>>` can hold tasks of unrelated output
//! types.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Fault, PreconditionError};
use crate::pool::PoolHandle;

// -----------------------------------------------------------------------------
// TaskState

/// The three states a task's `state` byte can be in.
///
/// `NotStarted -> InProgress` is a compare-and-swap race between the worker
/// loop and a forcing thread; exactly one of them wins. `InProgress -> Done`
/// is performed unconditionally by whichever thread won the claim.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted = 0,
    InProgress = 1,
    Done = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::NotStarted,
            1 => TaskState::InProgress,
            _ => TaskState::Done,
        }
    }
}

// -----------------------------------------------------------------------------
// QueuedTask

/// Object-safe view of a queued task, used by [`crate::queue::TaskQueue`] so
/// that tasks of different `T` can share one queue.
pub(crate) trait QueuedTask: Send + Sync {
    /// Attempts to win the `NotStarted -> InProgress` transition.
    fn try_claim(&self) -> bool;

    /// Runs the body (the caller must already have won the claim via
    /// `try_claim`) and drives the state to `Done`, or back to `NotStarted`
    /// if this is a self-resubmitting submitter task.
    fn run(self: Arc<Self>);

    /// Current state, for diagnostics and `work_force`'s polling loop.
    fn state(&self) -> TaskState;

    /// Identity used for `Arc`-pointer-equality removal from the queue.
    fn identity(&self) -> *const ();

    /// Takes this task's fault, if it settled into `Done` with an `Err`
    /// result that nothing has read yet (via an `Ok`-preserving
    /// [`Task::spin_force`] and friends, or an earlier call to this same
    /// method). Returns `None` for a successful task, or one that already
    /// had its fault taken. Used by [`crate::pool::TaskPool::scope`] to
    /// make sure a spawned-but-never-forced scoped task's panic still
    /// surfaces when the scope exits.
    fn take_fault(&self) -> Option<Fault>;
}

// -----------------------------------------------------------------------------
// TaskSlot

/// Shared state behind a [`Task<T>`].
///
/// `body` holds the not-yet-run closure until some thread wins the claim and
/// takes it out; `result` holds the outcome once `state == Done`.
pub(crate) struct TaskSlot<T> {
    state: AtomicU8,
    body: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
    result: Mutex<Option<Result<T, Fault>>>,
    next_cycle: Mutex<Option<Box<dyn FnMut() -> Option<Box<dyn FnOnce() -> T + Send>> + Send>>>,
    pool: Mutex<Option<PoolHandle>>,
    /// Set only by [`crate::pool::TaskPool::execute_in_new_thread`]: a task
    /// that runs on its own dedicated OS thread instead of a pool queue.
    /// Forcing such a task joins this handle rather than stealing or
    /// blocking on a pool condvar.
    join_handle: Mutex<Option<JoinHandle<()>>>,
    /// Set once, by either `set_pool` or `set_join_handle`: there exists
    /// (or existed) some executor that will eventually run this task.
    /// `Task::new` alone does not set this — forcing a task that was never
    /// handed to a pool nor spawned via `execute_in_new_thread` would
    /// otherwise spin or block forever, since nothing would ever call
    /// `run()` on it. The forcing methods check this flag and raise
    /// `PreconditionError::NeverSubmitted` instead.
    has_executor: AtomicBool,
}

impl<T: Send + 'static> TaskSlot<T> {
    fn new(body: Box<dyn FnOnce() -> T + Send>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TaskState::NotStarted as u8),
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            next_cycle: Mutex::new(None),
            pool: Mutex::new(None),
            join_handle: Mutex::new(None),
            has_executor: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn pool(&self) -> Option<PoolHandle> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_pool(&self, pool: PoolHandle) {
        *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        self.has_executor.store(true, Ordering::Release);
    }

    pub(crate) fn set_join_handle(&self, handle: JoinHandle<()>) {
        *self.join_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.has_executor.store(true, Ordering::Release);
    }

    /// `true` once this task has been handed to a pool or spawned on its
    /// own dedicated thread — i.e. once something is guaranteed to
    /// eventually call `run()` on it.
    pub(crate) fn has_executor(&self) -> bool {
        self.has_executor.load(Ordering::Acquire)
    }

    fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        self.join_handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Marks this as a self-resubmitting "submitter task" (§4.3): instead of
    /// settling into `Done` after running `body` once, `run` calls `next`
    /// to get the next cycle's body. While `next` keeps returning `Some`,
    /// the task re-arms with that body, flips back to `NotStarted`, and
    /// requeues itself; once `next` returns `None` it settles to `Done`
    /// with whatever `result` its last cycle produced.
    pub(crate) fn set_resubmitter(
        &self,
        next: impl FnMut() -> Option<Box<dyn FnOnce() -> T + Send>> + Send + 'static,
    ) {
        *self.next_cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(next));
    }
}

impl<T: Send + 'static> QueuedTask for TaskSlot<T> {
    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::NotStarted as u8,
                TaskState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn run(self: Arc<Self>) {
        let body = self.body.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(body) = body else {
            // Nothing to run (already consumed by a resubmit cycle's prior
            // claim); settle straight to Done.
            self.state.store(TaskState::Done as u8, Ordering::Release);
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome.map_err(|p| p as Fault));

        let mut next_cycle = self.next_cycle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = next_cycle.as_mut() {
            if let Some(next_body) = next() {
                // Re-arm for another cycle instead of settling to Done.
                *self.body.lock().unwrap_or_else(|e| e.into_inner()) = Some(next_body);
                drop(next_cycle);
                self.state.store(TaskState::NotStarted as u8, Ordering::Release);
                if let Some(pool) = self.pool() {
                    pool.requeue(self.clone());
                }
                return;
            }
        }
        drop(next_cycle);

        self.state.store(TaskState::Done as u8, Ordering::Release);
        if let Some(pool) = self.pool() {
            pool.notify_completion();
        }
    }

    fn state(&self) -> TaskState {
        TaskSlot::state(self)
    }

    fn identity(&self) -> *const () {
        (self as *const Self).cast()
    }

    fn take_fault(&self) -> Option<Fault> {
        let mut guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(Err(fault)) => Some(fault),
            other => {
                *guard = other;
                None
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Task

/// A handle to a single unit of deferred work.
///
/// Cloning a `Task` is cheap (it clones the inner `Arc`); all clones observe
/// the same state and result.
#[must_use = "a Task does nothing until it is submitted to a pool and forced"]
pub struct Task<T> {
    pub(crate) slot: Arc<TaskSlot<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Creates an unsubmitted task wrapping `body`.
    ///
    /// This alone does not schedule `body` to run anywhere. The usual way
    /// to get a task that is guaranteed to eventually execute is
    /// [`crate::pool::TaskPool::submit`]/[`crate::pool::TaskPool::try_submit`]
    /// (which build and submit a task in one call) or
    /// [`crate::pool::TaskPool::execute_in_new_thread`] — there is no
    /// public way to submit a `Task` built directly through this
    /// constructor after the fact. Forcing a `Task::new` handle that never
    /// goes through one of those raises
    /// [`crate::error::PreconditionError::NeverSubmitted`] instead of
    /// blocking forever.
    pub fn new(body: impl FnOnce() -> T + Send + 'static) -> Self {
        Self { slot: TaskSlot::new(Box::new(body)) }
    }

    pub(crate) fn dyn_slot(&self) -> Arc<dyn QueuedTask> {
        self.slot.clone() as Arc<dyn QueuedTask>
    }

    pub(crate) fn set_pool(&self, pool: PoolHandle) {
        self.slot.set_pool(pool);
    }

    pub(crate) fn set_join_handle(&self, handle: JoinHandle<()>) {
        self.slot.set_join_handle(handle);
    }

    /// The underlying slot, for [`crate::pool::TaskPool::execute_in_new_thread`]
    /// to run directly on its dedicated thread instead of through a pool
    /// queue.
    pub(crate) fn slot_for_new_thread(&self) -> Arc<TaskSlot<T>> {
        self.slot.clone()
    }

    /// Marks this task as a self-resubmitting submitter (§4.3): see
    /// [`TaskSlot::set_resubmitter`].
    pub(crate) fn set_resubmitter(
        &self,
        next: impl FnMut() -> Option<Box<dyn FnOnce() -> T + Send>> + Send + 'static,
    ) {
        self.slot.set_resubmitter(next);
    }

    /// `true` once the task has reached `Done`. Never rethrows — a captured
    /// panic is only rethrown by the three `_force` methods (see DESIGN.md).
    pub fn done(&self) -> bool {
        self.slot.state() == TaskState::Done
    }

    fn try_steal(&self) {
        if let Some(pool) = self.slot.pool() {
            pool.try_steal_and_execute(self.dyn_slot());
        }
    }

    /// Blocks on the dedicated thread of a task spawned through
    /// [`crate::pool::TaskPool::execute_in_new_thread`], if any. Returns
    /// `true` once the task is settled this way, meaning the caller does not
    /// need to steal or wait on a pool condvar at all.
    fn join_one_shot(&self) -> bool {
        match self.slot.take_join_handle() {
            Some(handle) => {
                let _ = handle.join();
                true
            }
            None => false,
        }
    }

    /// Panics with [`PreconditionError::NeverSubmitted`] if this task was
    /// constructed via `Task::new` and never handed to a pool or spawned
    /// via `execute_in_new_thread` — i.e. nothing will ever call `run()`
    /// on it, so waiting for `Done` would otherwise spin or block forever
    /// (§7/§8: "forcing a never-submitted task" is a precondition fault,
    /// not a hang).
    fn ensure_runnable(&self) {
        if !self.slot.has_executor() {
            panic!("{}", PreconditionError::NeverSubmitted);
        }
    }

    /// Ensures the task has run (stealing it off the queue if still queued),
    /// then busy-waits on the state byte until `Done`.
    fn wait_spin(&self) {
        if !self.join_one_shot() {
            self.try_steal();
            self.ensure_runnable();
            while self.slot.state() != TaskState::Done {
                std::hint::spin_loop();
            }
        }
    }

    /// Ensures the task has run, then blocks on the pool's waiter condvar
    /// until it reaches `Done`.
    fn wait_yield(&self) {
        if !self.join_one_shot() {
            self.try_steal();
            self.ensure_runnable();
            match self.slot.pool() {
                Some(pool) => pool.wait_until(|| self.slot.state() == TaskState::Done),
                None => {
                    while self.slot.state() != TaskState::Done {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Ensures the task has run, then, while waiting, cooperatively executes
    /// other queued tasks from the same pool instead of idling. This is what
    /// makes nested parallelism deadlock-free: a thread blocked on a child
    /// task keeps the pool's queue draining.
    fn wait_work(&self) {
        if !self.join_one_shot() {
            self.try_steal();
            self.ensure_runnable();
            match self.slot.pool() {
                Some(pool) => {
                    loop {
                        if self.slot.state() == TaskState::Done {
                            break;
                        }
                        match pool.try_pop_other(self.slot.identity()) {
                            Some(other) => other.run(),
                            None => break,
                        }
                    }
                    pool.wait_until(|| self.slot.state() == TaskState::Done);
                }
                None => {
                    while self.slot.state() != TaskState::Done {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Takes the result out of a `Done` task's slot, rethrowing a captured
    /// panic. Unlike [`Task::peek_result`], this drains the slot rather than
    /// reading it: it is for callers (namely [`crate::pool::ScopedTask`])
    /// that don't need `T: Clone` and force a task at most once in practice,
    /// since a scope already drains every spawned task to `Done` before
    /// returning regardless of whether the caller ever calls force at all.
    fn take_result_once(&self) -> T {
        let mut guard = self.slot.result.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(Ok(value)) => value,
            Some(Err(fault)) => panic::resume_unwind(fault),
            None => panic!("task result already taken by an earlier force"),
        }
    }

    /// Like [`Task::spin_force`], but does not require `T: Clone`: see
    /// [`Task::take_result_once`].
    pub fn spin_force_once(&self) -> T {
        self.wait_spin();
        self.take_result_once()
    }

    /// Like [`Task::yield_force`], but does not require `T: Clone`: see
    /// [`Task::take_result_once`].
    pub fn yield_force_once(&self) -> T {
        self.wait_yield();
        self.take_result_once()
    }

    /// Like [`Task::work_force`], but does not require `T: Clone`: see
    /// [`Task::take_result_once`].
    pub fn work_force_once(&self) -> T {
        self.wait_work();
        self.take_result_once()
    }
}

/// Forcing needs `T: Clone` because a `Done` task must keep returning the
/// same result on every subsequent force (§8's idempotent-force property):
/// the slot is read, not drained, so the value is cloned out rather than
/// taken.
impl<T: Send + Clone + 'static> Task<T> {
    fn peek_result(&self) -> T {
        let mut guard = self.slot.result.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref().expect("task reached Done without a result") {
            Ok(value) => value.clone(),
            Err(_) => {
                // Fault payloads are not `Clone`, so unlike the success path
                // a second force after the first rethrow cannot reproduce
                // the exact same panic payload. Take it on the first force
                // (this is still idempotent in the sense that matters: the
                // task stays `Done` and every force on it panics) and fall
                // back to a stand-in payload on any later one.
                let fault = match guard.take() {
                    Some(Err(fault)) => fault,
                    _ => Box::new("task panicked (payload already consumed by an earlier force)") as Fault,
                };
                drop(guard);
                panic::resume_unwind(fault);
            }
        }
    }

    /// Ensures the task has run (stealing it off the queue if still queued),
    /// then busy-waits on the state byte until `Done`. Intended for very
    /// short tasks where the cost of blocking would dwarf the work itself.
    pub fn spin_force(&self) -> T {
        self.wait_spin();
        self.peek_result()
    }

    /// Ensures the task has run, then blocks on the pool's waiter condvar
    /// until it reaches `Done`.
    pub fn yield_force(&self) -> T {
        self.wait_yield();
        self.peek_result()
    }

    /// Like [`Task::yield_force`], but while waiting, cooperatively executes
    /// other queued tasks from the same pool instead of idling. This is what
    /// makes nested parallelism deadlock-free: a thread blocked on a child
    /// task keeps the pool's queue draining.
    pub fn work_force(&self) -> T {
        self.wait_work();
        self.peek_result()
    }
}

/// Boxed panic payload re-exported at the crate root for callers matching on
/// a fault captured through [`Task::spin_force`] and friends.
pub type TaskError = Fault;

/// Returned by [`crate::pool::TaskPool::try_submit`] when the pool can no
/// longer accept work.
pub type SubmitResult<T> = Result<Task<T>, PreconditionError>;

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;

    #[test]
    #[should_panic(expected = "never submitted to a pool")]
    fn forcing_a_never_submitted_task_is_a_precondition_fault() {
        // §7/§8: forcing a task that was never handed to a pool (nor
        // spawned via `execute_in_new_thread`) must raise
        // `PreconditionError::NeverSubmitted`, not hang forever.
        let task = Task::new(|| 2 + 2);
        task.spin_force();
    }

    #[test]
    fn done_is_false_before_force() {
        let pool = TaskPool::with_threads(2);
        let task = pool.submit(|| 1);
        assert!(!task.done());
        task.spin_force();
        assert!(task.done());
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panic_propagates_on_force() {
        let pool = TaskPool::with_threads(2);
        let task: Task<()> = pool.submit(|| panic!("boom"));
        task.spin_force();
    }

    #[test]
    fn forcing_a_done_task_again_is_a_no_op_returning_the_same_result() {
        let pool = TaskPool::with_threads(2);
        let task = pool.submit(|| 7);
        assert_eq!(task.spin_force(), 7);
        assert_eq!(task.spin_force(), 7);
        assert_eq!(task.yield_force(), 7);
    }

    #[test]
    fn forcing_a_failed_task_again_raises_a_fault_again() {
        let pool = TaskPool::with_threads(2);
        let task: Task<()> = pool.submit(|| panic!("boom"));
        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.yield_force()));
        assert!(first.is_err());
        // §8: "calling yield_force again raises it again" — the task stays
        // Done and every subsequent force still panics, even though the
        // exact payload can't be reproduced twice (see peek_result).
        let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.yield_force()));
        assert!(second.is_err());
    }
}
