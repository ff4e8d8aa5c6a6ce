//! The FIFO task queue.
//!
//! Deliberately **not** a self-synchronizing type: it is always accessed
//! while the owning [`crate::pool::TaskPool`] already holds its single
//! pool-wide mutex, matching §3's "exactly one mutex guards the queue and
//! the two condvars". Keeping the queue itself lock-free-of-its-own lets
//! push/pop/unlink be plain `VecDeque` operations instead of a second,
//! independently-contended critical section.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::task::QueuedTask;

/// A strict FIFO of not-yet-claimed tasks.
#[derive(Default)]
pub(crate) struct TaskQueue {
    entries: VecDeque<Arc<dyn QueuedTask>>,
}

impl TaskQueue {
    pub(crate) fn push_back(&mut self, task: Arc<dyn QueuedTask>) {
        self.entries.push_back(task);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<dyn QueuedTask>> {
        self.entries.pop_front()
    }

    /// Removes and returns the first entry whose identity differs from
    /// `exclude`, preserving FIFO order for the remainder. Used by
    /// `work_force` to find cooperative work while waiting on a specific
    /// task.
    pub(crate) fn pop_front_excluding(&mut self, exclude: *const ()) -> Option<Arc<dyn QueuedTask>> {
        let pos = self.entries.iter().position(|t| t.identity() != exclude)?;
        self.entries.remove(pos)
    }

    /// Detaches the still-queued task with the given identity, wherever it
    /// sits in the queue. This is the "unlink" used by the steal primitive
    /// (§4.1): the remainder of the queue keeps its relative FIFO order.
    pub(crate) fn remove_by_identity(&mut self, id: *const ()) -> Option<Arc<dyn QueuedTask>> {
        let pos = self.entries.iter().position(|t| t.identity() == id)?;
        self.entries.remove(pos)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn fifo_order() {
        let mut q = TaskQueue::default();
        let a = Task::new(|| 1);
        let b = Task::new(|| 2);
        q.push_back(a.dyn_slot());
        q.push_back(b.dyn_slot());

        let first = q.pop_front().unwrap();
        assert!(std::ptr::eq(first.identity(), a.dyn_slot().identity()));
    }

    #[test]
    fn unlink_preserves_order_of_remainder() {
        let mut q = TaskQueue::default();
        let a = Task::new(|| 1);
        let b = Task::new(|| 2);
        let c = Task::new(|| 3);
        q.push_back(a.dyn_slot());
        q.push_back(b.dyn_slot());
        q.push_back(c.dyn_slot());

        let removed = q.remove_by_identity(b.dyn_slot().identity()).unwrap();
        assert!(std::ptr::eq(removed.identity(), b.dyn_slot().identity()));

        let first = q.pop_front().unwrap();
        assert!(std::ptr::eq(first.identity(), a.dyn_slot().identity()));
        let second = q.pop_front().unwrap();
        assert!(std::ptr::eq(second.identity(), c.dyn_slot().identity()));
    }
}
