//! Two-stage task record pool.
//!
//! Finished records are parked on the `recycle` list while a work epoch is
//! active and promoted to the `free` list once the root's children count
//! drops to zero, so a record is never reinitialized while another thread
//! still holds a reference into the draining epoch.

use crate::task::{Task, TaskRef, TaskState};
use parking_lot::Mutex;

pub(crate) struct TaskPool {
    recycle: Mutex<Vec<TaskRef>>,
    free: Mutex<Vec<TaskRef>>,
}

impl TaskPool {
    pub(crate) fn new() -> Self {
        Self {
            recycle: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pop a quiescent record, if any. Callers fall back to a fresh
    /// allocation.
    pub(crate) fn allocate(&self) -> Option<TaskRef> {
        self.free.lock().pop()
    }

    /// Reset a finished record and park it for reuse. The state write to
    /// `Destroyed` is final for this activation and must not be rewritten
    /// until the record is reactivated.
    pub(crate) fn destroy(&self, task: TaskRef) {
        {
            let mut inner = task.inner.lock();
            debug_assert!(
                inner.successors.is_empty() && inner.remote_successors.is_empty(),
                "destroying task {} with unreleased successors",
                task.id()
            );
            inner.state = TaskState::Destroyed;
            inner.parent = None;
            inner.has_ref = false;
        }
        let _ = task.take_fun();
        self.recycle.lock().push(task);
    }

    /// Promote the recycled records of the closing epoch; they may be reused
    /// from here on.
    pub(crate) fn promote(&self) {
        let mut recycle = self.recycle.lock();
        self.free.lock().append(&mut recycle);
    }

    pub(crate) fn fini(&self) {
        self.recycle.lock().clear();
        self.free.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn recycle_len(&self) -> usize {
        self.recycle.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}
