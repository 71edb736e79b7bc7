//! Per-thread task queues.
//!
//! The owning worker pushes and pops at the head; thieves pop from the tail.
//! All mutations are serialized under the queue mutex: the owner races with
//! thieves on near-empty queues, so even owner-side operations lock. No
//! fairness between thieves.

use crate::task::TaskRef;
use parking_lot::Mutex;
use std::collections::LinkedList;

pub(crate) struct TaskQueue {
    // LinkedList rather than VecDeque for the O(1) splice in `move_into`.
    inner: Mutex<LinkedList<TaskRef>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LinkedList::new()),
        }
    }

    pub(crate) fn push_front(&self, task: TaskRef) {
        self.inner.lock().push_front(task);
    }

    /// Owner-side pop.
    pub(crate) fn pop_front(&self) -> Option<TaskRef> {
        self.inner.lock().pop_front()
    }

    /// Thief-side pop; never called by the owning worker.
    pub(crate) fn pop_back(&self) -> Option<TaskRef> {
        self.inner.lock().pop_back()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Splice every task of `src` in front of `dst` in O(1), preserving the
    /// relative order of both queues. Locks dst before src.
    pub(crate) fn move_into(dst: &TaskQueue, src: &TaskQueue) {
        let mut dst = dst.inner.lock();
        let mut src = src.inner.lock();
        src.append(&mut dst);
        std::mem::swap(&mut *dst, &mut *src);
    }

    pub(crate) fn finalize(&self) {
        self.inner.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::Arc;

    fn ids(queue: &TaskQueue) -> Vec<u64> {
        queue.inner.lock().iter().map(|t| t.id()).collect()
    }

    fn tasks(n: std::ops::Range<u64>) -> Vec<TaskRef> {
        n.map(|i| {
            let t = Task::blank();
            t.activate(i, Box::new(|| {}), Task::new_root(), 0, false);
            t
        })
        .collect()
    }

    #[test]
    fn owner_pops_newest_thieves_pop_oldest() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());

        for task in tasks(1..4) {
            queue.push_front(task);
        }

        // Head order is 3, 2, 1.
        assert_eq!(queue.pop_front().unwrap().id(), 3);
        assert_eq!(queue.pop_back().unwrap().id(), 1);
        assert_eq!(queue.pop_front().unwrap().id(), 2);
        assert!(queue.pop_front().is_none());
        assert!(queue.pop_back().is_none());
    }

    #[test]
    fn move_into_prepends_and_empties_source() {
        let dst = TaskQueue::new();
        let src = TaskQueue::new();
        let all = tasks(1..6);

        for task in &all[..2] {
            dst.push_front(Arc::clone(task));
        }
        for task in &all[2..] {
            src.push_front(Arc::clone(task));
        }

        TaskQueue::move_into(&dst, &src);

        assert!(src.is_empty());
        assert_eq!(ids(&dst), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn move_into_empty_source_is_a_noop() {
        let dst = TaskQueue::new();
        let src = TaskQueue::new();
        for task in tasks(1..3) {
            dst.push_front(task);
        }

        TaskQueue::move_into(&dst, &src);
        assert_eq!(dst.len(), 2);
        assert!(src.is_empty());
    }
}
