//! Thread-local worker state.
//!
//! Each pool thread carries its worker id and a current-task slot. The slot is
//! saved and restored around nested execution: a task that drives the
//! scheduler from its implicit barrier re-enters the executor on the same OS
//! thread.

use crate::task::TaskRef;
use std::cell::{Cell, RefCell};

thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

pub(crate) fn set_thread_id(id: usize) {
    THREAD_ID.with(|t| t.set(id));
}

/// Worker id of the calling thread. Threads outside the pool report 0, the
/// master id, and contribute through the master's queues.
pub(crate) fn thread_id() -> usize {
    THREAD_ID.with(|t| t.get())
}

pub(crate) fn current_task() -> Option<TaskRef> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Install `task` as the current task, returning the previous occupant so the
/// caller can restore it when nested execution finishes.
pub(crate) fn swap_current_task(task: Option<TaskRef>) -> Option<TaskRef> {
    CURRENT_TASK.with(|c| std::mem::replace(&mut *c.borrow_mut(), task))
}
