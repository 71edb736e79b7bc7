//! Worker threads and the task executor.

use crate::context;
use crate::runtime::Scheduler;
use crate::task::{TaskRef, TaskState};
use std::sync::Arc;
use std::thread;

/// Spawn worker threads 1..n. Thread 0 is the caller of `init` and
/// contributes from `task_complete` and `task_wait`.
pub(crate) fn spawn_workers(sched: &Arc<Scheduler>) {
    for tid in 1..sched.num_threads() {
        let worker_sched = Arc::clone(sched);
        let name = format!("{}-{tid}", sched.cfg.thread_name);
        match thread::Builder::new()
            .name(name)
            .spawn(move || worker_main(worker_sched, tid))
        {
            Ok(handle) => sched.store_worker_handle(handle),
            Err(e) => tracing::error!(thread = tid, "failed to create worker thread: {e}"),
        }
    }
}

fn worker_main(sched: Arc<Scheduler>, tid: usize) {
    context::set_thread_id(tid);
    context::swap_current_task(Some(sched.root().clone()));
    tracing::debug!(thread = tid, "worker thread starting");

    while sched.is_parallel() {
        // Look for incoming remote tasks and responses.
        if let Err(e) = sched.transport().progress(&*sched) {
            tracing::error!("transport progress failed: {e:#}");
        }

        if let Some(task) = sched.next_task(tid) {
            run_task(&sched, task);
        }

        // Only go to sleep when no tasks are in flight.
        if sched.root().num_children() == 0 {
            if tid == sched.num_threads() - 1 {
                // The last thread keeps the message queue progressing even
                // when all others are sleeping.
                if let Err(e) = sched.transport().progress(&*sched) {
                    tracing::error!("transport progress failed: {e:#}");
                }
                thread::yield_now();
            } else {
                sched.wait_for_work();
            }
        }
    }

    tracing::info!(thread = tid, "worker thread exiting");
}

/// Execute one task to completion: run the function, drain children through
/// the implicit barrier, release successors and recycle the record.
pub(crate) fn run_task(sched: &Scheduler, task: TaskRef) {
    tracing::info!(
        thread = context::thread_id(),
        task = task.id(),
        "executing task"
    );

    // Save the current task and restore it when nested execution finishes.
    let prev = context::swap_current_task(Some(task.clone()));

    let parent = {
        let mut inner = task.inner.lock();
        inner.state = TaskState::Running;
        inner.parent.clone()
    };

    match task.take_fun() {
        Some(fun) => fun(),
        None => tracing::error!(task = task.id(), "task has no function to invoke"),
    }

    // Implicit barrier for child tasks.
    if let Err(e) = sched.task_complete() {
        tracing::error!(task = task.id(), "implicit barrier failed: {e}");
    }

    // TEARDOWN through FINISHED under the task mutex, so remote direct
    // dependency handling sees a consistent state/successor pair.
    {
        let mut inner = task.inner.lock();
        inner.state = TaskState::Teardown;
        sched.resolver.release_local_task(sched, &task, &mut inner);
        inner.state = TaskState::Finished;
    }

    if let Some(parent) = parent {
        let num_children = parent.dec_children();
        tracing::trace!(
            task = task.id(),
            parent = parent.id(),
            num_children,
            "task finished"
        );
    }

    // Referenced tasks are destroyed in task_wait instead.
    let has_ref = task.inner.lock().has_ref;
    if !has_ref {
        sched.tasks.destroy(task);
    }

    context::swap_current_task(prev);
}
