//! Scheduler frontend: process-wide lifecycle, task submission, the root
//! barrier and phase management.
//!
//! One scheduler instance per process, installed by [`init`] (or
//! [`Builder::init`](crate::Builder::init)) and torn down by [`fini`]. The
//! thread calling `init` becomes the master (thread 0); worker threads are
//! spawned for the remaining hardware threads and contribute through
//! work stealing.

use crate::config::Config;
use crate::context;
use crate::deps::Resolver;
use crate::error::{Result, SchedError};
use crate::gptr::UnitId;
use crate::remote::{InboundSink, PhaseDep, RemoteToken, Transport};
use crate::task::list::ListPool;
use crate::task::pool::TaskPool;
use crate::task::queue::TaskQueue;
use crate::task::{Task, TaskDep, TaskFn, TaskHandle, TaskRef};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

pub(crate) mod worker;

#[cfg(test)]
mod tests;

/// Per-thread queue pair. Tasks released into a phase the scheduler has not
/// admitted yet park on the deferred queue and are spliced into the runnable
/// queue at the root barrier.
pub(crate) struct Shard {
    pub(crate) queue: TaskQueue,
    pub(crate) deferred: TaskQueue,
}

pub(crate) struct Scheduler {
    pub(crate) cfg: Config,

    /// Sentinel parent of all top-level tasks; owns the phase counter.
    pub(crate) root: TaskRef,

    /// Highest phase admitted for execution. Advanced only by the master
    /// thread during the root barrier.
    phase_bound: AtomicU64,

    /// Cleared to stop the worker threads cooperatively.
    parallel: AtomicBool,

    pub(crate) shards: Vec<Shard>,

    /// Companion mutex of `task_avail`; closes the check-then-wait window on
    /// shutdown.
    pool_mutex: Mutex<()>,
    task_avail: Condvar,

    pub(crate) resolver: Resolver,
    pub(crate) tasks: TaskPool,
    list_pool: ListPool,

    /// Local tasks awaiting a remote release, keyed by the token carried in
    /// the outbound message.
    pub(crate) waiters: DashMap<u64, TaskRef>,
    next_token: AtomicU64,
    next_task_id: AtomicU64,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

static INSTANCE: RwLock<Option<Arc<Scheduler>>> = RwLock::new(None);

pub(crate) fn instance() -> Result<Arc<Scheduler>> {
    INSTANCE.read().clone().ok_or(SchedError::NotInitialized)
}

/// Install the process-wide scheduler. Called by `Builder::init`.
pub(crate) fn install(cfg: Config) -> Result<()> {
    let mut slot = INSTANCE.write();
    if slot.is_some() {
        tracing::error!("tasking subsystem can only be initialized once");
        return Err(SchedError::AlreadyInitialized);
    }

    let sched = Scheduler::new(cfg)?;
    tracing::info!(
        threads = sched.num_threads(),
        unit = %sched.unit_id(),
        "tasking subsystem initialized"
    );

    // The installing thread is the master.
    context::set_thread_id(0);
    context::swap_current_task(Some(sched.root.clone()));

    worker::spawn_workers(&sched);
    *slot = Some(sched);
    Ok(())
}

impl Scheduler {
    fn new(cfg: Config) -> Result<Arc<Self>> {
        cfg.transport.init().map_err(SchedError::Transport)?;

        let shards = (0..cfg.worker_threads)
            .map(|_| Shard {
                queue: TaskQueue::new(),
                deferred: TaskQueue::new(),
            })
            .collect();

        Ok(Arc::new(Self {
            cfg,
            root: Task::new_root(),
            phase_bound: AtomicU64::new(0),
            parallel: AtomicBool::new(true),
            shards,
            pool_mutex: Mutex::new(()),
            task_avail: Condvar::new(),
            resolver: Resolver::new(),
            tasks: TaskPool::new(),
            list_pool: ListPool::new(),
            waiters: DashMap::new(),
            next_token: AtomicU64::new(0),
            next_task_id: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn root(&self) -> &TaskRef {
        &self.root
    }

    pub(crate) fn unit_id(&self) -> UnitId {
        self.cfg.unit_id
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.cfg.transport
    }

    pub(crate) fn list_pool(&self) -> &ListPool {
        &self.list_pool
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.cfg.worker_threads
    }

    pub(crate) fn phase_bound(&self) -> u64 {
        self.phase_bound.load(Ordering::Acquire)
    }

    pub(crate) fn is_parallel(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    pub(crate) fn store_worker_handle(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    /// Mint a token for a local task awaiting a remote release.
    pub(crate) fn register_waiter(&self, task: &TaskRef) -> RemoteToken {
        let token = RemoteToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        self.waiters.insert(token.0, task.clone());
        token
    }

    fn allocate_task(&self, fun: TaskFn, parent: &TaskRef, has_ref: bool) -> TaskRef {
        let task = self.tasks.allocate().unwrap_or_else(Task::blank);
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        task.activate(id, fun, parent.clone(), parent.phase(), has_ref);
        task
    }

    fn spawn_task(&self, fun: TaskFn, deps: &[TaskDep], has_ref: bool) -> Result<TaskRef> {
        let parent = context::current_task().unwrap_or_else(|| self.root.clone());
        let task = self.allocate_task(fun, &parent, has_ref);

        let num_children = parent.inc_children();
        tracing::trace!(
            task = task.id(),
            parent = parent.id(),
            num_children,
            "submitting task"
        );

        // Creation guard: the extra unresolved dep keeps the task off the
        // queues while its dependencies are wired, so a predecessor finishing
        // mid-wire cannot race this thread to the enqueue.
        task.add_unresolved();
        let wired = self.resolver.handle_task(self, &task, deps);
        if task.release_unresolved() == 0 {
            self.enqueue_runnable(&task);
        }

        wired.map(|()| task)
    }

    /// Push a ready task on the calling thread's queue, or park it on the
    /// deferred queue when its phase is past the admitted bound.
    pub(crate) fn enqueue_runnable(&self, task: &TaskRef) {
        {
            let inner = task.inner.lock();
            if inner.state != crate::task::TaskState::Created {
                tracing::error!(
                    task = task.id(),
                    state = ?inner.state,
                    "refusing to enqueue task that already ran"
                );
                return;
            }
        }

        let shard = &self.shards[context::thread_id()];
        if task.phase() > self.phase_bound() {
            tracing::trace!(task = task.id(), phase = task.phase(), "deferring task");
            shard.deferred.push_front(task.clone());
        } else {
            shard.queue.push_front(task.clone());
        }
        self.task_avail.notify_all();
    }

    /// Pop work for `tid`: own queue first, then round-robin stealing from
    /// the right-hand neighbors' tails.
    pub(crate) fn next_task(&self, tid: usize) -> Option<TaskRef> {
        if let Some(task) = self.shards[tid].queue.pop_front() {
            return Some(task);
        }

        let n = self.shards.len();
        let mut victim = (tid + 1) % n;
        while victim != tid {
            if let Some(task) = self.shards[victim].queue.pop_back() {
                tracing::debug!(task = task.id(), victim, thief = tid, "stole task");
                return Some(task);
            }
            victim = (victim + 1) % n;
        }
        None
    }

    /// Sleep until new tasks are signaled. Re-checks the shutdown flag under
    /// the pool mutex so a concurrent `fini` cannot strand the sleeper.
    pub(crate) fn wait_for_work(&self) {
        let mut guard = self.pool_mutex.lock();
        if !self.is_parallel() {
            return;
        }
        self.task_avail.wait(&mut guard);
    }

    /// The current task's implicit barrier: drive the scheduler until every
    /// child has finished. On the root this is the phase boundary: staged
    /// remote requests are resolved, parked phases admitted, and the region
    /// history rebuilt afterwards.
    pub(crate) fn task_complete(&self) -> Result<()> {
        let tid = context::thread_id();
        let current = context::current_task().unwrap_or_else(|| self.root.clone());
        let is_root = Arc::ptr_eq(&current, &self.root);

        if is_root && tid != 0 {
            tracing::error!("task_complete() on the root task is only valid on the master thread");
            return Err(SchedError::NotMasterThread);
        }

        if is_root {
            // Once again make sure all incoming requests are served before
            // resolving them against the local history.
            self.transport()
                .progress_blocking(self)
                .map_err(SchedError::Transport)?;
            self.resolver.release_unhandled_remote(self)?;

            // Admit every phase up to the root's and release parked tasks.
            self.phase_bound
                .store(self.root.phase(), Ordering::Release);
            for shard in &self.shards {
                TaskQueue::move_into(&shard.queue, &shard.deferred);
            }
        }

        self.task_avail.notify_all();

        while current.num_children() > 0 {
            if let Err(e) = self.transport().progress(self) {
                tracing::error!("transport progress failed: {e:#}");
            }
            if let Some(task) = self.next_task(tid) {
                worker::run_task(self, task);
            }
        }

        if is_root {
            // No other tasks are running: rebuild the region history and
            // make the drained epoch's records reusable.
            self.resolver.reset();
            self.tasks.promote();
            self.waiters.clear();
        }

        Ok(())
    }

    fn task_wait(&self, handle: TaskHandle) -> Result<()> {
        let tid = context::thread_id();
        let task = handle.task;

        // Contribute to execution until the referenced task finishes.
        while !task.is_finished() {
            if let Err(e) = self.transport().progress(self) {
                tracing::error!("transport progress failed: {e:#}");
            }
            if let Some(next) = self.next_task(tid) {
                worker::run_task(self, next);
            }
        }

        self.tasks.destroy(task);
        Ok(())
    }

    fn phase(&self) -> Result<()> {
        if context::thread_id() != 0 {
            tracing::error!("switching phases can only be done by the master thread");
            return Err(SchedError::NotMasterThread);
        }

        if let Err(e) = self.transport().progress(self) {
            tracing::error!("transport progress failed: {e:#}");
        }
        self.resolver.end_phase(self.root.phase());
        let phase = self.root.bump_phase();
        tracing::info!(phase, "starting task phase");
        Ok(())
    }

    fn shutdown(&self) {
        tracing::debug!("tearing down task subsystem");

        {
            let _guard = self.pool_mutex.lock();
            self.parallel.store(false, Ordering::Release);
        }
        self.task_avail.notify_all();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }

        for shard in &self.shards {
            if !shard.queue.is_empty() || !shard.deferred.is_empty() {
                tracing::warn!("discarding tasks still queued at shutdown");
            }
            shard.queue.finalize();
            shard.deferred.finalize();
        }
        self.resolver.fini();
        self.tasks.fini();
        self.waiters.clear();
        self.list_pool.fini();

        if let Err(e) = self.cfg.transport.fini() {
            tracing::error!("transport fini failed: {e:#}");
        }
        tracing::debug!("finished with tear-down");
    }
}

impl InboundSink for Scheduler {
    fn handle_remote_task(
        &self,
        dep: &PhaseDep,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<()> {
        self.resolver.stage_remote_task(dep, remote_task, origin)
    }

    fn handle_remote_direct(
        &self,
        local_task: RemoteToken,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<()> {
        let local = self.waiters.get(&local_task.0).map(|e| e.value().clone());
        if local.is_none() {
            tracing::debug!(
                %local_task,
                "direct dependency for unknown local task, releasing immediately"
            );
        }
        self.resolver
            .stage_remote_direct(self, local, remote_task, origin)
    }

    fn release_remote_dep(&self, local_task: RemoteToken) -> Result<()> {
        match self.waiters.remove(&local_task.0) {
            Some((_, task)) => {
                self.resolver.release_remote_dep(self, task);
                Ok(())
            }
            None => {
                tracing::warn!(%local_task, "remote release for unknown local task");
                Ok(())
            }
        }
    }
}

/// Initialize the process-wide scheduler with default configuration. The
/// calling thread becomes the master.
pub fn init() -> Result<()> {
    crate::config::Builder::new().init()
}

/// Tear down the process-wide scheduler: stop and join the workers, drop all
/// pooled records, finalize the transport.
pub fn fini() -> Result<()> {
    let sched = INSTANCE.write().take().ok_or_else(|| {
        tracing::error!("tasking subsystem has not been initialized");
        SchedError::NotInitialized
    })?;
    sched.shutdown();
    context::swap_current_task(None);
    Ok(())
}

/// Submit a task. It becomes runnable once every declared dependency is
/// satisfied and its phase is admitted.
pub fn create_task<F>(fun: F, deps: &[TaskDep]) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    instance()?.spawn_task(Box::new(fun), deps, false).map(|_| ())
}

/// Like [`create_task`], but returns a handle; the task record survives
/// until the handle is consumed by [`task_wait`].
pub fn create_task_handle<F>(fun: F, deps: &[TaskDep]) -> Result<TaskHandle>
where
    F: FnOnce() + Send + 'static,
{
    instance()?
        .spawn_task(Box::new(fun), deps, true)
        .map(TaskHandle::new)
}

/// Run tasks until the referenced task has finished, then destroy its
/// record. Consuming the handle makes waiting on a destroyed task
/// unrepresentable.
pub fn task_wait(handle: TaskHandle) -> Result<()> {
    instance()?.task_wait(handle)
}

/// Wait for all children of the current task. On the root task this is the
/// phase boundary and is only valid on the master thread.
pub fn task_complete() -> Result<()> {
    instance()?.task_complete()
}

/// Advance the root phase counter. Master thread only.
pub fn phase() -> Result<()> {
    instance()?.phase()
}

/// The task executing on the calling thread, or the root sentinel between
/// tasks.
pub fn current_task() -> Option<TaskRef> {
    context::current_task()
}

/// Worker id of the calling thread; 0 for the master and for threads outside
/// the pool.
pub fn thread_num() -> usize {
    context::thread_id()
}

/// Number of worker threads, master included; 1 when uninitialized.
pub fn num_threads() -> usize {
    instance().map(|s| s.num_threads()).unwrap_or(1)
}

/// Queue a task whose dependencies are all satisfied. Exposed for resolver
/// layers built on top of the core; regular submissions go through
/// [`create_task`].
pub fn enqueue_runnable(task: &TaskRef) -> Result<()> {
    instance()?.enqueue_runnable(task);
    Ok(())
}
