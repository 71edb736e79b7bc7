//! Data-dependency resolver.
//!
//! Maintains the per-region history of submitted tasks and wires successor
//! relationships from read-after-write / write-after-read / write-after-write
//! reasoning, scoped by phases. Remote requests are staged on arrival and
//! resolved against the local history at phase boundaries.

use crate::error::SchedError;
use crate::gptr::UnitId;
use crate::remote::{PhaseDep, RemoteToken};
use crate::runtime::Scheduler;
use crate::task::{DepKind, RegionDep, Task, TaskDep, TaskInner, TaskRef, TaskState};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) mod hash;
use hash::{DepPool, DepRecord, DepStack, DepTable, DepTarget, hash_gptr};

pub(crate) struct Resolver {
    /// Region history of the running epoch; rebuilt after every root barrier.
    table: Mutex<DepTable>,
    pool: DepPool,
    /// Inbound remote requests awaiting resolution at the next phase
    /// boundary, to avoid racing with still-submitting local tasks.
    unhandled_remote: Mutex<DepStack>,
    /// Remote releases for tasks in phases the scheduler has not admitted
    /// yet.
    deferred_releases: Mutex<DepStack>,
}

impl Resolver {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(DepTable::new()),
            pool: DepPool::new(),
            unhandled_remote: Mutex::new(DepStack::new()),
            deferred_releases: Mutex::new(DepStack::new()),
        }
    }

    /// Wire `task` behind every conflicting predecessor and record its deps
    /// in the hash. Called once per task at submission, before it can become
    /// runnable.
    pub(crate) fn handle_task(
        &self,
        sched: &Scheduler,
        task: &TaskRef,
        deps: &[TaskDep],
    ) -> Result<(), SchedError> {
        let parent_is_root = {
            let inner = task.inner.lock();
            inner
                .parent
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, sched.root()))
        };
        tracing::debug!(
            task = task.id(),
            ndeps = deps.len(),
            phase = task.phase(),
            "wiring data dependencies"
        );

        for dep in deps {
            match dep {
                TaskDep::Ignore => continue,
                TaskDep::Direct(dep_task) => {
                    let mut inner = dep_task.inner.lock();
                    if inner.state.is_active() {
                        inner.successors.prepend(sched.list_pool(), task.clone());
                        let unresolved = task.add_unresolved();
                        tracing::trace!(
                            task = task.id(),
                            pred = dep_task.id(),
                            unresolved,
                            "direct local successor"
                        );
                    }
                }
                region => {
                    // Region deps always carry a pointer.
                    let Some(gptr) = region.gptr() else { continue };

                    if gptr.unit != sched.unit_id() {
                        if parent_is_root {
                            self.remote_datadep(sched, task, RegionDep::new(region.kind(), gptr))?;
                        } else {
                            tracing::warn!(
                                task = task.id(),
                                "ignoring remote dependency in nested task"
                            );
                        }
                        continue;
                    }

                    self.wire_local_region(sched, task, region.kind(), gptr);
                }
            }
        }

        Ok(())
    }

    /// Forward a dependency on a region owned by another participant. Only
    /// direct children of the root may carry remote dependencies.
    fn remote_datadep(
        &self,
        sched: &Scheduler,
        task: &TaskRef,
        dep: RegionDep,
    ) -> Result<(), SchedError> {
        task.add_unresolved();
        let reader = sched.register_waiter(task);
        tracing::debug!(
            task = task.id(),
            %reader,
            target = %dep.gptr.unit,
            "requesting remote dependency"
        );
        sched
            .transport()
            .datadep(&dep, task.phase(), reader)
            .map_err(SchedError::Transport)
    }

    /// Walk the bucket newest-first and chain `task` behind conflicting
    /// predecessors, stopping at the first OUT-like record: everything older
    /// is shadowed by that write.
    fn wire_local_region(
        &self,
        sched: &Scheduler,
        task: &TaskRef,
        kind: DepKind,
        gptr: crate::gptr::GlobalPtr,
    ) {
        let slot = hash_gptr(&gptr);
        let mut table = self.table.lock();

        for elem in table.buckets[slot].iter() {
            let Some(elem_task) = elem.target.local() else {
                continue;
            };
            if elem.dep.gptr.offset != gptr.offset {
                continue;
            }
            if Arc::ptr_eq(elem_task, task) {
                tracing::error!(
                    task = task.id(),
                    region = %gptr,
                    "task already present in dependency hash with the same region"
                );
                debug_assert!(false, "duplicate dependency entry");
                continue;
            }

            let conflict = kind.is_out_like()
                || (kind == DepKind::In && elem.dep.kind.is_out_like());
            let mut inner = elem_task.inner.lock();
            if inner.state.is_active() && conflict {
                inner.successors.prepend(sched.list_pool(), task.clone());
                let unresolved = task.add_unresolved();
                tracing::trace!(
                    task = task.id(),
                    pred = elem_task.id(),
                    unresolved,
                    "local successor of conflicting predecessor"
                );
            }
            drop(inner);

            if elem.dep.kind.is_out_like() {
                tracing::trace!(task = task.id(), "stopping bucket walk at first write");
                break;
            }
        }

        let node = self.pool.allocate(DepRecord {
            target: DepTarget::Local(task.clone()),
            dep: RegionDep::new(kind, gptr),
            phase: task.phase(),
        });
        table.buckets[slot].push(node);
    }

    /// Release the remote and local successors of a finishing task. Runs in
    /// TEARDOWN state with the task's mutex held by the executor.
    pub(crate) fn release_local_task(
        &self,
        sched: &Scheduler,
        task: &Task,
        inner: &mut TaskInner,
    ) {
        debug_assert_eq!(inner.state, TaskState::Teardown);

        let mut remote = inner.remote_successors.take_all();
        while let Some(mut node) = remote.pop_node() {
            if let Some(rec) = node.take()
                && let DepTarget::Remote(token) = rec.target
            {
                let origin = rec.dep.gptr.unit;
                tracing::debug!(task = task.id(), %token, %origin, "releasing remote successor");
                if let Err(e) = sched.transport().release(origin, token, &rec.dep) {
                    tracing::error!(task = task.id(), "failed to send remote release: {e:#}");
                }
            }
            self.pool.recycle(node);
        }

        while let Some(succ) = inner.successors.pop(sched.list_pool()) {
            let unresolved = succ.release_unresolved();
            tracing::debug!(
                task = task.id(),
                succ = succ.id(),
                unresolved,
                "released local successor"
            );
            if unresolved == 0 {
                sched.enqueue_runnable(&succ);
            } else if unresolved < 0 {
                tracing::error!(
                    succ = succ.id(),
                    "task does not seem to have unresolved dependencies"
                );
            }
        }
    }

    /// Stage an inbound remote dependency request for resolution at the next
    /// phase boundary. Only IN-typed requests are accepted.
    pub(crate) fn stage_remote_task(
        &self,
        pd: &PhaseDep,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<(), SchedError> {
        if pd.dep.kind != DepKind::In {
            tracing::error!(
                %origin,
                "remote dependencies with type other than IN are not supported"
            );
            return Err(SchedError::UnsupportedRemoteDep);
        }

        tracing::info!(task = %remote_task, %origin, "staging remote task for later resolution");
        let mut dep = pd.dep;
        dep.gptr.unit = origin;
        let node = self.pool.allocate(DepRecord {
            target: DepTarget::Remote(remote_task),
            dep,
            phase: pd.phase,
        });
        self.unhandled_remote.lock().push(node);
        Ok(())
    }

    /// Handle a direct dependency between a local task and its remote
    /// successor: stage the release if the local task is still in flight,
    /// else release immediately.
    pub(crate) fn stage_remote_direct(
        &self,
        sched: &Scheduler,
        local: Option<TaskRef>,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<(), SchedError> {
        let dep = RegionDep::direct(origin);

        if let Some(task) = &local {
            let mut inner = task.inner.lock();
            if inner.state.is_active() {
                tracing::debug!(task = task.id(), %remote_task, "staging remote direct successor");
                inner.remote_successors.push(self.pool.allocate(DepRecord {
                    target: DepTarget::Remote(remote_task),
                    dep,
                    phase: task.phase(),
                }));
                return Ok(());
            }
        }

        // Local task done already, release immediately.
        sched
            .transport()
            .release(origin, remote_task, &dep)
            .map_err(SchedError::Transport)
    }

    /// A remote producer has delivered; release the waiting local task, or
    /// park the release until the task's phase is admitted.
    pub(crate) fn release_remote_dep(&self, sched: &Scheduler, task: TaskRef) {
        let mut deferred = self.deferred_releases.lock();
        if task.phase() > sched.phase_bound() {
            tracing::debug!(
                task = task.id(),
                phase = task.phase(),
                bound = sched.phase_bound(),
                "deferring release of remote dependency"
            );
            let phase = task.phase();
            deferred.push(self.pool.allocate(DepRecord {
                target: DepTarget::Local(task),
                dep: RegionDep::direct(UnitId::default()),
                phase,
            }));
        } else {
            let unresolved = task.release_unresolved();
            tracing::debug!(
                task = task.id(),
                unresolved,
                "released remote dependency"
            );
            if unresolved == 0 {
                sched.enqueue_runnable(&task);
            } else if unresolved < 0 {
                tracing::error!(
                    task = task.id(),
                    "task with remote dependency does not seem to have unresolved dependencies"
                );
            }
        }
    }

    /// Resolve every staged remote request against the local history. Runs at
    /// the end of a phase, on the master thread, inside the root barrier.
    ///
    /// For each request: among OUT-like active writers with phase at or past
    /// the request's, the smallest phase becomes a direct-dep candidate (it
    /// would overwrite the remote reader's input and must wait for it); among
    /// writers in earlier phases, the largest phase is the fulfillment
    /// candidate (the closest write preceding the read).
    pub(crate) fn release_unhandled_remote(&self, sched: &Scheduler) -> Result<(), SchedError> {
        let mut staged = self.unhandled_remote.lock().take_all();
        tracing::debug!("handling previously unhandled remote dependencies");

        while let Some(node) = staged.pop_node() {
            let Some((reader, dep, rphase)) = node.record().and_then(|rec| match rec.target {
                DepTarget::Remote(token) => Some((token, rec.dep, rec.phase)),
                DepTarget::Local(_) => None,
            }) else {
                self.pool.recycle(node);
                continue;
            };
            let origin = dep.gptr.unit;
            tracing::debug!(%reader, %origin, phase = rphase, "resolving staged remote dependency");

            let mut fulfill: Option<TaskRef> = None;
            let mut direct: Option<TaskRef> = None;

            // Holding the table mutex serializes the walk against concurrent
            // submissions, so the candidate set cannot grow mid-scan.
            let table = self.table.lock();
            for elem in table.buckets[hash_gptr(&dep.gptr)].iter() {
                let Some(t) = elem.target.local() else {
                    continue;
                };
                if elem.dep.gptr.offset != dep.gptr.offset || !elem.dep.kind.is_out_like() {
                    continue;
                }
                if !t.inner.lock().state.is_active() {
                    continue;
                }

                if t.phase() >= rphase {
                    if direct.as_ref().is_none_or(|d| d.phase() > t.phase()) {
                        direct = Some(t.clone());
                    }
                } else if fulfill.as_ref().is_none_or(|c| t.phase() > c.phase()) {
                    fulfill = Some(t.clone());
                }
            }

            if let Some(d) = &direct {
                let waiter = sched.register_waiter(d);
                if let Err(e) = sched.transport().direct_taskdep(origin, reader, waiter) {
                    tracing::error!(task = d.id(), "failed to send direct task dependency: {e:#}");
                }
                let unresolved = d.add_unresolved();
                tracing::debug!(
                    task = d.id(),
                    phase = d.phase(),
                    %reader,
                    unresolved,
                    "direct task dependency on remote reader"
                );
            }

            let mut node = Some(node);
            if let Some(c) = &fulfill {
                let mut inner = c.inner.lock();
                // The candidate may have finished since the scan; fall back
                // to an immediate release below if so.
                if inner.state.is_active()
                    && let Some(n) = node.take()
                {
                    tracing::debug!(
                        candidate = c.id(),
                        %reader,
                        "local task satisfies remote dependency"
                    );
                    inner.remote_successors.push(n);
                }
            }
            if let Some(n) = node {
                tracing::debug!(%reader, %origin, phase = rphase, "releasing unmatched remote task");
                if let Err(e) = sched.transport().release(origin, reader, &dep) {
                    tracing::error!(%reader, "failed to send remote release: {e:#}");
                }
                self.pool.recycle(n);
            }
        }

        self.release_deferred(sched);
        Ok(())
    }

    /// Drain the deferred remote releases. The boundary is about to admit
    /// their phases, so the decrements are unconditional; `enqueue_runnable`
    /// parks any task still past the bound on the deferred queue.
    fn release_deferred(&self, sched: &Scheduler) {
        let mut guard = self.deferred_releases.lock();
        let mut stack = guard.take_all();
        while let Some(mut node) = stack.pop_node() {
            if let Some(rec) = node.take()
                && let DepTarget::Local(task) = rec.target
            {
                let unresolved = task.release_unresolved();
                tracing::debug!(
                    task = task.id(),
                    unresolved,
                    "released deferred remote dependency"
                );
                if unresolved == 0 {
                    sched.enqueue_runnable(&task);
                } else if unresolved < 0 {
                    tracing::error!(
                        task = task.id(),
                        "task with remote dependency does not seem to have unresolved dependencies"
                    );
                }
            }
            self.pool.recycle(node);
        }
    }

    /// Per-phase resolver hook. Nothing to be done for now.
    pub(crate) fn end_phase(&self, _phase: u64) {}

    /// Recycle the whole region history. Runs after the root barrier drained
    /// the epoch.
    pub(crate) fn reset(&self) {
        self.table.lock().reset(&self.pool);
    }

    pub(crate) fn fini(&self) {
        self.reset();
        let unhandled = self.unhandled_remote.lock().take_all();
        self.pool.recycle_all(unhandled);
        let deferred = self.deferred_releases.lock().take_all();
        self.pool.recycle_all(deferred);
        self.pool.fini();
    }

    #[cfg(test)]
    pub(crate) fn dephash_records(&self) -> usize {
        self.table.lock().record_count()
    }

    #[cfg(test)]
    pub(crate) fn unhandled_remote_len(&self) -> usize {
        self.unhandled_remote.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn deferred_release_len(&self) -> usize {
        self.deferred_releases.lock().len()
    }
}
