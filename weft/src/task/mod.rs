//! Task records and user-facing dependency declarations.

use crate::deps::hash::DepStack;
use crate::gptr::GlobalPtr;
use crate::task::list::TaskList;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

pub(crate) mod list;
pub(crate) mod pool;
pub(crate) mod queue;

pub type TaskRef = Arc<Task>;

pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Task lifecycle. Transitions are monotone:
/// `Created -> Running -> Teardown -> Finished -> Destroyed`.
/// `Root` is the stable state of the per-process sentinel task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Teardown,
    Finished,
    Destroyed,
    Root,
}

impl TaskState {
    /// Active tasks may still pick up successors; finished or recycled ones
    /// may not.
    pub(crate) fn is_active(self) -> bool {
        matches!(self, TaskState::Created | TaskState::Running)
    }
}

/// The unit of work. One record per in-flight task; finished records are
/// recycled through the scheduler's task pool and reused by later
/// submissions.
pub struct Task {
    /// Monotone per-activation id, for diagnostics only.
    id: AtomicU64,

    /// The work itself, taken exactly once by the executor.
    fun: Mutex<Option<TaskFn>>,

    /// Children still in flight; the parent's implicit barrier drains this
    /// to zero.
    num_children: AtomicI32,

    /// Predecessors not yet finished. The task is runnable iff zero; a
    /// negative observation is a defect.
    unresolved_deps: AtomicI32,

    /// Logical epoch, inherited from the parent at creation. Only the root's
    /// is ever advanced.
    phase: AtomicU64,

    /// State and successor lists, guarded by the per-task mutex.
    pub(crate) inner: Mutex<TaskInner>,
}

pub(crate) struct TaskInner {
    pub(crate) state: TaskState,
    pub(crate) parent: Option<TaskRef>,
    /// Local tasks to release when this one finishes.
    pub(crate) successors: TaskList,
    /// Remote dependency records to release when this one finishes.
    pub(crate) remote_successors: DepStack,
    /// A user handle exists; destruction is deferred to an explicit wait.
    pub(crate) has_ref: bool,
}

impl Task {
    /// The sentinel representing the main execution context. Parent of all
    /// top-level tasks; never runs, never finishes.
    pub(crate) fn new_root() -> TaskRef {
        Arc::new(Self {
            id: AtomicU64::new(0),
            fun: Mutex::new(None),
            num_children: AtomicI32::new(0),
            unresolved_deps: AtomicI32::new(0),
            phase: AtomicU64::new(0),
            inner: Mutex::new(TaskInner {
                state: TaskState::Root,
                parent: None,
                successors: TaskList::new(),
                remote_successors: DepStack::new(),
                has_ref: false,
            }),
        })
    }

    /// A blank record, ready for [`Task::activate`].
    pub(crate) fn blank() -> TaskRef {
        Arc::new(Self {
            id: AtomicU64::new(0),
            fun: Mutex::new(None),
            num_children: AtomicI32::new(0),
            unresolved_deps: AtomicI32::new(0),
            phase: AtomicU64::new(0),
            inner: Mutex::new(TaskInner {
                state: TaskState::Destroyed,
                parent: None,
                successors: TaskList::new(),
                remote_successors: DepStack::new(),
                has_ref: false,
            }),
        })
    }

    /// (Re)initialize a record popped from the free list or freshly
    /// allocated. The record must be quiescent: no queue, hash table or
    /// successor list holds it.
    pub(crate) fn activate(
        &self,
        id: u64,
        fun: TaskFn,
        parent: TaskRef,
        phase: u64,
        has_ref: bool,
    ) {
        self.id.store(id, Ordering::Relaxed);
        *self.fun.lock() = Some(fun);
        self.num_children.store(0, Ordering::Relaxed);
        self.unresolved_deps.store(0, Ordering::Relaxed);
        self.phase.store(phase, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.state = TaskState::Created;
        inner.parent = Some(parent);
        inner.has_ref = has_ref;
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::Relaxed)
    }

    /// Advance the root's phase counter. Master thread only.
    pub(crate) fn bump_phase(&self) -> u64 {
        self.phase.fetch_add(1, Ordering::Release) + 1
    }

    pub(crate) fn take_fun(&self) -> Option<TaskFn> {
        self.fun.lock().take()
    }

    pub fn num_children(&self) -> i32 {
        self.num_children.load(Ordering::Acquire)
    }

    pub(crate) fn inc_children(&self) -> i32 {
        self.num_children.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_children(&self) -> i32 {
        self.num_children.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn unresolved_deps(&self) -> i32 {
        self.unresolved_deps.load(Ordering::Acquire)
    }

    pub(crate) fn add_unresolved(&self) -> i32 {
        self.unresolved_deps.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one predecessor. The release ordering publishes the successor
    /// list mutations of the finishing task before the decrement that may
    /// make this task runnable.
    pub(crate) fn release_unresolved(&self) -> i32 {
        self.unresolved_deps.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().state == TaskState::Finished
    }

    #[cfg(test)]
    pub(crate) fn remote_successor_count(&self) -> usize {
        self.inner.lock().remote_successors.len()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("phase", &self.phase())
            .field("num_children", &self.num_children())
            .field("unresolved_deps", &self.unresolved_deps())
            .finish()
    }
}

/// Kind of a declared dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    In,
    Out,
    InOut,
    Direct,
    Ignore,
}

impl DepKind {
    /// OUT-like dependencies are writes: OUT or INOUT.
    pub fn is_out_like(self) -> bool {
        matches!(self, DepKind::Out | DepKind::InOut)
    }
}

/// A region dependency as carried in records and remote messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDep {
    pub kind: DepKind,
    pub gptr: GlobalPtr,
}

impl RegionDep {
    pub fn new(kind: DepKind, gptr: GlobalPtr) -> Self {
        Self { kind, gptr }
    }

    /// The dummy record dep used for direct task-to-task ordering.
    pub(crate) fn direct(unit: crate::gptr::UnitId) -> Self {
        Self {
            kind: DepKind::Direct,
            gptr: GlobalPtr::null(unit),
        }
    }
}

/// A dependency declared at task submission.
#[derive(Clone)]
pub enum TaskDep {
    /// Read of a region: runs after the latest preceding write.
    In(GlobalPtr),
    /// Write of a region: runs after all preceding readers and the latest
    /// preceding write.
    Out(GlobalPtr),
    /// Read-write of a region; ordered like a write.
    InOut(GlobalPtr),
    /// Explicit task-to-task ordering, independent of any region.
    Direct(TaskRef),
    /// Skipped entirely.
    Ignore,
}

impl TaskDep {
    /// Direct dependency on a task the caller holds a handle for.
    pub fn direct(handle: &TaskHandle) -> Self {
        TaskDep::Direct(handle.task.clone())
    }

    pub fn kind(&self) -> DepKind {
        match self {
            TaskDep::In(_) => DepKind::In,
            TaskDep::Out(_) => DepKind::Out,
            TaskDep::InOut(_) => DepKind::InOut,
            TaskDep::Direct(_) => DepKind::Direct,
            TaskDep::Ignore => DepKind::Ignore,
        }
    }

    pub(crate) fn gptr(&self) -> Option<GlobalPtr> {
        match self {
            TaskDep::In(g) | TaskDep::Out(g) | TaskDep::InOut(g) => Some(*g),
            _ => None,
        }
    }
}

impl fmt::Debug for TaskDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskDep::Direct(task) => write!(f, "Direct(task {})", task.id()),
            other => match other.gptr() {
                Some(g) => write!(f, "{:?}({g})", other.kind()),
                None => write!(f, "{:?}", other.kind()),
            },
        }
    }
}

/// User handle to a submitted task. Holding one defers record destruction to
/// an explicit [`task_wait`](crate::task_wait), which consumes the handle.
pub struct TaskHandle {
    pub(crate) task: TaskRef,
}

impl TaskHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.task).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptr::UnitId;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(TaskHandle: Send);

    #[test]
    fn state_machine_observable_through_activation() {
        let task = Task::blank();
        assert_eq!(task.state(), TaskState::Destroyed);

        let root = Task::new_root();
        task.activate(1, Box::new(|| {}), root.clone(), 3, false);
        assert_eq!(task.state(), TaskState::Created);
        assert_eq!(task.phase(), 3);
        assert_eq!(task.unresolved_deps(), 0);
        assert!(task.take_fun().is_some());
        assert!(task.take_fun().is_none());
    }

    #[test]
    fn out_like_kinds() {
        assert!(DepKind::Out.is_out_like());
        assert!(DepKind::InOut.is_out_like());
        assert!(!DepKind::In.is_out_like());
        assert!(!DepKind::Direct.is_out_like());
        assert!(!DepKind::Ignore.is_out_like());
    }

    #[test]
    fn counters_round_trip() {
        let task = Task::blank();
        assert_eq!(task.add_unresolved(), 1);
        assert_eq!(task.add_unresolved(), 2);
        assert_eq!(task.release_unresolved(), 1);
        assert_eq!(task.release_unresolved(), 0);

        assert_eq!(task.inc_children(), 1);
        assert_eq!(task.dec_children(), 0);
    }

    #[test]
    fn direct_record_dep_is_null_region() {
        let dep = RegionDep::direct(UnitId(4));
        assert_eq!(dep.kind, DepKind::Direct);
        assert_eq!(dep.gptr.unit, UnitId(4));
        assert_eq!(dep.gptr.offset, 0);
    }
}
