use super::*;
use crate::config::Builder;
use crate::remote::{InboundSink, PhaseDep, RemoteToken};
use crate::task::RegionDep;
use crate::test_utils::{InboundMsg, Outbound, RecordingTransport, init_sched};
use crate::{DepKind, GlobalPtr, TaskDep, UnitId};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

assert_impl_all!(Scheduler: Send, Sync, InboundSink);
assert_impl_all!(SchedError: Send, Sync);

fn region(offset: u64) -> GlobalPtr {
    GlobalPtr::new(UnitId(0), offset)
}

#[test]
fn lifecycle_rejects_double_init_and_unmatched_fini() {
    let sched = init_sched(Builder::new().worker_threads(2));
    assert!(matches!(
        Builder::new().init(),
        Err(SchedError::AlreadyInitialized)
    ));
    assert_eq!(crate::num_threads(), 2);
    assert_eq!(crate::thread_num(), 0);

    assert!(crate::fini().is_ok());
    assert!(matches!(crate::fini(), Err(SchedError::NotInitialized)));
    assert_eq!(crate::num_threads(), 1);
    drop(sched);
}

#[test]
fn submitting_without_init_fails() {
    // No scheduler installed on this path; hold the lock via a throwaway
    // init to keep other tests out, then tear it down first.
    let sched = init_sched(Builder::new().worker_threads(1));
    assert!(crate::fini().is_ok());
    assert!(matches!(
        crate::create_task(|| {}, &[]),
        Err(SchedError::NotInitialized)
    ));
    assert!(matches!(crate::task_complete(), Err(SchedError::NotInitialized)));
    drop(sched);
}

#[test]
fn raw_chain_runs_readers_after_the_writer() -> Result<()> {
    let _sched = init_sched(Builder::new().worker_threads(2));
    let a = region(0x1000);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let l = log.clone();
    crate::create_task(
        move || {
            thread::sleep(Duration::from_millis(20));
            l.lock().push("w1");
        },
        &[TaskDep::Out(a)],
    )?;
    let l = log.clone();
    crate::create_task(move || l.lock().push("r2"), &[TaskDep::In(a)])?;
    let l = log.clone();
    crate::create_task(move || l.lock().push("r3"), &[TaskDep::In(a)])?;

    crate::task_complete()?;

    let log = log.lock();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], "w1");
    assert!(log.contains(&"r2"));
    assert!(log.contains(&"r3"));
    Ok(())
}

#[test]
fn waw_and_war_are_fully_ordered() -> Result<()> {
    let sched = init_sched(Builder::new().worker_threads(2));
    let a = region(0x2000);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let l = log.clone();
    crate::create_task(
        move || {
            thread::sleep(Duration::from_millis(10));
            l.lock().push("w1");
        },
        &[TaskDep::Out(a)],
    )?;
    let l = log.clone();
    crate::create_task(
        move || {
            thread::sleep(Duration::from_millis(5));
            l.lock().push("r");
        },
        &[TaskDep::In(a)],
    )?;
    let l = log.clone();
    crate::create_task(move || l.lock().push("w2"), &[TaskDep::Out(a)])?;

    crate::task_complete()?;

    assert_eq!(*log.lock(), vec!["w1", "r", "w2"]);
    // The root barrier rebuilt the region history.
    assert_eq!(sched.scheduler().resolver.dephash_records(), 0);
    Ok(())
}

#[rstest]
#[case::few(100)]
#[case::many(400)]
fn work_stealing_spreads_independent_tasks(#[case] n: usize) -> Result<()> {
    let _sched = init_sched(Builder::new().worker_threads(4));
    let total = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));

    for _ in 0..n {
        let total = total.clone();
        let seen = seen.clone();
        crate::create_task(
            move || {
                thread::sleep(Duration::from_millis(1));
                total.fetch_add(1, Ordering::Relaxed);
                seen.lock().insert(crate::thread_num());
            },
            &[],
        )?;
    }

    crate::task_complete()?;

    assert_eq!(total.load(Ordering::Relaxed), n);
    assert!(
        seen.lock().len() >= 2,
        "expected the load to spread across threads, got {:?}",
        seen.lock()
    );
    Ok(())
}

#[test]
fn direct_dependency_orders_across_phases() -> Result<()> {
    let _sched = init_sched(Builder::new().worker_threads(2));
    let done = Arc::new(AtomicBool::new(false));

    let d = done.clone();
    let handle = crate::create_task_handle(
        move || {
            thread::sleep(Duration::from_millis(10));
            d.store(true, Ordering::Release);
        },
        &[],
    )?;

    crate::phase()?;

    let d = done.clone();
    let saw_finished = Arc::new(AtomicBool::new(false));
    let s = saw_finished.clone();
    crate::create_task(
        move || s.store(d.load(Ordering::Acquire), Ordering::Release),
        &[TaskDep::direct(&handle)],
    )?;

    crate::task_complete()?;

    assert!(done.load(Ordering::Acquire));
    assert!(
        saw_finished.load(Ordering::Acquire),
        "dependent task started before its direct predecessor finished"
    );

    crate::task_wait(handle)?;
    Ok(())
}

#[test]
fn deferred_remote_release_waits_for_phase_admission() -> Result<()> {
    let transport = RecordingTransport::new();
    let sched = init_sched(
        Builder::new()
            .worker_threads(1)
            .unit(UnitId(0), 2)
            .transport(transport.clone()),
    );
    let scheduler = sched.scheduler();

    // Advance to phase 2 before submitting the reader.
    crate::phase()?;
    crate::phase()?;

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let remote_region = GlobalPtr::new(UnitId(1), 0x3000);
    let handle = crate::create_task_handle(
        move || r.store(true, Ordering::Release),
        &[TaskDep::In(remote_region)],
    )?;

    assert_eq!(handle.task.unresolved_deps(), 1);
    assert!(matches!(
        transport.outbound().first(),
        Some(Outbound::DataDep { dep, phase: 2, .. })
            if dep.kind == DepKind::In && dep.gptr == remote_region
    ));
    let reader = transport.datadep_readers().pop().expect("datadep sent");

    // The release arrives while phase_bound is still 0: it must park.
    scheduler.release_remote_dep(reader)?;
    assert!(!ran.load(Ordering::Acquire));
    assert_eq!(
        handle.task.unresolved_deps(),
        1,
        "deferred release must not decrement before the phase is admitted"
    );
    assert_eq!(scheduler.resolver.deferred_release_len(), 1);

    crate::task_complete()?;
    assert!(ran.load(Ordering::Acquire));

    crate::task_wait(handle)?;
    Ok(())
}

#[test]
fn inbound_remote_resolution_picks_fulfillment_and_direct_candidates() -> Result<()> {
    let transport = RecordingTransport::new();
    let sched = init_sched(
        Builder::new()
            .worker_threads(1)
            .unit(UnitId(0), 2)
            .transport(transport.clone()),
    );
    let scheduler = sched.scheduler();
    let a = region(0x4000);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let push = |tag: &'static str| {
        let order = order.clone();
        move || order.lock().push(tag)
    };

    let ha = crate::create_task_handle(push("a"), &[TaskDep::Out(a)])?;
    crate::phase()?;
    let hb = crate::create_task_handle(push("b"), &[TaskDep::Out(a)])?;
    crate::phase()?;
    let hc = crate::create_task_handle(push("c"), &[TaskDep::Out(a)])?;

    // Inbound remote IN for region a, phase 1, from unit 1.
    let rtoken = RemoteToken(99);
    transport.inject(InboundMsg::RemoteTask {
        dep: PhaseDep {
            dep: RegionDep::new(DepKind::In, a),
            phase: 1,
        },
        remote_task: rtoken,
        origin: UnitId(1),
    });
    scheduler.transport().progress(&*scheduler)?;
    assert_eq!(scheduler.resolver.unhandled_remote_len(), 1);

    scheduler.resolver.release_unhandled_remote(&scheduler)?;

    // Fulfillment: the closest writer before phase 1 is a (phase 0). Direct
    // dependency: the earliest writer at or past phase 1 is b, which must
    // now also wait for the remote reader.
    assert_eq!(ha.task.remote_successor_count(), 1);
    assert_eq!(hb.task.remote_successor_count(), 0);
    assert_eq!(hc.task.remote_successor_count(), 0);
    assert_eq!(hb.task.unresolved_deps(), 2);
    assert_eq!(hc.task.unresolved_deps(), 1);

    let directs = transport.direct_taskdeps();
    assert_eq!(directs.len(), 1);
    let (target, remote_task, waiter) = directs[0];
    assert_eq!(target, UnitId(1));
    assert_eq!(remote_task, rtoken);

    // The remote reader finishes; its release unblocks b at the barrier.
    transport.inject(InboundMsg::Release { local_task: waiter });
    crate::task_complete()?;

    assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    // a's fulfillment record was released back to the origin when it ran.
    assert!(transport.releases().contains(&(UnitId(1), rtoken)));

    crate::task_wait(ha)?;
    crate::task_wait(hb)?;
    crate::task_wait(hc)?;
    Ok(())
}

#[test]
fn remote_direct_dependencies_stage_or_release_immediately() -> Result<()> {
    let transport = RecordingTransport::new();
    let sched = init_sched(
        Builder::new()
            .worker_threads(1)
            .unit(UnitId(0), 2)
            .transport(transport.clone()),
    );
    let scheduler = sched.scheduler();

    let handle = crate::create_task_handle(
        || {},
        &[TaskDep::In(GlobalPtr::new(UnitId(1), 0x5000))],
    )?;
    let reader = transport.datadep_readers().pop().expect("datadep sent");

    // A live local task stages the remote successor for release-on-finish.
    transport.inject(InboundMsg::RemoteDirect {
        local_task: reader,
        remote_task: RemoteToken(77),
        origin: UnitId(1),
    });
    scheduler.transport().progress(&*scheduler)?;
    assert_eq!(handle.task.remote_successor_count(), 1);

    // An unknown token means the local task is long gone: release at once.
    scheduler.handle_remote_direct(RemoteToken(424242), RemoteToken(78), UnitId(1))?;
    assert!(transport.outbound().iter().any(|m| matches!(
        m,
        Outbound::Release {
            task: RemoteToken(78),
            kind: DepKind::Direct,
            ..
        }
    )));

    // Producer delivers; the task runs and releases its staged successor.
    scheduler.release_remote_dep(reader)?;
    crate::task_complete()?;
    assert!(transport.releases().contains(&(UnitId(1), RemoteToken(77))));

    crate::task_wait(handle)?;
    Ok(())
}

#[test]
fn inbound_remote_requests_must_be_in_typed() -> Result<()> {
    let sched = init_sched(Builder::new().worker_threads(1).unit(UnitId(0), 2));
    let scheduler = sched.scheduler();

    let res = scheduler.handle_remote_task(
        &PhaseDep {
            dep: RegionDep::new(DepKind::Out, region(0x6000)),
            phase: 0,
        },
        RemoteToken(1),
        UnitId(1),
    );
    assert!(matches!(res, Err(SchedError::UnsupportedRemoteDep)));
    assert_eq!(scheduler.resolver.unhandled_remote_len(), 0);
    Ok(())
}

#[test]
fn nested_tasks_drop_remote_dependencies_with_a_warning() -> Result<()> {
    let transport = RecordingTransport::new();
    let _sched = init_sched(
        Builder::new()
            .worker_threads(1)
            .unit(UnitId(0), 2)
            .transport(transport.clone()),
    );

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    crate::create_task(
        move || {
            crate::create_task(
                move || r.store(true, Ordering::Release),
                &[TaskDep::In(GlobalPtr::new(UnitId(1), 0x7000))],
            )
            .unwrap();
        },
        &[],
    )?;

    crate::task_complete()?;

    // The nested task ran without ever contacting the transport.
    assert!(ran.load(Ordering::Acquire));
    assert!(transport.datadep_readers().is_empty());
    Ok(())
}

#[test]
fn repeated_empty_phases_leave_no_residue() -> Result<()> {
    let sched = init_sched(Builder::new().worker_threads(1));
    let scheduler = sched.scheduler();

    for _ in 0..3 {
        crate::phase()?;
        crate::task_complete()?;
    }

    assert_eq!(scheduler.root.phase(), 3);
    assert_eq!(scheduler.phase_bound(), 3);
    assert_eq!(scheduler.resolver.dephash_records(), 0);
    assert_eq!(scheduler.resolver.unhandled_remote_len(), 0);
    assert_eq!(scheduler.resolver.deferred_release_len(), 0);
    Ok(())
}

#[test]
fn finished_records_recycle_and_get_reused() -> Result<()> {
    let sched = init_sched(Builder::new().worker_threads(1));
    let scheduler = sched.scheduler();

    crate::create_task(|| {}, &[])?;
    assert_eq!(scheduler.tasks.free_len(), 0);

    crate::task_complete()?;
    assert_eq!(scheduler.tasks.recycle_len(), 0);
    assert_eq!(scheduler.tasks.free_len(), 1);

    // The next submission reuses the promoted record.
    crate::create_task(|| {}, &[])?;
    assert_eq!(scheduler.tasks.free_len(), 0);

    crate::task_complete()?;
    assert_eq!(scheduler.tasks.free_len(), 1);
    Ok(())
}

#[test]
fn task_wait_contributes_and_destroys_the_record() -> Result<()> {
    let sched = init_sched(Builder::new().worker_threads(1));
    let scheduler = sched.scheduler();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let handle = crate::create_task_handle(move || r.store(true, Ordering::Release), &[])?;

    // The waiting thread runs the task itself; no barrier involved.
    crate::task_wait(handle)?;
    assert!(ran.load(Ordering::Acquire));
    assert_eq!(scheduler.tasks.recycle_len(), 1);

    crate::task_complete()?;
    Ok(())
}
