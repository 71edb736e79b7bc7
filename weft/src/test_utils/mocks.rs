use crate::gptr::UnitId;
use crate::remote::{InboundSink, PhaseDep, RemoteToken, Transport};
use crate::task::{DepKind, RegionDep};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outbound traffic as observed by tests.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    DataDep {
        dep: RegionDep,
        phase: u64,
        reader: RemoteToken,
    },
    DirectTaskDep {
        target: UnitId,
        remote_task: RemoteToken,
        local_waiter: RemoteToken,
    },
    Release {
        origin: UnitId,
        task: RemoteToken,
        kind: DepKind,
    },
}

/// Inbound messages tests inject; delivered on the next progress call.
#[derive(Debug, Clone)]
pub(crate) enum InboundMsg {
    RemoteTask {
        dep: PhaseDep,
        remote_task: RemoteToken,
        origin: UnitId,
    },
    RemoteDirect {
        local_task: RemoteToken,
        remote_task: RemoteToken,
        origin: UnitId,
    },
    Release {
        local_task: RemoteToken,
    },
}

/// Transport double: records every outbound message and replays injected
/// inbound ones through the sink when progressed.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    outbound: Mutex<Vec<Outbound>>,
    inbound: Mutex<VecDeque<InboundMsg>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn inject(&self, msg: InboundMsg) {
        self.inbound.lock().push_back(msg);
    }

    pub(crate) fn outbound(&self) -> Vec<Outbound> {
        self.outbound.lock().clone()
    }

    pub(crate) fn datadep_readers(&self) -> Vec<RemoteToken> {
        self.outbound()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::DataDep { reader, .. } => Some(reader),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn direct_taskdeps(&self) -> Vec<(UnitId, RemoteToken, RemoteToken)> {
        self.outbound()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::DirectTaskDep {
                    target,
                    remote_task,
                    local_waiter,
                } => Some((target, remote_task, local_waiter)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn releases(&self) -> Vec<(UnitId, RemoteToken)> {
        self.outbound()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Release { origin, task, .. } => Some((origin, task)),
                _ => None,
            })
            .collect()
    }

    fn drain(&self, sink: &dyn InboundSink) -> Result<()> {
        loop {
            let msg = self.inbound.lock().pop_front();
            let Some(msg) = msg else { break };
            match msg {
                InboundMsg::RemoteTask {
                    dep,
                    remote_task,
                    origin,
                } => sink.handle_remote_task(&dep, remote_task, origin)?,
                InboundMsg::RemoteDirect {
                    local_task,
                    remote_task,
                    origin,
                } => sink.handle_remote_direct(local_task, remote_task, origin)?,
                InboundMsg::Release { local_task } => sink.release_remote_dep(local_task)?,
            }
        }
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn progress(&self, sink: &dyn InboundSink) -> Result<()> {
        self.drain(sink)
    }

    fn progress_blocking(&self, sink: &dyn InboundSink) -> Result<()> {
        self.drain(sink)
    }

    fn datadep(&self, dep: &RegionDep, phase: u64, reader: RemoteToken) -> Result<()> {
        self.outbound.lock().push(Outbound::DataDep {
            dep: *dep,
            phase,
            reader,
        });
        Ok(())
    }

    fn direct_taskdep(
        &self,
        target: UnitId,
        remote_task: RemoteToken,
        local_waiter: RemoteToken,
    ) -> Result<()> {
        self.outbound.lock().push(Outbound::DirectTaskDep {
            target,
            remote_task,
            local_waiter,
        });
        Ok(())
    }

    fn release(&self, origin: UnitId, task: RemoteToken, dep: &RegionDep) -> Result<()> {
        self.outbound.lock().push(Outbound::Release {
            origin,
            task,
            kind: dep.kind,
        });
        Ok(())
    }
}
