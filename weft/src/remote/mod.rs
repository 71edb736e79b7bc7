//! The seam between the scheduler core and the active-message transport.
//!
//! The core is transport-agnostic: outbound traffic goes through the
//! [`Transport`] trait, inbound messages are delivered by calling back into an
//! [`InboundSink`] (implemented by the scheduler) from the transport's
//! progress functions. Remote releases are fire-and-forget; at-least-once
//! delivery is the transport's responsibility.

use crate::error::SchedError;
use crate::gptr::UnitId;
use crate::task::RegionDep;
use anyhow::Result;
use std::fmt;

/// Opaque identity of a task as carried in remote messages. Tokens are minted
/// by the participant that owns the task and are only ever interpreted there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteToken(pub u64);

impl fmt::Display for RemoteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtask({})", self.0)
    }
}

/// A remote dependency request: the declared dep plus the phase of the
/// requesting task on its participant.
#[derive(Debug, Clone, Copy)]
pub struct PhaseDep {
    pub dep: RegionDep,
    pub phase: u64,
}

/// Inbound callbacks the transport invokes while progressing. Implemented by
/// the scheduler.
pub trait InboundSink: Send + Sync {
    /// A remote task wants to read a region we own. Must be IN-typed;
    /// resolution is deferred to the next phase boundary.
    fn handle_remote_task(
        &self,
        dep: &PhaseDep,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<(), SchedError>;

    /// A participant tells us that its task `remote_task` must be released
    /// when our task `local_task` finishes.
    fn handle_remote_direct(
        &self,
        local_task: RemoteToken,
        remote_task: RemoteToken,
        origin: UnitId,
    ) -> Result<(), SchedError>;

    /// A remote producer has delivered the data our task `local_task` was
    /// waiting for.
    fn release_remote_dep(&self, local_task: RemoteToken) -> Result<(), SchedError>;
}

/// Outbound operations and message-pump hooks of the active-message layer.
pub trait Transport: Send + Sync + 'static {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn fini(&self) -> Result<()> {
        Ok(())
    }

    /// Serve any pending inbound messages without blocking.
    fn progress(&self, sink: &dyn InboundSink) -> Result<()>;

    /// Drain inbound messages until the transport is quiescent.
    fn progress_blocking(&self, sink: &dyn InboundSink) -> Result<()>;

    /// Announce to the owner of `dep.gptr` that our task `reader` depends on
    /// that region in `phase`.
    fn datadep(&self, dep: &RegionDep, phase: u64, reader: RemoteToken) -> Result<()>;

    /// Tell `target` that its task `remote_task` must block until our task
    /// `local_waiter` is released by it.
    fn direct_taskdep(
        &self,
        target: UnitId,
        remote_task: RemoteToken,
        local_waiter: RemoteToken,
    ) -> Result<()>;

    /// Release `task` on `origin`: the dependency `dep` it declared against
    /// us is satisfied.
    fn release(&self, origin: UnitId, task: RemoteToken, dep: &RegionDep) -> Result<()>;
}

/// Transport for single-participant jobs: nothing to progress, and outbound
/// traffic indicates a configuration problem.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn progress(&self, _sink: &dyn InboundSink) -> Result<()> {
        Ok(())
    }

    fn progress_blocking(&self, _sink: &dyn InboundSink) -> Result<()> {
        Ok(())
    }

    fn datadep(&self, dep: &RegionDep, phase: u64, reader: RemoteToken) -> Result<()> {
        tracing::warn!(
            "dropping remote datadep on {} (phase {phase}, reader {reader}): no transport configured",
            dep.gptr
        );
        Ok(())
    }

    fn direct_taskdep(
        &self,
        target: UnitId,
        remote_task: RemoteToken,
        _local_waiter: RemoteToken,
    ) -> Result<()> {
        tracing::warn!("dropping direct taskdep for {remote_task} at {target}: no transport configured");
        Ok(())
    }

    fn release(&self, origin: UnitId, task: RemoteToken, _dep: &RegionDep) -> Result<()> {
        tracing::warn!("dropping release for {task} at {origin}: no transport configured");
        Ok(())
    }
}
