use crate::config::Builder;
use crate::runtime::{self, Scheduler};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

// Exports
pub(crate) mod mocks;
pub(crate) use mocks::{InboundMsg, Outbound, RecordingTransport};

// The scheduler is process-wide; tests touching it must not overlap.
static SCHED_LOCK: Mutex<()> = Mutex::new(());

/// Installed scheduler for the duration of one test. Dropping it tears the
/// scheduler down and lets the next test proceed.
pub(crate) struct TestSched {
    _guard: MutexGuard<'static, ()>,
}

#[must_use]
pub(crate) fn init_sched(builder: Builder) -> TestSched {
    let guard = SCHED_LOCK.lock();
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    builder.init().expect("failed to initialize scheduler");
    TestSched { _guard: guard }
}

impl TestSched {
    pub(crate) fn scheduler(&self) -> Arc<Scheduler> {
        runtime::instance().expect("scheduler not installed")
    }
}

impl Drop for TestSched {
    fn drop(&mut self) {
        let _ = crate::fini();
    }
}
