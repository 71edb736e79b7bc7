//! Scheduler configuration.
//!
//! A [`Builder`] collects overrides and is consumed by [`Builder::init`],
//! which validates it into a [`Config`] and installs the process-wide
//! scheduler.

use crate::error::{Result, SchedError};
use crate::gptr::UnitId;
use crate::hwinfo::HwInfo;
use crate::remote::{NoopTransport, Transport};
use std::fmt;
use std::sync::Arc;

const DEFAULT_THREAD_NAME: &str = "weft-worker";

pub struct Builder {
    /// Number of worker threads, master included.
    ///
    /// Defaults to one worker per hardware thread.
    worker_threads: Option<usize>,

    /// This participant's identity in the distributed job.
    unit_id: UnitId,
    num_units: usize,

    /// Name prefix for threads spawned by the scheduler.
    thread_name: String,

    /// Active-message transport for remote dependencies.
    transport: Option<Arc<dyn Transport>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            unit_id: UnitId::default(),
            num_units: 1,
            thread_name: DEFAULT_THREAD_NAME.into(),
            transport: None,
        }
    }

    /// Sets the number of worker threads, master included.
    ///
    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets this participant's id and the total number of participants.
    pub fn unit(mut self, unit_id: UnitId, num_units: usize) -> Self {
        self.unit_id = unit_id;
        self.num_units = num_units;
        self
    }

    /// Sets the name prefix of threads spawned by the scheduler. Workers are
    /// named `{prefix}-{thread_num}`.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Sets the remote transport. Defaults to [`NoopTransport`] for
    /// single-participant jobs.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validate the configuration and install the process-wide scheduler.
    pub fn init(self) -> Result<()> {
        crate::runtime::install(self.try_into()?)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Config {
    pub(crate) worker_threads: usize,
    pub(crate) unit_id: UnitId,
    pub(crate) num_units: usize,
    pub(crate) thread_name: String,
    pub(crate) transport: Arc<dyn Transport>,
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.num_units == 0 {
            return Err(SchedError::InvalidConfig(
                "num_units must be greater than 0".into(),
            ));
        }
        if self.unit_id.0 as usize >= self.num_units {
            return Err(SchedError::InvalidConfig(format!(
                "{} is out of range for a job of {} units",
                self.unit_id, self.num_units
            )));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for Config {
    type Error = SchedError;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = builder
            .worker_threads
            .unwrap_or_else(|| HwInfo::detect().default_worker_threads());

        let cfg = Config {
            worker_threads,
            unit_id: builder.unit_id,
            num_units: builder.num_units,
            thread_name: builder.thread_name,
            transport: builder
                .transport
                .unwrap_or_else(|| Arc::new(NoopTransport)),
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("worker_threads", &self.worker_threads)
            .field("unit_id", &self.unit_id)
            .field("num_units", &self.num_units)
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let cfg: Config = Builder::new().try_into().unwrap();
        assert!(cfg.worker_threads >= 1);
        assert_eq!(cfg.unit_id, UnitId(0));
        assert_eq!(cfg.num_units, 1);
    }

    #[test]
    fn unit_out_of_range_is_rejected() {
        let res: Result<Config> = Builder::new().unit(UnitId(3), 2).try_into();
        assert!(matches!(res, Err(SchedError::InvalidConfig(_))));
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
