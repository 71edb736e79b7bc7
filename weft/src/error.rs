/// A centralized error type for all scheduler operations.
///
/// Every usage error surfaced at the core boundary maps onto one of the
/// invalid-usage variants; transport failures are passed through untouched.
#[derive(thiserror::Error, Debug)]
pub enum SchedError {
    #[error("tasking subsystem can only be initialized once")]
    AlreadyInitialized,

    #[error("tasking subsystem has not been initialized")]
    NotInitialized,

    #[error("operation is only valid on the master thread")]
    NotMasterThread,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inbound remote dependency requests must be IN-typed.
    #[error("remote dependencies with type other than IN are not supported")]
    UnsupportedRemoteDep,

    /// A failure reported by the remote transport. The scheduler does not
    /// retry; at-least-once delivery is the transport's responsibility.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

pub type Result<T, E = SchedError> = std::result::Result<T, E>;

impl PartialEq for SchedError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AlreadyInitialized, Self::AlreadyInitialized)
            | (Self::NotInitialized, Self::NotInitialized)
            | (Self::NotMasterThread, Self::NotMasterThread)
            | (Self::UnsupportedRemoteDep, Self::UnsupportedRemoteDep) => true,
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            _ => false,
        }
    }
}
