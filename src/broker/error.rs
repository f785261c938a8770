use thiserror::Error;

/// Broker-level failures, one variant per RPC status kind surfaced to
/// callers. Clone-able so one start outcome can be delivered to every
/// concurrent waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    /// Canonical status name used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BrokerError::NotFound(_) => "NOT_FOUND",
            BrokerError::AlreadyExists(_) => "ALREADY_EXISTS",
            BrokerError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            BrokerError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            BrokerError::Aborted(_) => "ABORTED",
            BrokerError::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
