use std::time::Duration;

use courier_core::CorrelationId;
use courier_messaging::{BrokerError, EncodeError, WorkerFailure};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No response within the deadline. The job may still complete on the worker;
    /// callers must treat the outcome as unknown, not as failed.
    #[error("no response for {correlation_id} within {waited:?}; outcome unknown")]
    TimedOut {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    /// The worker ran the job and reported a failure.
    #[error("worker reported failure: {0}")]
    Worker(#[from] WorkerFailure),

    /// A correlation id was registered twice (id generation is broken).
    #[error("correlation id already in flight: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// The job could not be published; nothing was sent.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A background loop thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker succeeded but its result did not have the expected shape.
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }
}
