//! Library error types.

use palaverproto::WireError;

/// Failures surfaced to a dispatching client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Every transmission attempt expired without a matching reply.
    #[error("request timed out")]
    Timeout,

    /// The coordinator was closed; the dispatch will never be sent.
    #[error("client is closed")]
    Closed,

    /// The server answered with an ERR reply.
    #[error("task failed: {0}")]
    Task(WireError),

    /// The transport rejected the request outright.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// The wire error of an ERR reply, if that is what this is.
    pub fn as_wire(&self) -> Option<&WireError> {
        match self {
            Self::Task(err) => Some(err),
            _ => None,
        }
    }
}

/// Failures surfaced by the concurrency pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Both the in-flight set and the queue are at capacity.
    #[error("request queue is full")]
    QueueFull,
}
