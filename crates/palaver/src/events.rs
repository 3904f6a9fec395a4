//! Observable event streams for clients and servers.
//!
//! Both endpoints publish on a `tokio::sync::broadcast` channel: lossy for
//! a subscriber that falls behind, which is the right trade for an
//! observability surface. Subscribe before triggering the behavior you
//! want to observe.

use serde_json::Value;

use palaverproto::{Push, Reply, Request};

use crate::server::ConnectionId;

/// Lifecycle and traffic events observable on a [`crate::Client`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// First successful connection.
    Ready,
    /// A voluntary transport rotation (drain) has begun.
    Reconnecting,
    /// A reconnect attempt failed; another follows after the backoff.
    ReconnectFailed,
    /// A connection was re-established after loss or rotation.
    Reconnected,
    /// The host closed the transport (abnormally or for shutdown).
    HostClosed,
    /// Transport-level error.
    Error(String),
    /// A request was accepted for dispatch.
    Request { id: String, task: String },
    /// A request exhausted its attempts.
    Timeout { id: String },
    /// A ping exceeded its caller-supplied deadline.
    PingTimeout,
    /// Server-originated push.
    Push { event: String, payload: Value },
}

/// Something the server wanted to send on a connection that is gone.
#[derive(Debug, Clone)]
pub enum StaleOutbound {
    Reply(Reply),
    Push(Push),
}

/// Events observable on a [`crate::ServerHandle`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A transport finished its handshake.
    Connection(ConnectionId),
    /// A transport closed and was purged from the registry.
    Terminated(ConnectionId),
    /// A decoded inbound request.
    Request(Request),
    /// A reply produced by the dispatch chain.
    Reply(Reply),
    /// A reply or push dropped because its connection was no longer open.
    Stale(StaleOutbound),
    /// Codec, I/O or healthcheck failure.
    Error(String),
}
