use std::io;

use thiserror::Error;

use crate::event::{EventType, SocketHandle};

/// Errors returned by the sockmux event manager.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, poll engine, or thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The wake-up write on the control channel failed; the request was withdrawn.
    #[error("control channel write failed: {0}")]
    ChannelWrite(#[source] io::Error),
    /// The operation cannot be performed from the dispatcher thread.
    #[error("operation not permitted on the dispatcher thread")]
    DispatcherThread,
    /// The manager is not enabled (no dispatcher to answer the request).
    #[error("event manager is not enabled")]
    NotEnabled,
    /// The event cannot be combined with an event already registered on the socket.
    #[error("{event:?} conflicts with an event already registered on socket {handle}")]
    IncompatibleEvent {
        handle: SocketHandle,
        event: EventType,
    },
    /// Negative or otherwise unusable socket handle.
    #[error("invalid socket handle {0}")]
    InvalidSocket(SocketHandle),
    /// The poll engine cannot track another socket.
    #[error("socket capacity reached")]
    SocketCapacity,
    /// The timer handle does not refer to a pending timer.
    #[error("unknown or expired timer")]
    UnknownTimer,
    /// The dispatcher stopped before answering a synchronous request.
    #[error("request dropped before the dispatcher answered")]
    RequestDropped,
}
