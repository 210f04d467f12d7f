use std::io;

use thiserror::Error;

/// Errors that can occur while constructing a [`Server`](crate::server::Server).
///
/// A construction error is always synchronous: it is returned directly from
/// `Server::new`/`ServerBuilder::build` and any reactors already spawned
/// during the failed construction are stopped before the error is returned.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create reactor: {0}")]
    Reactor(#[source] io::Error),

    #[error("failed to set socket option: {0}")]
    SocketOption(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Returned by [`Connection::send`](crate::connection::Connection::send) and
/// [`Connection::close`](crate::connection::Connection::close) when the
/// connection is no longer open.
///
/// This is a sentinel, not a fatal condition: callers racing a close from
/// another thread are expected to see this and drop the outbound bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection is closed")]
pub struct SendError;

/// An error internal to a single reactor iteration; never escapes to a user.
///
/// Every connection-scoped variant results in that one connection being
/// closed. [`FatalReactorError`] is escalated to abort the process because
/// continuing to drive a poisoned readiness facility risks silently dropping
/// events for every other connection sharing the reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("connection terminated: {0}")]
    ConnectionClosed(#[source] io::Error),

    #[error("user callback panicked")]
    CallbackPanic,

    #[error("fatal reactor error: {0}")]
    Fatal(#[from] FatalReactorError),
}

/// An unrecoverable error in the readiness facility itself.
///
/// Once this occurs the reactor's view of kernel-reported readiness can no
/// longer be trusted, so the process aborts rather than limping along.
#[derive(Debug, Error)]
pub enum FatalReactorError {
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register wakeup handle: {0}")]
    Wake(#[source] io::Error),

    #[error("failed to close reactor: {0}")]
    Close(#[source] io::Error),
}
