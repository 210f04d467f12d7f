//! The application-facing callback contract.

use std::any::Any;

use crate::connection::Connection;

/// The three events a connection's owning reactor delivers to user code.
///
/// All three callbacks run on the worker thread that owns the connection
/// and must not block: `on_connect` always precedes any `on_message`,
/// which always precedes `on_close`, and at most one of these three runs
/// at a time for a given connection.
pub trait Handler: Send + Sync + 'static {
    /// Called once, before the connection's fd is ever polled for read
    /// readiness. Closing the connection from within this callback is
    /// valid and causes the connection to be torn down before any byte is
    /// ever read from it.
    fn on_connect(&self, conn: &Connection);

    /// Called once per frame decoded by the connection's
    /// [`Protocol`](crate::protocol::Protocol). `ctx` is whatever framing
    /// metadata the protocol attached to this frame (`None` for the
    /// pass-through default). Returning `Some(bytes)` enqueues `bytes` for
    /// send on this same connection.
    #[allow(unused_variables)]
    fn on_message(
        &self,
        conn: &Connection,
        ctx: Option<Box<dyn Any + Send>>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }

    /// Called once, immediately before the connection's fd is closed.
    #[allow(unused_variables)]
    fn on_close(&self, conn: &Connection) {}
}
