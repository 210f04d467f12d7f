//! The framing boundary between raw bytes and application messages.

use std::any::Any;

use crate::connection::Connection;
use crate::ring::RingBuffer;

#[cfg(feature = "websocket")]
pub mod websocket;

/// Translates between the raw byte stream of a [`Connection`] and the
/// application messages delivered to [`Handler::on_message`].
///
/// [`Handler::on_message`]: crate::handler::Handler::on_message
pub trait Protocol: Send + Sync + 'static {
    /// Attempts to decode one frame out of `buf`.
    ///
    /// `buf` is positioned so that `un_packet` may freely call
    /// `virtual_read`/`virtual_revert` to retry on a split header without
    /// losing already-read bytes, and must call `virtual_flush` once it has
    /// fully consumed a frame.
    ///
    /// `user_buf` is the reactor's one reusable per-loop scratch buffer:
    /// an implementation that has a frame ready clears it, writes the
    /// frame's payload into it (growing its capacity only on demand, never
    /// allocating fresh), and returns `true`. Returning `false` means "not
    /// enough bytes yet"; the connection will call again once more bytes
    /// have arrived, without discarding any unconsumed data, and `user_buf`
    /// is left untouched.
    fn un_packet(
        &self,
        conn: &Connection,
        buf: &mut RingBuffer,
        user_buf: &mut Vec<u8>,
    ) -> (Option<Box<dyn Any + Send>>, bool);

    /// Encodes an outbound application message into wire bytes.
    fn packet(&self, conn: &Connection, msg: &[u8]) -> Vec<u8> {
        let _ = conn;
        msg.to_vec()
    }
}

/// The default protocol: every call drains the buffer completely and hands
/// the linearised bytes straight to the handler. No framing, no `ctx`.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Protocol for PassThrough {
    fn un_packet(
        &self,
        _conn: &Connection,
        buf: &mut RingBuffer,
        user_buf: &mut Vec<u8>,
    ) -> (Option<Box<dyn Any + Send>>, bool) {
        if buf.is_empty() {
            return (None, false);
        }
        let (front, back) = buf.peek_all();
        user_buf.clear();
        user_buf.extend_from_slice(front);
        user_buf.extend_from_slice(back);
        buf.retrieve_all();
        (None, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use crate::handler::Handler;
    use crate::reactor::LoopHandle;

    struct NopHandler;
    impl Handler for NopHandler {
        fn on_connect(&self, _conn: &Connection) {}
    }

    #[test]
    fn pass_through_drains_everything() {
        let protocol = PassThrough;
        let mut buf = RingBuffer::new(16);
        buf.write(b"hello world");
        let conn = Connection::new_for_test(
            LoopHandle::noop(),
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
            Arc::new(NopHandler),
            Arc::new(PassThrough),
        );
        let mut user_buf = Vec::new();
        let (ctx, has_frame) = protocol.un_packet(&conn, &mut buf, &mut user_buf);
        assert!(ctx.is_none());
        assert!(has_frame);
        assert_eq!(user_buf, b"hello world");
        assert!(buf.is_empty());
    }
}
