//! The per-TCP-connection state machine: non-blocking read/write, outbound
//! coalescing, idle timeout, and the close protocol.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use mio::{Registry, Token};

use crate::error::{ReactorError, SendError};
use crate::handler::Handler;
use crate::poller::Readiness;
use crate::protocol::Protocol;
use crate::reactor::{DispatchCtx, LoopHandle, Reactor, Socket};
use crate::ring::{PooledRing, RingBuffer};
use crate::timer::{Timer, TimingWheel};

/// Default initial capacity ring buffers are drawn from the pool with.
const DEFAULT_RING_CAPACITY: usize = 1024;

/// What happened when [`Connection::send_in_loop`] tried to make progress
/// on an outbound write.
enum WriteOutcome {
    /// Everything handed to `send_in_loop` this call is either on the wire
    /// or safely parked in `out_buf`.
    Ok,
    /// A non-`WouldBlock` I/O error means this connection is done for.
    Closed,
}

/// A single TCP connection, owned by exactly one [`Reactor`] thread.
///
/// All mutable fields are behind a `Mutex` rather than a `RefCell`: every
/// one of them is in practice only ever touched from the owning reactor
/// thread, but `Connection` itself is handed to users as `Arc<Connection>`
/// and must be freely `Send + Sync` so that `send`/`close` can be called
/// from any thread. The locks are never contended in the hot path.
pub struct Connection {
    token: Mutex<Option<Token>>,
    stream: Mutex<mio::net::TcpStream>,
    registry: Registry,
    loop_handle: LoopHandle,
    self_ref: OnceLock<Weak<Connection>>,

    peer_addr: SocketAddr,
    peer_addr_str: String,

    connected: AtomicBool,
    in_buf: Mutex<Option<PooledRing>>,
    out_buf: Mutex<Option<PooledRing>>,
    /// The zero-copy-ish transaction window a stateful protocol decodes
    /// one read's worth of fresh bytes from; see [`RingBuffer::with_data`].
    txn_buf: Mutex<RingBuffer>,

    ctx: Mutex<Option<Box<dyn Any + Send>>>,
    attrs: Mutex<HashMap<String, Box<dyn Any + Send>>>,

    idle_time: Option<Duration>,
    idle_timer: Mutex<Option<Timer>>,
    active_time: Mutex<Instant>,
    timing_wheel: Option<Arc<TimingWheel>>,

    read_bytes: AtomicI64,
    write_bytes: AtomicI64,

    handler: Arc<dyn Handler>,
    protocol: Arc<dyn Protocol>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: mio::net::TcpStream,
        registry: Registry,
        loop_handle: LoopHandle,
        peer_addr: SocketAddr,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
        idle_time: Option<Duration>,
        timing_wheel: Option<Arc<TimingWheel>>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            token: Mutex::new(None),
            stream: Mutex::new(stream),
            registry,
            loop_handle,
            self_ref: OnceLock::new(),
            peer_addr,
            peer_addr_str: peer_addr.to_string(),
            connected: AtomicBool::new(true),
            in_buf: Mutex::new(Some(PooledRing::acquire(DEFAULT_RING_CAPACITY))),
            out_buf: Mutex::new(Some(PooledRing::acquire(DEFAULT_RING_CAPACITY))),
            txn_buf: Mutex::new(RingBuffer::new(DEFAULT_RING_CAPACITY)),
            ctx: Mutex::new(None),
            attrs: Mutex::new(HashMap::new()),
            idle_time,
            idle_timer: Mutex::new(None),
            active_time: Mutex::new(Instant::now()),
            timing_wheel,
            read_bytes: AtomicI64::new(0),
            write_bytes: AtomicI64::new(0),
            handler,
            protocol,
        });
        let _ = conn.self_ref.set(Arc::downgrade(&conn));
        conn
    }

    /// Builds a `Connection` over a private loopback pair, with no real
    /// reactor behind it. For unit tests that only need a `Connection` to
    /// exist (e.g. exercising a `Protocol` against it), not one that is
    /// actually dispatched readiness events.
    #[cfg(test)]
    pub fn new_for_test(
        loop_handle: LoopHandle,
        peer_addr: SocketAddr,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
    ) -> Arc<Connection> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).expect("connect loopback");
        let (server, _) = listener.accept().expect("accept loopback");
        // Keep the peer side of the pair open for the test's lifetime;
        // nothing in these tests writes enough to need it closed cleanly.
        std::mem::forget(client);
        server.set_nonblocking(true).expect("set nonblocking");
        let stream = mio::net::TcpStream::from_std(server);
        let registry = mio::Poll::new()
            .and_then(|p| p.registry().try_clone())
            .expect("throwaway registry");
        Connection::new(stream, registry, loop_handle, peer_addr, handler, protocol, None, None)
    }

    /// Runs `f` against the underlying stream. Used by the listener to
    /// register a freshly constructed connection's fd with its worker's
    /// reactor without exposing the stream field itself.
    pub(crate) fn with_stream_mut<R>(&self, f: impl FnOnce(&mut mio::net::TcpStream) -> R) -> R {
        let mut guard = self.stream.lock().unwrap();
        f(&mut guard)
    }

    pub(crate) fn fire_on_connect(&self) {
        self.handler.on_connect(self);
    }

    pub(crate) fn set_token(&self, token: Token) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        *self.token.lock().unwrap()
    }

    /// Arms the idle timer, if `idle_time` is configured, right after the
    /// connection is installed with its reactor.
    pub(crate) fn arm_idle_timer(&self) {
        let Some(idle_time) = self.idle_time else {
            return;
        };
        let Some(wheel) = &self.timing_wheel else {
            return;
        };
        let Some(weak) = self.self_ref.get().cloned() else {
            return;
        };
        let timer = wheel.after(idle_time, move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_idle_fire(idle_time);
            }
        });
        *self.idle_timer.lock().unwrap() = Some(timer);
    }

    /// Runs on the timing wheel's driver thread: checks whether the
    /// connection has been silent for at least `idle_time`, and either
    /// closes it or reschedules for the remaining delta.
    fn on_idle_fire(&self, idle_time: Duration) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        let elapsed = self.active_time.lock().unwrap().elapsed();
        if elapsed >= idle_time {
            let _ = self.close();
            return;
        }
        let Some(wheel) = &self.timing_wheel else {
            return;
        };
        let remaining = idle_time - elapsed;
        let Some(weak) = self.self_ref.get().cloned() else {
            return;
        };
        let timer = wheel.after(remaining, move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_idle_fire(idle_time);
            }
        });
        *self.idle_timer.lock().unwrap() = Some(timer);
    }

    fn touch_active_time(&self) {
        if self.idle_time.is_some() {
            *self.active_time.lock().unwrap() = Instant::now();
        }
    }

    // ---- public API (§6.1) -------------------------------------------

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr_str
    }

    pub fn peer_socket_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn read_buf_len(&self) -> i64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_buf_len(&self) -> i64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> Option<Box<dyn Any + Send>> {
        self.ctx.lock().unwrap().take()
    }

    pub fn set_context(&self, value: Box<dyn Any + Send>) {
        *self.ctx.lock().unwrap() = Some(value);
    }

    pub fn with_attr<R>(&self, key: &str, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let attrs = self.attrs.lock().unwrap();
        f(attrs.get(key).map(|b| b.as_ref()))
    }

    pub fn set_attr(&self, key: impl Into<String>, value: Box<dyn Any + Send>) {
        self.attrs.lock().unwrap().insert(key.into(), value);
    }

    pub fn remove_attr(&self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.attrs.lock().unwrap().remove(key)
    }

    /// Enqueues `data` for send. Returns [`SendError`] if the connection is
    /// already closed; otherwise the bytes are delivered in enqueue order
    /// relative to every other successful `send` on this connection,
    /// regardless of which thread called it.
    pub fn send(&self, data: Vec<u8>) -> Result<(), SendError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SendError);
        }
        let Some(strong) = self.self_ref.get().and_then(Weak::upgrade) else {
            return Err(SendError);
        };
        self.loop_handle.queue_in_loop(move |reactor: &mut Reactor| {
            if !strong.connected.load(Ordering::Acquire) {
                return;
            }
            if let WriteOutcome::Closed = strong.send_in_loop(&data) {
                strong.close_from_task(reactor);
            }
        });
        Ok(())
    }

    /// Cooperatively closes the connection: enqueues `handle_close` onto
    /// the owning reactor. Idempotent — a connection already closing or
    /// closed returns `Err` instead of queuing redundant work.
    pub fn close(&self) -> Result<(), SendError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SendError);
        }
        let Some(strong) = self.self_ref.get().and_then(Weak::upgrade) else {
            return Err(SendError);
        };
        self.loop_handle.queue_in_loop(move |reactor: &mut Reactor| {
            strong.close_from_task(reactor);
        });
        Ok(())
    }

    /// Half-closes the write side of the socket without tearing down the
    /// connection — used by the WebSocket protocol after sending a
    /// control-close frame in reply.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.stream.lock().unwrap().shutdown(Shutdown::Write)
    }

    fn close_from_task(&self, reactor: &mut Reactor) {
        let Some(token) = self.token() else { return };
        reactor.with_dispatch_ctx(|ctx| self.handle_close(token, ctx));
    }

    // ---- reactor-facing path -------------------------------------------

    pub(crate) fn handle_event(&self, token: Token, readiness: Readiness, ctx: &mut DispatchCtx) {
        self.touch_active_time();

        if readiness.contains(Readiness::ERR) {
            self.handle_close(token, ctx);
            return;
        }

        let out_pending = self
            .out_buf
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| !b.is_empty())
            .unwrap_or(false);

        if out_pending && readiness.contains(Readiness::WRITE) {
            if self.handle_write(token, ctx) {
                return;
            }
            let now_empty = {
                let mut out_buf = self.out_buf.lock().unwrap();
                match out_buf.as_mut() {
                    Some(rb) if rb.is_empty() => {
                        rb.reset();
                        true
                    }
                    _ => false,
                }
            };
            if now_empty {
                // Nothing left to drain: drop WRITABLE interest so the
                // reactor stops waking us for it every cycle.
                let mut stream = self.stream.lock().unwrap();
                let _ = self.registry.reregister(&mut *stream, token, mio::Interest::READABLE);
            }
        } else if readiness.contains(Readiness::READ) {
            if self.handle_read(token, ctx) {
                return;
            }
            let mut in_buf = self.in_buf.lock().unwrap();
            if let Some(rb) = in_buf.as_mut() {
                if rb.is_empty() {
                    rb.reset();
                }
            }
        }
    }

    /// Reads up to one `packet_buf`'s worth of bytes and funnels them
    /// through the protocol, batching every decoded frame's reply into a
    /// single outbound write. Returns `true` if the connection was closed.
    fn handle_read(&self, token: Token, ctx: &mut DispatchCtx) -> bool {
        let n = match self.stream.lock().unwrap().read(ctx.packet_buf) {
            Ok(0) => {
                self.handle_close(token, ctx);
                return true;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                log::warn!(
                    "{} (peer={})",
                    ReactorError::ConnectionClosed(e),
                    self.peer_addr_str
                );
                self.handle_close(token, ctx);
                return true;
            }
        };
        self.read_bytes.fetch_add(n as i64, Ordering::Relaxed);

        let mut produced = Vec::new();
        {
            let mut in_buf_slot = self.in_buf.lock().unwrap();
            let Some(in_buf) = in_buf_slot.as_mut() else {
                return false;
            };

            if in_buf.is_empty() {
                let mut txn = self.txn_buf.lock().unwrap();
                txn.with_data(&ctx.packet_buf[..n]);
                let (frame_ctx, has_frame) = self.protocol.un_packet(self, &mut txn, ctx.user_buf);
                if has_frame {
                    if let Some(resp) = self.handler.on_message(self, frame_ctx, ctx.user_buf.as_slice()) {
                        produced.extend_from_slice(&resp);
                    }
                }
                let (front, back) = txn.peek_all();
                if !front.is_empty() || !back.is_empty() {
                    in_buf.write(front);
                    in_buf.write(back);
                }
            } else {
                in_buf.write(&ctx.packet_buf[..n]);
            }

            loop {
                let (frame_ctx, has_frame) = self.protocol.un_packet(self, in_buf, ctx.user_buf);
                if !has_frame {
                    break;
                }
                if let Some(resp) = self.handler.on_message(self, frame_ctx, ctx.user_buf.as_slice()) {
                    produced.extend_from_slice(&resp);
                }
            }
        }

        if !produced.is_empty() {
            if let WriteOutcome::Closed = self.send_in_loop(&produced) {
                self.handle_close(token, ctx);
                return true;
            }
        }
        false
    }

    /// Flushes as much of `out_buf` as the socket will currently take.
    /// Returns `true` if the connection was closed.
    fn handle_write(&self, token: Token, ctx: &mut DispatchCtx) -> bool {
        let pending = {
            let out_buf = self.out_buf.lock().unwrap();
            match out_buf.as_ref() {
                Some(rb) => {
                    let (front, back) = rb.peek_all();
                    [front, back].concat()
                }
                None => return false,
            }
        };
        match self.stream.lock().unwrap().write(&pending) {
            Ok(n) => {
                self.write_bytes.fetch_add(n as i64, Ordering::Relaxed);
                if let Some(rb) = self.out_buf.lock().unwrap().as_mut() {
                    rb.retrieve(n);
                }
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                log::warn!(
                    "{} (peer={})",
                    ReactorError::ConnectionClosed(e),
                    self.peer_addr_str
                );
                self.handle_close(token, ctx);
                true
            }
        }
    }

    /// Implements the `send_in_loop` algorithm from the connection design:
    /// coalesce into `out_buf` if a write is already pending, otherwise
    /// attempt a direct non-blocking write and stash whatever the kernel
    /// did not take.
    fn send_in_loop(&self, data: &[u8]) -> WriteOutcome {
        {
            let mut out_buf = self.out_buf.lock().unwrap();
            if let Some(rb) = out_buf.as_mut() {
                if !rb.is_empty() {
                    rb.write(data);
                    return WriteOutcome::Ok;
                }
            } else {
                return WriteOutcome::Closed;
            }
        }

        let outcome = {
            let mut stream = self.stream.lock().unwrap();
            try_write_nonblocking(&mut *stream, data)
        };

        match outcome {
            Ok(n) if n == data.len() => {
                self.write_bytes.fetch_add(n as i64, Ordering::Relaxed);
            }
            Ok(n) => {
                self.write_bytes.fetch_add(n as i64, Ordering::Relaxed);
                if let Some(rb) = self.out_buf.lock().unwrap().as_mut() {
                    rb.write(&data[n..]);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(rb) = self.out_buf.lock().unwrap().as_mut() {
                    rb.write(data);
                }
            }
            Err(e) => {
                log::warn!(
                    "{} (peer={})",
                    ReactorError::ConnectionClosed(e),
                    self.peer_addr_str
                );
                return WriteOutcome::Closed;
            }
        }

        let out_pending = self
            .out_buf
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| !b.is_empty())
            .unwrap_or(false);
        if out_pending {
            let mut stream = self.stream.lock().unwrap();
            if let Some(token) = self.token() {
                let _ = self.registry.reregister(
                    &mut *stream,
                    token,
                    mio::Interest::READABLE | mio::Interest::WRITABLE,
                );
            }
        }
        WriteOutcome::Ok
    }

    /// Idempotent teardown: removes the fd from the poller, invokes
    /// `OnClose`, closes the OS socket, releases ring buffers back to the
    /// pool, and stops any pending idle timer. Guarded by a CAS on
    /// `connected` so concurrent closers (an error-driven close racing a
    /// user-issued `close()`) only tear down once.
    fn handle_close(&self, token: Token, ctx: &mut DispatchCtx) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        log::debug!("connection closed peer={}", self.peer_addr_str);

        if let Some(timer) = self.idle_timer.lock().unwrap().take() {
            timer.stop();
        }

        self.handler.on_close(self);

        {
            let mut stream = self.stream.lock().unwrap();
            let _ = self.registry.deregister(&mut *stream);
            let _ = stream.shutdown(Shutdown::Both);
        }

        // Drop the pooled rings now rather than whenever the last `Arc`
        // reference happens to go away, so "released on close" is exact.
        self.in_buf.lock().unwrap().take();
        self.out_buf.lock().unwrap().take();

        ctx.pending_removals.push(token);
        ctx.conn_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The slab only stores `Box<dyn Socket>`; a `Connection` is always shared
/// as `Arc<Connection>` (for `send`/`close` from other threads), so the
/// trait is implemented for the `Arc` rather than the bare type — legal
/// here since `Socket` is a local trait.
impl Socket for Arc<Connection> {
    fn handle_event(&self, token: Token, readiness: Readiness, ctx: &mut DispatchCtx) {
        Connection::handle_event(self, token, readiness, ctx)
    }

    fn deregister(&self, registry: &Registry) {
        let mut stream = self.stream.lock().unwrap();
        let _ = registry.deregister(&mut *stream);
    }
}

/// Attempts one non-blocking write of `data`, classifying the outcome.
/// Factored out of [`Connection::send_in_loop`] so the coalescing/stashing
/// logic above it can be unit tested against a fake writer that simulates
/// a short write followed by `WouldBlock`.
fn try_write_nonblocking(writer: &mut impl Write, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    match writer.write(data) {
        Ok(n) => Ok(n),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::ErrorKind;

    /// A fake non-blocking writer that accepts exactly `cap` bytes of its
    /// first write and reports `WouldBlock` for anything beyond that.
    struct ShortWriter {
        cap: usize,
        written: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() >= self.cap {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.cap - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_write_reports_partial_count() {
        let mut w = ShortWriter {
            cap: 16,
            written: Vec::new(),
        };
        let payload = vec![7u8; 64 * 1024];
        let n = try_write_nonblocking(&mut w, &payload).unwrap();
        assert_eq!(n, 16);
        assert_eq!(w.written.len(), 16);
    }

    #[test]
    fn would_block_on_second_write() {
        let mut w = ShortWriter {
            cap: 16,
            written: Vec::new(),
        };
        let _ = try_write_nonblocking(&mut w, &vec![1u8; 16]).unwrap();
        let err = try_write_nonblocking(&mut w, &vec![1u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    /// Mirrors S4: a 64-KiB payload that the underlying writer only
    /// accepts 16 bytes of should end up with exactly the tail parked in
    /// `out_buf`'s worth of bytes once the caller feeds the `Ok(16)`
    /// partial-write result back through the same buffering arithmetic
    /// `send_in_loop` uses.
    #[test]
    fn partial_write_tail_len_matches_outstanding_bytes() {
        let mut w = ShortWriter {
            cap: 16,
            written: Vec::new(),
        };
        let payload = vec![9u8; 64 * 1024];
        let n = try_write_nonblocking(&mut w, &payload).unwrap();
        let tail = &payload[n..];
        assert_eq!(tail.len(), 64 * 1024 - 16);
    }
}
