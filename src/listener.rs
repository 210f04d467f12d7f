//! The acceptor: owns the listening socket and fans newly accepted
//! connections out to worker reactors, round-robin.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::{Registry, Token};
use socket2::{Domain, Socket as Socket2, Type};

use crate::connection::Connection;
use crate::handler::Handler;
use crate::poller::Readiness;
use crate::protocol::Protocol;
use crate::reactor::{DispatchCtx, LoopHandle, Reactor, Socket};
use crate::timer::TimingWheel;

/// Default backlog passed to `listen(2)`; matches the common `mio`/`net2`
/// ecosystem default rather than inventing a new constant.
const DEFAULT_BACKLOG: i32 = 1024;

/// Builds a listening socket with `SO_REUSEADDR` always set and
/// `SO_REUSEPORT` set when `reuse_port` is requested, then converts it into
/// an `mio`-ready, non-blocking `TcpListener`.
pub(crate) fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(DEFAULT_BACKLOG)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// The listening-socket [`Socket`]: on read readiness it accepts every
/// pending connection and hands each one to the next worker reactor in
/// round-robin order.
pub struct Listener {
    listener: Mutex<mio::net::TcpListener>,
    workers: Vec<LoopHandle>,
    next: AtomicUsize,
    handler: Arc<dyn Handler>,
    protocol: Arc<dyn Protocol>,
    idle_time: Option<Duration>,
    timing_wheel: Option<Arc<TimingWheel>>,
}

impl Listener {
    pub fn new(
        listener: mio::net::TcpListener,
        workers: Vec<LoopHandle>,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
        idle_time: Option<Duration>,
        timing_wheel: Option<Arc<TimingWheel>>,
    ) -> Listener {
        assert!(!workers.is_empty(), "a server needs at least one worker reactor");
        Listener {
            listener: Mutex::new(listener),
            workers,
            next: AtomicUsize::new(0),
            handler,
            protocol,
            idle_time,
            timing_wheel,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.lock().unwrap().local_addr()
    }

    /// Runs `f` against the underlying listening socket. Used once, by
    /// `Server::new`, to register this listener's fd with its own reactor.
    pub(crate) fn with_listener_mut<R>(&self, f: impl FnOnce(&mut mio::net::TcpListener) -> R) -> R {
        let mut guard = self.listener.lock().unwrap();
        f(&mut guard)
    }

    fn next_worker(&self) -> LoopHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].clone()
    }

    /// Drains every pending connection on the listening socket. Called on
    /// `Read` readiness; stops at the first `WouldBlock`.
    fn accept_loop(&self) {
        loop {
            let accepted = self.listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, addr)) => self.dispatch(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Hands one accepted `(stream, addr)` pair to the next worker in
    /// round-robin order. The actual `Connection` is built *on* the worker
    /// thread so it is constructed with that worker's own registry, and so
    /// `OnConnect` runs before the socket is registered for readiness —
    /// the ordering guaranteed in the server's dispatch contract.
    fn dispatch(&self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let worker = self.next_worker();
        let worker_for_conn = worker.clone();
        let handler = self.handler.clone();
        let protocol = self.protocol.clone();
        let idle_time = self.idle_time;
        let timing_wheel = self.timing_wheel.clone();
        log::debug!("accepted connection peer={addr}");

        worker.queue_in_loop(move |reactor: &mut Reactor| {
            let registry = match reactor.registry().try_clone() {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("failed to clone registry for new connection: {e}");
                    return;
                }
            };
            let conn = Connection::new(
                stream,
                registry,
                worker_for_conn,
                addr,
                handler,
                protocol,
                idle_time,
                timing_wheel,
            );
            conn.fire_on_connect();

            let socket: Box<dyn Socket> = Box::new(conn.clone());
            let token = conn.with_stream_mut(|s| reactor.add_socket_and_enable_read(s, socket));
            match token {
                Ok(token) => {
                    conn.set_token(token);
                    conn.arm_idle_timer();
                    reactor.note_connection_added();
                }
                Err(e) => {
                    log::warn!("failed to register new connection: {e}");
                }
            }
        });
    }
}

/// Implemented on `Arc<Listener>` rather than the bare type for the same
/// reason as `Connection`: registering the listener's fd needs a live
/// `&mut TcpListener` at the same moment the boxed `Socket` is built, so
/// the caller needs two handles to the same object.
impl Socket for Arc<Listener> {
    fn handle_event(&self, _token: Token, readiness: Readiness, _ctx: &mut DispatchCtx) {
        if readiness.contains(Readiness::READ) {
            self.accept_loop();
        }
    }

    fn deregister(&self, registry: &Registry) {
        let mut listener = self.listener.lock().unwrap();
        let _ = registry.deregister(&mut *listener);
    }
}
