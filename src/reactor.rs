//! The event loop: one [`Poller`], a slab of owned sockets, and the
//! cross-thread task queue other threads use to reach into it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Registry, Token};
use slab::Slab;
use spin::Mutex as SpinMutex;

use crate::error::{FatalReactorError, ReactorError};
use crate::poller::{Event, Poller, Readiness, WAKE_TOKEN};

/// Default size of the per-loop scratch buffer used for one `read` syscall.
pub const DEFAULT_PACKET_BUF: usize = 65536;

/// A task queued cross-thread onto a [`Reactor`], run on its own thread
/// with full access to the reactor that owns the target socket.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Anything a [`Reactor`] can hold a readiness-driven entry for: today,
/// only [`Connection`](crate::connection::Connection) and
/// [`Listener`](crate::listener::Listener).
pub trait Socket {
    /// Reacts to readiness reported for this socket's token.
    fn handle_event(&self, token: Token, readiness: Readiness, ctx: &mut DispatchCtx);

    /// Removes this socket's source from the readiness facility. Called
    /// once, right before the socket is dropped out of the reactor's slab.
    fn deregister(&self, registry: &Registry);
}

/// Borrowed, reactor-owned scratch state handed to [`Socket::handle_event`]
/// for the duration of one dispatch call.
pub struct DispatchCtx<'a> {
    pub packet_buf: &'a mut Vec<u8>,
    pub user_buf: &'a mut Vec<u8>,
    pub registry: &'a Registry,
    pub pending_removals: &'a mut Vec<Token>,
    pub conn_count: &'a AtomicI64,
}

#[derive(Default)]
struct TaskSlices {
    write_side: Vec<Task>,
    read_side: Vec<Task>,
}

enum HandleInner {
    Real(Arc<RealHandle>),
    /// Backs [`LoopHandle::noop`]: `queue_in_loop` runs its closure
    /// immediately against a throwaway `Reactor`, since there is no real
    /// one to reach into. Only meant for unit tests of `Connection` in
    /// isolation.
    Noop,
}

struct RealHandle {
    tasks: SpinMutex<TaskSlices>,
    need_wake: AtomicBool,
    poll: Arc<Poller>,
    conn_count: AtomicI64,
}

/// A cloneable, `Send + Sync` handle used to reach into a [`Reactor`] from
/// any thread. This is the *only* safe cross-thread entry point into a
/// reactor: it never exposes the `sockets` map directly.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<HandleInner>,
}

impl LoopHandle {
    /// A handle with no reactor behind it; see [`HandleInner::Noop`].
    pub fn noop() -> LoopHandle {
        LoopHandle {
            inner: Arc::new(HandleInner::Noop),
        }
    }

    pub fn connection_count(&self) -> i64 {
        match &*self.inner {
            HandleInner::Real(h) => h.conn_count.load(Ordering::Acquire),
            HandleInner::Noop => 0,
        }
    }

    /// Appends `f` to the write-side task vector and wakes the reactor if
    /// it might be sleeping. Collapses bursts of concurrent submissions
    /// into a single wakeup via the `need_wake` compare-and-swap.
    pub fn queue_in_loop(&self, f: impl FnOnce(&mut Reactor) + Send + 'static) {
        match &*self.inner {
            HandleInner::Noop => {
                let mut throwaway = Reactor::new().expect("construct detached test reactor");
                f(&mut throwaway);
            }
            HandleInner::Real(h) => {
                h.tasks.lock().write_side.push(Box::new(f));
                if h.need_wake
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Err(e) = h.poll.wake() {
                        log::error!("{}", FatalReactorError::Wake(e));
                        std::process::abort();
                    }
                }
            }
        }
    }

    /// Queues the task that tears down every remaining socket on the
    /// owning reactor, then blocks until its poll loop has actually
    /// stopped. Unlike `queue_in_loop`, this only needs a handle — the
    /// reactor itself may already be running on a thread the caller no
    /// longer has direct access to.
    pub fn request_shutdown(&self) {
        let h = match &*self.inner {
            HandleInner::Noop => return,
            HandleInner::Real(h) => h.clone(),
        };
        self.queue_in_loop(|reactor: &mut Reactor| {
            let registry = reactor.registry.try_clone().expect("clone registry");
            for socket in reactor.sockets.drain().map(|(_, s)| s) {
                socket.deregister(&registry);
            }
            if let HandleInner::Real(h) = &*reactor.handle.inner {
                h.conn_count.store(0, Ordering::Release);
            }
        });
        if let Err(e) = h.poll.close() {
            log::error!("{}", FatalReactorError::Close(e));
            std::process::abort();
        }
    }
}

/// Owns one [`Poller`], the sockets dispatched to it, and the scratch
/// buffers its read path reuses across connections.
///
/// Padded to one cache line so that an array of workers does not suffer
/// false sharing between adjacent reactors' hot fields.
#[repr(align(128))]
pub struct Reactor {
    poll: Arc<Poller>,
    registry: Registry,
    sockets: Slab<Box<dyn Socket>>,
    packet_buf: Vec<u8>,
    user_buf: Vec<u8>,
    pending_removals: Vec<Token>,
    handle: LoopHandle,
}

impl Reactor {
    pub fn new() -> std::io::Result<Reactor> {
        let poll = Arc::new(Poller::new()?);
        let registry = poll.registry()?;
        let handle = LoopHandle {
            inner: Arc::new(HandleInner::Real(Arc::new(RealHandle {
                tasks: SpinMutex::new(TaskSlices::default()),
                need_wake: AtomicBool::new(true),
                poll: poll.clone(),
                conn_count: AtomicI64::new(0),
            }))),
        };
        Ok(Reactor {
            poll,
            registry,
            sockets: Slab::new(),
            packet_buf: vec![0u8; DEFAULT_PACKET_BUF],
            user_buf: Vec::new(),
            pending_removals: Vec::new(),
            handle,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_count(&self) -> i64 {
        self.handle.connection_count()
    }

    /// Called once a freshly accepted connection has been registered for
    /// readiness. The matching decrement happens in
    /// [`Connection::handle_close`](crate::connection::Connection).
    pub(crate) fn note_connection_added(&self) {
        if let HandleInner::Real(h) = &*self.handle.inner {
            h.conn_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn packet_buf(&mut self) -> &mut Vec<u8> {
        &mut self.packet_buf
    }

    pub fn user_buf(&mut self) -> &mut Vec<u8> {
        &mut self.user_buf
    }

    /// Inserts `socket` into the slab, registers `source` for read
    /// readiness under the slab's key, and returns the assigned token.
    /// `source`'s readiness events will be delivered via the returned
    /// token for as long as the socket stays registered; the caller keeps
    /// ownership of `source` itself (typically inside `socket`).
    pub fn add_socket_and_enable_read(
        &mut self,
        source: &mut impl mio::event::Source,
        socket: Box<dyn Socket>,
    ) -> std::io::Result<Token> {
        let key = self.sockets.insert(socket);
        let token = Token(key);
        if let Err(e) = self
            .registry
            .register(source, token, mio::Interest::READABLE)
        {
            self.sockets.remove(key);
            return Err(e);
        }
        Ok(token)
    }

    pub fn enable_read(
        &self,
        source: &mut impl mio::event::Source,
        token: Token,
    ) -> std::io::Result<()> {
        self.registry
            .reregister(source, token, mio::Interest::READABLE)
    }

    pub fn enable_read_write(
        &self,
        source: &mut impl mio::event::Source,
        token: Token,
    ) -> std::io::Result<()> {
        self.registry.reregister(
            source,
            token,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        )
    }

    /// Marks `token`'s socket for removal once the current dispatch batch
    /// has finished processing. Sockets cannot be removed mid-batch: the
    /// slab only hands out shared borrows while a batch is in flight.
    pub fn schedule_removal(&mut self, token: Token) {
        self.pending_removals.push(token);
    }

    fn drain_tasks(&mut self) {
        let drained: Vec<Task> = {
            let real = match &*self.handle.inner {
                HandleInner::Real(h) => h,
                HandleInner::Noop => return,
            };
            real.need_wake.store(true, Ordering::Release);
            let mut slices = real.tasks.lock();
            std::mem::swap(&mut slices.write_side, &mut slices.read_side);
            slices.read_side.drain(..).collect()
        };
        log::trace!("draining {} queued task(s)", drained.len());
        for task in drained {
            task(self);
        }
    }

    fn dispatch_one(&mut self, token: Token, readiness: Readiness) {
        let Reactor {
            sockets,
            packet_buf,
            user_buf,
            registry,
            pending_removals,
            handle,
            ..
        } = self;
        let real = match &*handle.inner {
            HandleInner::Real(h) => h,
            HandleInner::Noop => return,
        };
        log::trace!("dispatch token={} readiness={:?}", token.0, readiness);
        let Some(socket) = sockets.get(token.0) else {
            return;
        };
        let mut ctx = DispatchCtx {
            packet_buf,
            user_buf,
            registry,
            pending_removals,
            conn_count: &real.conn_count,
        };
        // A panicking user callback must not poison every other connection
        // sharing this reactor thread: catch it here, log it, and treat it
        // as a terminal error for this one connection only.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            socket.handle_event(token, readiness, &mut ctx);
        }));
        if outcome.is_err() {
            log::error!("{}", ReactorError::CallbackPanic);
            ctx.pending_removals.push(token);
        }
    }

    /// Builds a [`DispatchCtx`] over this reactor's scratch state and hands
    /// it to `f`. Used by queued tasks (which only receive `&mut Reactor`)
    /// that need to drive a socket's close path the same way the normal
    /// dispatch loop does.
    pub fn with_dispatch_ctx<R>(&mut self, f: impl FnOnce(&mut DispatchCtx) -> R) -> R {
        let Reactor {
            packet_buf,
            user_buf,
            registry,
            pending_removals,
            handle,
            ..
        } = self;
        match &*handle.inner {
            HandleInner::Real(real) => {
                let mut ctx = DispatchCtx {
                    packet_buf,
                    user_buf,
                    registry,
                    pending_removals,
                    conn_count: &real.conn_count,
                };
                f(&mut ctx)
            }
            HandleInner::Noop => {
                static FALLBACK_CONN_COUNT: AtomicI64 = AtomicI64::new(0);
                let mut ctx = DispatchCtx {
                    packet_buf,
                    user_buf,
                    registry,
                    pending_removals,
                    conn_count: &FALLBACK_CONN_COUNT,
                };
                f(&mut ctx)
            }
        }
    }

    fn flush_pending_removals(&mut self) {
        let Reactor {
            sockets,
            registry,
            pending_removals,
            ..
        } = self;
        for token in pending_removals.drain(..) {
            if let Some(socket) = sockets.try_remove(token.0) {
                socket.deregister(registry);
            }
        }
    }

    /// Runs the dispatch loop on the calling thread until
    /// [`LoopHandle::request_shutdown`] has been called for this reactor.
    pub fn run(&mut self) {
        log::debug!("reactor started");
        let mut events: Vec<Event> = Vec::with_capacity(1024);
        let mut timeout = Some(Duration::ZERO);

        while self.poll.is_running() {
            events.clear();
            if let Err(e) = self.poll.poll_once(&mut events, timeout) {
                log::error!("{}", FatalReactorError::Poll(e));
                std::process::abort();
            }

            if events.is_empty() {
                timeout = None;
                std::thread::yield_now();
                continue;
            }
            timeout = Some(Duration::ZERO);

            for ev in events.drain(..) {
                if ev.token == WAKE_TOKEN {
                    self.drain_tasks();
                } else {
                    self.dispatch_one(ev.token, ev.readiness);
                }
            }
            self.flush_pending_removals();
        }

        self.poll.signal_done();
        log::debug!("reactor stopped");
    }
}
