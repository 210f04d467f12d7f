//! Builder-style configuration and the top-level server: listener +
//! N worker reactors + timing wheel, wired together and given their own
//! threads.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ConstructionError;
use crate::handler::Handler;
use crate::listener::{self, Listener};
use crate::protocol::{PassThrough, Protocol};
use crate::reactor::{LoopHandle, Reactor, Socket};
use crate::timer::{Timer, TimingWheel};

const DEFAULT_ADDRESS: &str = "0.0.0.0:12345";
const DEFAULT_TICK: Duration = Duration::from_millis(1);
const DEFAULT_WHEEL_SIZE: usize = 1000;

/// Construction-time configuration. There are no environment variables and
/// no config file: every value here is set through [`ServerBuilder`].
#[derive(Clone)]
pub struct Options {
    pub address: SocketAddr,
    /// `0` means "use the number of available CPUs".
    pub num_loops: usize,
    pub reuse_port: bool,
    pub idle_time: Option<Duration>,
    pub protocol: Arc<dyn Protocol>,
    pub tick: Duration,
    pub wheel_size: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            address: DEFAULT_ADDRESS.parse().expect("default address parses"),
            num_loops: 0,
            reuse_port: false,
            idle_time: None,
            protocol: Arc::new(PassThrough),
            tick: DEFAULT_TICK,
            wheel_size: DEFAULT_WHEEL_SIZE,
        }
    }
}

/// Builds an [`Options`] value one setting at a time, then constructs a
/// [`Server`] from it along with the mandatory [`Handler`].
#[derive(Clone)]
pub struct ServerBuilder {
    options: Options,
}

impl Default for ServerBuilder {
    fn default() -> ServerBuilder {
        ServerBuilder {
            options: Options::default(),
        }
    }
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.options.address = address;
        self
    }

    /// Number of worker reactors. `0` (the default) resolves to the number
    /// of available CPUs at `build` time.
    pub fn num_loops(mut self, num_loops: usize) -> Self {
        self.options.num_loops = num_loops;
        self
    }

    pub fn reuse_port(mut self, reuse_port: bool) -> Self {
        self.options.reuse_port = reuse_port;
        self
    }

    /// Connections idle for at least this long are closed. Disabled by
    /// default.
    pub fn idle_time(mut self, idle_time: Duration) -> Self {
        self.options.idle_time = Some(idle_time);
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.options.protocol = protocol;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.options.tick = tick;
        self
    }

    pub fn wheel_size(mut self, wheel_size: usize) -> Self {
        self.options.wheel_size = wheel_size;
        self
    }

    /// Materialises every reactor and the listening socket. `handler` is a
    /// required argument, not an `Option`, so a handler-less server cannot
    /// be constructed.
    pub fn build(self, handler: Arc<dyn Handler>) -> Result<Server, ConstructionError> {
        Server::new(handler, self.options)
    }
}

/// One listener reactor, `N` worker reactors, and the timing wheel they
/// share for idle timeouts and `run_after`/`run_every`.
pub struct Server {
    options: Options,
    timing_wheel: Arc<TimingWheel>,
    listener: Arc<Listener>,
    listener_reactor: Mutex<Option<Reactor>>,
    listener_handle: LoopHandle,
    worker_reactors: Mutex<Vec<Reactor>>,
    worker_handles: Vec<LoopHandle>,
    running: AtomicBool,
}

impl Server {
    pub fn new(handler: Arc<dyn Handler>, options: Options) -> Result<Server, ConstructionError> {
        let num_loops = if options.num_loops == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            options.num_loops
        };

        let timing_wheel = Arc::new(TimingWheel::new(options.tick, options.wheel_size));

        let mut worker_reactors = Vec::with_capacity(num_loops);
        let mut worker_handles = Vec::with_capacity(num_loops);
        for _ in 0..num_loops {
            let reactor = Reactor::new().map_err(ConstructionError::Reactor)?;
            worker_handles.push(reactor.handle());
            worker_reactors.push(reactor);
        }

        let mut listener_reactor = Reactor::new().map_err(ConstructionError::Reactor)?;
        let listener_handle = listener_reactor.handle();

        let tcp_listener = listener::bind(options.address, options.reuse_port).map_err(|source| {
            ConstructionError::Bind {
                addr: options.address.to_string(),
                source,
            }
        })?;

        let listener = Arc::new(Listener::new(
            tcp_listener,
            worker_handles.clone(),
            handler,
            options.protocol.clone(),
            options.idle_time,
            Some(timing_wheel.clone()),
        ));

        let boxed: Box<dyn Socket> = Box::new(listener.clone());
        listener
            .with_listener_mut(|l| listener_reactor.add_socket_and_enable_read(l, boxed))
            .map_err(ConstructionError::Reactor)?;

        log::debug!(
            "server constructed: {num_loops} worker reactor(s), address={}",
            options.address
        );

        Ok(Server {
            options,
            timing_wheel,
            listener,
            listener_reactor: Mutex::new(Some(listener_reactor)),
            listener_handle,
            worker_reactors: Mutex::new(worker_reactors),
            worker_handles,
            running: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The address actually bound — useful when `Options::address` used
    /// an ephemeral port (`:0`) and the caller needs to learn which one
    /// the OS assigned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> i64 {
        self.worker_handles.iter().map(|h| h.connection_count()).sum()
    }

    /// Schedules `f` to run once, no earlier than `delay` from now, on the
    /// timing wheel's driver thread.
    pub fn run_after(&self, delay: Duration, f: impl FnMut() + Send + 'static) -> Timer {
        self.timing_wheel.after(delay, f)
    }

    /// Schedules `f` to run repeatedly, once per `interval`, until the
    /// returned `Timer` is stopped.
    pub fn run_every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> Timer {
        self.timing_wheel.every(interval, f)
    }

    /// Starts the timing wheel, spawns one thread per worker reactor plus
    /// one for the listener, and blocks the calling thread until every
    /// reactor has stopped (normally via [`Server::stop`] called from
    /// another thread, a signal handler, or a scheduled task).
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("server already started");
            return;
        }

        self.timing_wheel.start();

        let mut threads = Vec::with_capacity(self.worker_handles.len() + 1);

        if let Some(mut reactor) = self.listener_reactor.lock().unwrap().take() {
            threads.push(
                thread::Builder::new()
                    .name("reactord-listener".into())
                    .spawn(move || reactor.run())
                    .expect("failed to spawn listener thread"),
            );
        }

        let workers = std::mem::take(&mut *self.worker_reactors.lock().unwrap());
        for (i, mut reactor) in workers.into_iter().enumerate() {
            threads.push(
                thread::Builder::new()
                    .name(format!("reactord-worker-{i}"))
                    .spawn(move || reactor.run())
                    .expect("failed to spawn worker thread"),
            );
        }

        log::debug!("server started on {}", self.options.address);
        for handle in threads {
            let _ = handle.join();
        }
        log::debug!("server stopped");
    }

    /// Stops the timing wheel, the listener, and every worker reactor.
    /// Blocks until each reactor's poll loop has actually exited and its
    /// connection count has dropped to zero — by the time this returns,
    /// `start()`'s own `JoinHandle::join` loop is unblocking too. Idempotent:
    /// a second call once `running` is already `false` is a no-op.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.timing_wheel.stop();
        self.listener_handle.request_shutdown();
        for handle in &self.worker_handles {
            handle.request_shutdown();
        }
    }
}
