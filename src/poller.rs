//! Thin wrapper over [`mio::Poll`] that translates raw kernel readiness
//! bits into the three abstract flags the rest of the reactor cares about,
//! and folds the wakeup handle into the same token space as ordinary I/O.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use mio::{Events, Token, Waker};

/// Reserved token the [`Waker`] is registered under. Real sockets are
/// handed out tokens from a zero-based [`slab::Slab`], so this sentinel
/// only collides after `usize::MAX` live connections — not a real bound.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// One readiness event as delivered by [`Poller::poll_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readiness: Readiness,
}

bitflags::bitflags! {
    /// Abstract readiness reported for one fd, independent of the
    /// underlying facility's raw bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const ERR   = 0b100;
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(ev: &mio::event::Event) -> Readiness {
        // Hangup without anything readable queued behind it is a pure
        // error; everything else that looks like "can't cleanly drain
        // this socket any further" folds into `WRITE` — a pure writable
        // event is never treated as an error.
        if ev.is_read_closed() && !ev.is_readable() {
            return Readiness::ERR;
        }
        let mut flags = Readiness::empty();
        if ev.is_error() || ev.is_writable() {
            flags |= Readiness::WRITE;
        }
        if ev.is_readable() || ev.is_priority() {
            flags |= Readiness::READ;
        }
        flags
    }
}

/// `mio::Poll::poll` takes `&mut self`, but a [`Poller`] needs to be
/// reachable from other threads (to `wake`/`close` it) while its owning
/// thread is mid-wait inside `poll_once`. Bundling the poll handle and its
/// event buffer behind one `Mutex` lets `poll_once` take `&self` instead —
/// the lock is never contended, since only the owning thread ever calls it.
struct PollState {
    poll: mio::Poll,
    events: Events,
}

/// Owns the readiness facility and its wakeup handle.
///
/// `poll_once` is only ever called from the thread that owns this
/// `Poller` for its lifetime. `wake` and `close` are meant to be called
/// from other threads, which is why `Poller` is always handed out as an
/// `Arc<Poller>`.
pub struct Poller {
    state: Mutex<PollState>,
    waker: Waker,
    running: AtomicBool,
    done: (Mutex<bool>, Condvar),
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let poll = mio::Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Poller {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(1024),
            }),
            waker,
            running: AtomicBool::new(true),
            done: (Mutex::new(false), Condvar::new()),
        })
    }

    pub fn registry(&self) -> io::Result<mio::Registry> {
        self.state.lock().unwrap().poll.registry().try_clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the owning thread's blocked or about-to-block wait to
    /// return immediately and re-check pending work.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Waits once for readiness, retrying internally on `Interrupted`, and
    /// appends the resulting events (possibly none) to `out`.
    pub fn poll_once(&self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            let PollState { poll, events } = &mut *state;
            match poll.poll(events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        out.extend(
            state
                .events
                .iter()
                .map(|ev| Event {
                    token: ev.token(),
                    readiness: Readiness::from(ev),
                }),
        );
        Ok(())
    }

    /// Stops the poll loop: the owning thread observes `is_running() ==
    /// false` on its next wait and is expected to call [`Poller::signal_done`]
    /// before exiting. Blocks the calling thread until that happens.
    pub fn close(&self) -> io::Result<()> {
        self.running.store(false, Ordering::Release);
        self.wake()?;
        let (lock, cvar) = &self.done;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
        Ok(())
    }

    /// Called by the owning reactor thread once it has observed
    /// `is_running() == false` and torn down its sockets, unblocking any
    /// concurrent [`Poller::close`] caller.
    pub fn signal_done(&self) {
        let (lock, cvar) = &self.done;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}
