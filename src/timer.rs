//! A hashed timing wheel used for connection idle timeouts and for the
//! `Server::run_after` / `Server::run_every` convenience API.
//!
//! Scheduled callbacks run on the wheel's own driver thread and must not
//! block; anything that touches reactor or connection state re-enters via
//! [`LoopHandle::queue_in_loop`](crate::reactor::LoopHandle::queue_in_loop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slab::Slab;

struct Entry {
    callback: Box<dyn FnMut() + Send>,
    /// `Some(interval)` for `every`, `None` for a one-shot `after`.
    interval: Option<Duration>,
    cancelled: Arc<AtomicBool>,
}

struct State {
    slots: Vec<Vec<usize>>,
    entries: Slab<Entry>,
    last_tick: u64,
}

struct Shared {
    tick: Duration,
    num_slots: usize,
    start: Instant,
    state: Mutex<State>,
    running: AtomicBool,
    driver_thread: Mutex<Option<thread::Thread>>,
}

impl Shared {
    fn ticks_for(&self, delay: Duration) -> u64 {
        let tick_nanos = self.tick.as_nanos().max(1);
        let ticks = (delay.as_nanos() + tick_nanos - 1) / tick_nanos;
        (ticks as u64).max(1)
    }
}

/// A cancellable handle to one scheduled callback.
///
/// Dropping a `Timer` does **not** cancel it — only an explicit
/// [`Timer::stop`] does. This matches the handle semantics used for the
/// connection idle timeout, which is stored and stopped explicitly from
/// `handle_close`.
pub struct Timer {
    cancelled: Arc<AtomicBool>,
}

impl Timer {
    /// Cancels this timer. A one-shot timer that has not yet fired never
    /// will; a repeating timer's in-flight firing (if any) still completes,
    /// but it schedules no further firing.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A hashed wheel of deferred tasks, driven by one dedicated background
/// thread that parks until the next non-empty slot is due and wakes early
/// via `Thread::unpark` whenever a new timeout is scheduled earlier than
/// its current sleep target.
pub struct TimingWheel {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimingWheel {
    pub fn new(tick: Duration, wheel_size: usize) -> TimingWheel {
        let num_slots = wheel_size.max(1).next_power_of_two();
        TimingWheel {
            shared: Arc::new(Shared {
                tick,
                num_slots,
                start: Instant::now(),
                state: Mutex::new(State {
                    slots: vec![Vec::new(); num_slots],
                    entries: Slab::new(),
                    last_tick: 0,
                }),
                running: AtomicBool::new(false),
                driver_thread: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Spawns the driver thread. Idempotent: calling `start` twice without
    /// an intervening `stop` is a no-op.
    pub fn start(&self) {
        let mut driver = self.driver.lock().unwrap();
        if driver.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("reactord-timing-wheel".into())
            .spawn(move || drive(shared))
            .expect("failed to spawn timing wheel driver thread");
        *self.shared.driver_thread.lock().unwrap() = Some(handle.thread().clone());
        *driver = Some(handle);
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.shared.driver_thread.lock().unwrap().take() {
            thread.unpark();
        }
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Runs `f` once, no earlier than `delay` from now.
    pub fn after(&self, delay: Duration, f: impl FnMut() + Send + 'static) -> Timer {
        self.schedule(delay, None, f)
    }

    /// Runs `f` repeatedly, once per `interval`, until `Timer::stop`.
    pub fn every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> Timer {
        self.schedule(interval, Some(interval), f)
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        f: impl FnMut() + Send + 'static,
    ) -> Timer {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.shared.state.lock().unwrap();
        let due_tick = state.last_tick + self.shared.ticks_for(delay);
        let key = state.entries.insert(Entry {
            callback: Box::new(f),
            interval,
            cancelled: cancelled.clone(),
        });
        let slot = (due_tick as usize) % self.shared.num_slots;
        state.slots[slot].push(key);
        drop(state);
        if let Some(thread) = &*self.shared.driver_thread.lock().unwrap() {
            thread.unpark();
        }
        Timer { cancelled }
    }
}

fn drive(shared: Arc<Shared>) {
    log::debug!("timing wheel driver started");
    while shared.running.load(Ordering::Acquire) {
        let now_tick = elapsed_ticks(shared.start, shared.tick);
        let mut state = shared.state.lock().unwrap();

        while state.last_tick < now_tick && shared.running.load(Ordering::Acquire) {
            state.last_tick += 1;
            let slot = (state.last_tick as usize) % shared.num_slots;
            let due = std::mem::take(&mut state.slots[slot]);

            for key in due {
                if !state.entries.contains(key) {
                    continue;
                }
                if state.entries[key].cancelled.load(Ordering::Acquire) {
                    state.entries.remove(key);
                    continue;
                }
                let mut entry = state.entries.remove(key);
                drop(state);
                log::trace!("timing wheel firing tick");
                (entry.callback)();
                state = shared.state.lock().unwrap();
                if let Some(interval) = entry.interval {
                    if !entry.cancelled.load(Ordering::Acquire) {
                        let due_tick = state.last_tick + shared.ticks_for(interval);
                        let new_slot = (due_tick as usize) % shared.num_slots;
                        let new_key = state.entries.insert(entry);
                        state.slots[new_slot].push(new_key);
                    }
                }
            }
        }

        let next_deadline = shared.start + shared.tick * (state.last_tick as u32 + 1);
        drop(state);
        let now = Instant::now();
        let sleep = next_deadline.saturating_duration_since(now);
        thread::park_timeout(sleep);
    }
    log::debug!("timing wheel driver stopped");
}

fn elapsed_ticks(start: Instant, tick: Duration) -> u64 {
    let elapsed = Instant::now().saturating_duration_since(start);
    (elapsed.as_nanos() / tick.as_nanos().max(1)) as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn after_fires_once() {
        let wheel = TimingWheel::new(Duration::from_millis(2), 64);
        wheel.start();
        let (tx, rx) = mpsc::channel();
        let _timer = wheel.after(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).expect("timer should fire");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        wheel.stop();
    }

    #[test]
    fn stop_cancels_before_fire() {
        let wheel = TimingWheel::new(Duration::from_millis(2), 64);
        wheel.start();
        let (tx, rx) = mpsc::channel::<()>();
        let timer = wheel.after(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        timer.stop();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        wheel.stop();
    }

    #[test]
    fn every_fires_repeatedly_until_stopped() {
        let wheel = TimingWheel::new(Duration::from_millis(2), 64);
        wheel.start();
        let (tx, rx) = mpsc::channel();
        let timer = wheel.every(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).expect("should keep firing");
        }
        timer.stop();
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        wheel.stop();
    }
}
