use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reactord::server::Server;

/// Wraps a constructed [`Server`], spawns `start()` onto its own thread
/// (since it blocks until `stop()`), and stops + joins it on drop so a
/// panicking assertion still tears the server down instead of leaking its
/// threads into the next test.
pub struct Running {
    pub server: Arc<Server>,
    thread: Option<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl Running {
    pub fn spawn(server: Server) -> Running {
        let server = Arc::new(server);
        let for_thread = server.clone();
        let thread = thread::spawn(move || for_thread.start());
        // Give the listener's reactor thread a moment to start polling
        // before the test's first connection attempt.
        thread::sleep(Duration::from_millis(50));
        Running {
            server,
            thread: Some(thread),
            stopped: AtomicBool::new(false),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.server.stop();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
