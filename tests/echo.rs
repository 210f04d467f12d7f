mod common;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reactord::connection::Connection;
use reactord::handler::Handler;
use reactord::server::ServerBuilder;

struct CountingEcho {
    closes: Arc<AtomicUsize>,
}

impl Handler for CountingEcho {
    fn on_connect(&self, _conn: &Connection) {}

    fn on_message(
        &self,
        _conn: &Connection,
        _ctx: Option<Box<dyn std::any::Any + Send>>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn on_close(&self, _conn: &Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn echoes_each_client_byte_for_byte_and_tracks_closes() {
    let closes = Arc::new(AtomicUsize::new(0));
    let server = ServerBuilder::new()
        .address("127.0.0.1:0".parse().unwrap())
        .num_loops(2)
        .build(Arc::new(CountingEcho { closes: closes.clone() }))
        .expect("server constructs");
    let addr = server.local_addr().unwrap();
    let running = common::Running::spawn(server);

    let mut rng = rand::rng();
    const CLIENTS: usize = 5;
    for i in 0..CLIENTS {
        let len = rng.random_range(1..=1 << 16);
        let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(&payload).expect("write");
        stream.shutdown(Shutdown::Write).ok();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).expect("read");
        assert_eq!(out, payload, "client {i} did not get back its own bytes");
    }

    // handle_close runs asynchronously on the owning reactor thread.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(closes.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(running.server.connection_count(), 0);
}
