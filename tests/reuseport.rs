#![cfg(unix)]

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactord::connection::Connection;
use reactord::handler::Handler;
use reactord::server::ServerBuilder;

struct TaggedEcho {
    hits: Arc<AtomicUsize>,
}

impl Handler for TaggedEcho {
    fn on_connect(&self, _conn: &Connection) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(
        &self,
        _conn: &Connection,
        _ctx: Option<Box<dyn std::any::Any + Send>>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

/// Not a strict 50/50 split — `SO_REUSEPORT` distribution is a kernel
/// implementation detail — but both listeners bound to the same address
/// must accept at least one connection across enough dials.
#[test]
fn two_reuseport_listeners_both_accept_connections() {
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));

    let server_a = ServerBuilder::new()
        .address("127.0.0.1:0".parse().unwrap())
        .reuse_port(true)
        .num_loops(1)
        .build(Arc::new(TaggedEcho { hits: hits_a.clone() }))
        .expect("server a constructs");
    let addr: SocketAddr = server_a.local_addr().unwrap();

    let server_b = ServerBuilder::new()
        .address(addr)
        .reuse_port(true)
        .num_loops(1)
        .build(Arc::new(TaggedEcho { hits: hits_b.clone() }))
        .expect("server b constructs");

    let _running_a = common::Running::spawn(server_a);
    let _running_b = common::Running::spawn(server_b);

    const DIALS: usize = 40;
    for _ in 0..DIALS {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(b"x").expect("write");
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).expect("read echo");
    }

    let total = hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst);
    assert_eq!(total, DIALS);
    assert!(hits_a.load(Ordering::SeqCst) > 0, "listener A accepted nothing");
    assert!(hits_b.load(Ordering::SeqCst) > 0, "listener B accepted nothing");
}
