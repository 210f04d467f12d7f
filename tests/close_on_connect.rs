mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reactord::connection::Connection;
use reactord::handler::Handler;
use reactord::server::ServerBuilder;

struct CloseOnConnect {
    message_fired: Arc<AtomicBool>,
}

impl Handler for CloseOnConnect {
    fn on_connect(&self, conn: &Connection) {
        let _ = conn.close();
    }

    fn on_message(
        &self,
        _conn: &Connection,
        _ctx: Option<Box<dyn std::any::Any + Send>>,
        _data: &[u8],
    ) -> Option<Vec<u8>> {
        self.message_fired.store(true, Ordering::SeqCst);
        None
    }
}

#[test]
fn closing_from_on_connect_yields_immediate_eof_and_no_message() {
    let message_fired = Arc::new(AtomicBool::new(false));
    let server = ServerBuilder::new()
        .address("127.0.0.1:0".parse().unwrap())
        .num_loops(1)
        .build(Arc::new(CloseOnConnect {
            message_fired: message_fired.clone(),
        }))
        .expect("server constructs");
    let addr = server.local_addr().unwrap();
    let _running = common::Running::spawn(server);

    let mut stream = TcpStream::connect(addr).expect("connect");
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("read should not error");
    assert_eq!(n, 0, "expected immediate EOF");
    assert!(!message_fired.load(Ordering::SeqCst));
}
