//! Plain TCP echo server: whatever bytes a client sends are written back
//! unchanged, using the default pass-through protocol.

use std::sync::Arc;

use reactord::connection::Connection;
use reactord::handler::Handler;
use reactord::server::ServerBuilder;

struct Echo;

impl Handler for Echo {
    fn on_connect(&self, conn: &Connection) {
        log::info!("connected: {}", conn.peer_addr());
    }

    fn on_message(
        &self,
        _conn: &Connection,
        _ctx: Option<Box<dyn std::any::Any + Send>>,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn on_close(&self, conn: &Connection) {
        log::info!("closed: {}", conn.peer_addr());
    }
}

fn main() {
    env_logger::init();

    let server = ServerBuilder::new()
        .address("0.0.0.0:12345".parse().unwrap())
        .build(Arc::new(Echo))
        .expect("failed to construct server");

    log::info!("echo server listening on {}", server.local_addr().unwrap());
    server.start();
}
