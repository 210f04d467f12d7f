//! Closes any connection silent for more than two seconds, to exercise the
//! idle timeout end to end.

use std::sync::Arc;
use std::time::Duration;

use reactord::connection::Connection;
use reactord::handler::Handler;
use reactord::server::ServerBuilder;

struct DropWhenIdle;

impl Handler for DropWhenIdle {
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
        log::info!("closed (idle or otherwise): {}", conn.peer_addr());
    }
}

fn main() {
    env_logger::init();

    let server = ServerBuilder::new()
        .address("0.0.0.0:12346".parse().unwrap())
        .idle_time(Duration::from_secs(2))
        .build(Arc::new(DropWhenIdle))
        .expect("failed to construct server");

    log::info!("idle-timeout server listening on {}", server.local_addr().unwrap());
    server.start();
}
