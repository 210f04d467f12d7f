//! WebSocket echo server: upgrades every connection, then echoes text and
//! binary frames back to the sender verbatim.

use std::sync::Arc;

use reactord::connection::Connection;
use reactord::protocol::websocket::{self, Handshake, Opcode, WebSocketHandler, WebSocketProtocol};
use reactord::server::ServerBuilder;

struct WsEcho;

impl WebSocketHandler for WsEcho {
    fn on_open(&self, conn: &Connection, handshake: &Handshake) {
        log::info!("upgraded {} {} from {}", handshake.method, handshake.path, conn.peer_addr());
    }

    fn on_ws_message(&self, _conn: &Connection, opcode: Opcode, data: &[u8]) -> Option<(Opcode, Vec<u8>)> {
        Some((opcode, data.to_vec()))
    }

    fn on_ws_close(&self, conn: &Connection) {
        log::info!("websocket closed: {}", conn.peer_addr());
    }
}

fn main() {
    env_logger::init();

    let server = ServerBuilder::new()
        .address("0.0.0.0:12347".parse().unwrap())
        .protocol(Arc::new(WebSocketProtocol))
        .build(Arc::new(websocket::into_handler(WsEcho)))
        .expect("failed to construct server");

    log::info!("websocket echo server listening on {}", server.local_addr().unwrap());
    server.start();
}
