#![cfg(feature = "websocket")]

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactord::connection::Connection;
use reactord::protocol::websocket::{self, Handshake, Opcode, WebSocketHandler, WebSocketProtocol};
use reactord::server::ServerBuilder;

struct Recorder {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
}

impl WebSocketHandler for Recorder {
    fn on_open(&self, _conn: &Connection, _handshake: &Handshake) {}

    fn on_ws_message(&self, _conn: &Connection, opcode: Opcode, data: &[u8]) -> Option<(Opcode, Vec<u8>)> {
        if opcode == Opcode::Text {
            self.frames.lock().unwrap().push(data.to_vec());
        }
        None
    }

    fn on_ws_close(&self, _conn: &Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    let mask_key = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![0x81u8, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask_key);
    for (i, b) in payload.iter().enumerate() {
        frame.push(b ^ mask_key[i % 4]);
    }
    frame
}

fn masked_close_frame() -> Vec<u8> {
    let mask_key = [1u8, 2, 3, 4];
    let mut frame = vec![0x88u8, 0x80];
    frame.extend_from_slice(&mask_key);
    frame
}

#[test]
fn upgrade_then_split_header_frames_then_close() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));

    let server = ServerBuilder::new()
        .address("127.0.0.1:0".parse().unwrap())
        .protocol(Arc::new(WebSocketProtocol))
        .num_loops(1)
        .build(Arc::new(websocket::into_handler(Recorder {
            frames: frames.clone(),
            closes: closes.clone(),
        })))
        .expect("server constructs");
    let addr = server.local_addr().unwrap();
    let _running = common::Running::spawn(server);

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_nodelay(true).ok();

    let request = "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).expect("write handshake");

    let mut response = [0u8; 256];
    let n = stream.read(&mut response).expect("read handshake response");
    let response_text = String::from_utf8_lossy(&response[..n]);
    assert!(response_text.starts_with("HTTP/1.1 101"));
    assert!(response_text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // One frame sent whole...
    let frame_a = masked_text_frame(b"hello");
    stream.write_all(&frame_a).expect("write frame a");

    // ...and one sent a byte at a time, to exercise the header-split
    // revert path over the wire rather than just at the buffer level.
    let frame_b = masked_text_frame(b"world");
    for byte in &frame_b {
        stream.write_all(std::slice::from_ref(byte)).expect("write one byte");
        std::thread::sleep(Duration::from_millis(2));
    }

    stream.write_all(&masked_close_frame()).expect("write close frame");

    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).expect("read until server half-closes");
    assert!(!tail.is_empty(), "expected a close frame echoed back");
    assert_eq!(tail[0] & 0x0f, 0x8, "expected a close opcode");

    // The server only half-closes on a Close frame (per its protocol
    // contract); fully closing the client socket is what drives the
    // server's own `on_close`/`on_ws_close` the rest of the way.
    drop(stream);

    std::thread::sleep(Duration::from_millis(100));
    let recorded = frames.lock().unwrap();
    assert_eq!(&*recorded, &[b"hello".to_vec(), b"world".to_vec()]);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
