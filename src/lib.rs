//! A single-host, multi-reactor non-blocking TCP server.
//!
//! One acceptor reactor owns the listening socket; `N` worker reactors each
//! own a share of the accepted connections. Connections are dispatched to
//! workers round-robin as they're accepted, and every worker drives its own
//! [`mio`] poll loop on its own thread for the rest of the connection's
//! life.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`ring`] — the pooled circular buffer used on both sides of a
//!   connection.
//! - [`poller`] — a thin abstraction over [`mio::Poll`] and its wakeup
//!   handle.
//! - [`reactor`] — the event loop, its cross-thread task queue, and the
//!   [`Socket`](reactor::Socket) trait every readiness-driven entry
//!   implements.
//! - [`connection`] and [`listener`] — the two [`Socket`](reactor::Socket)
//!   implementations: an accepted TCP connection, and the listening socket
//!   that fans new connections out to workers.
//! - [`protocol`] — the framing boundary between raw bytes and application
//!   messages, with an optional bundled [`protocol::websocket`] upgrade.
//! - [`handler`] — the application-facing callback contract.
//! - [`timer`] — the hashed timing wheel behind idle timeouts and
//!   [`Server::run_after`](server::Server::run_after)/
//!   [`run_every`](server::Server::run_every).
//! - [`server`] — [`Options`](server::Options), [`ServerBuilder`](server::ServerBuilder),
//!   and [`Server`](server::Server) itself, tying everything above together.
//! - [`error`] — the layered error taxonomy returned from construction and
//!   logged internally by the reactor.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactord::handler::Handler;
//! use reactord::connection::Connection;
//! use reactord::server::ServerBuilder;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_connect(&self, _conn: &Connection) {}
//!
//!     fn on_message(
//!         &self,
//!         _conn: &Connection,
//!         _ctx: Option<Box<dyn std::any::Any + Send>>,
//!         data: &[u8],
//!     ) -> Option<Vec<u8>> {
//!         Some(data.to_vec())
//!     }
//! }
//!
//! let server = ServerBuilder::new()
//!     .address("0.0.0.0:12345".parse().unwrap())
//!     .build(Arc::new(Echo))
//!     .expect("failed to construct server");
//! server.start();
//! ```

pub mod connection;
pub mod error;
pub mod handler;
pub mod listener;
pub mod poller;
pub mod protocol;
pub mod reactor;
pub mod ring;
pub mod server;
pub mod timer;

pub use error::{ConstructionError, ReactorError, SendError};
pub use handler::Handler;
pub use server::{Options, Server, ServerBuilder};
