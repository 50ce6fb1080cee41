//! A minimal, non-blocking RFC 6455 WebSocket client engine.
//!
//! This crate implements a single-connection, client-only WebSocket
//! engine over plaintext TCP: the HTTP/1.1 upgrade handshake, an
//! incremental zero-copy frame parser, a masking frame builder, and a
//! connection state machine that ties them to a non-blocking socket with
//! readiness-driven I/O.
//!
//! ```no_run
//! use ws_client_core::{Config, Connection};
//!
//! # fn main() -> Result<(), ws_client_core::WsError> {
//! let mut conn = Connection::connect("ws://echo.example.com/", Config::default())?;
//! conn.send_text("hello")?;
//! loop {
//!     match conn.recv(1000) {
//!         Ok(msg) => {
//!             println!("got {} bytes", msg.payload.len());
//!             conn.release_payload()?;
//!             break;
//!         }
//!         Err(ws_client_core::WsError::NotReady) => continue,
//!         Err(e) => return Err(e),
//!     }
//! }
//! conn.close(1000, "")?;
//! # Ok(())
//! # }
//! ```
//!
//! Out of scope: TLS (`wss://`), permessage-deflate, subprotocol
//! negotiation beyond sending the header, and multi-threaded access to a
//! single connection. See `SPEC_FULL.md` in the repository for the full
//! design rationale.

pub mod connection;
pub mod errors;
pub mod frame;
pub mod handshake;
pub mod net;
pub mod parser;
pub mod ringbuf;
pub mod utf8;
pub mod uri;

pub use connection::{Config, ConnState, Connection, Message};
pub use errors::{error_string, ProtocolError, WsError};
pub use frame::OpCode;
