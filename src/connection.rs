//! The connection engine: binds the handshake, frame builder, and parser
//! to a single non-blocking socket with readiness-driven I/O and a
//! pinned, zero-copy receive path.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::errors::WsError;
use crate::frame::{self, OpCode};
use crate::handshake::{self, HandshakeOptions};
use crate::net;
use crate::parser::{FeedStatus, FrameHeader, Parser};
use crate::uri;

const HANDSHAKE_SCRATCH: usize = 8 * 1024;
const READ_CHUNK: usize = 4096;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// bound on the connect + handshake round trip, and reused as the
    /// generic socket-write timeout for `send_*` (there is no separate
    /// send timeout knob)
    pub handshake_timeout_ms: u64,
    pub max_frame_size: usize,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub protocol: Option<String>,
    /// accepted for API compatibility; permessage-deflate is not
    /// implemented by this core
    pub enable_compression: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5000,
            max_frame_size: 1 << 20,
            user_agent: None,
            origin: None,
            protocol: None,
            enable_compression: false,
        }
    }
}

/// Connection lifecycle state. A separate pre-connect `INIT` state has
/// no independent observable moment in this API (the constructor
/// performs the full handshake before returning), so it is folded into
/// `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

/// A received data frame, with its payload borrowed zero-copy out of the
/// connection's receive buffer via a refcounted [`Bytes`] view.
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Bytes,
    pub fin: bool,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_sendable_close_code(code: u16) -> bool {
    matches!(
        code,
        1000 | 1001 | 1002 | 1003 | 1007 | 1008 | 1009 | 1011
    ) || (3000..=4999).contains(&code)
}

fn write_all_nonblocking(stream: &mut TcpStream, mut buf: &[u8], deadline: Instant) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || !net::wait_writable_fd(stream.as_raw_fd(), remaining)? {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_handshake_response(stream: &mut TcpStream, deadline: Instant) -> Result<Vec<u8>, WsError> {
    let mut buf = vec![0u8; HANDSHAKE_SCRATCH];
    let mut filled = 0usize;
    loop {
        if let Some(pos) = find_subsequence(&buf[..filled], b"\r\n\r\n") {
            buf.truncate(pos + 4);
            return Ok(buf);
        }
        if filled == buf.len() {
            return Err(WsError::Handshake("response exceeded scratch buffer".into()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WsError::Handshake("timed out waiting for handshake response".into()));
        }
        match net::wait_readable_fd(stream.as_raw_fd(), remaining) {
            Ok(true) => {}
            Ok(false) => return Err(WsError::Handshake("timed out waiting for handshake response".into())),
            Err(e) => return Err(WsError::Network(e.to_string())),
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(WsError::Network("eof before handshake response complete".into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(WsError::Network(e.to_string())),
        }
    }
}

/// A single client-side WebSocket connection.
///
/// Owns a non-blocking socket, the incremental parser, a flat receive
/// buffer, and the pinning bookkeeping that keeps a payload returned
/// from `recv` valid until the caller calls `release_payload`. Not
/// `Send`/`Sync`: a connection is used by exactly one caller thread, per
/// the concurrency model.
pub struct Connection {
    stream: TcpStream,
    state: ConnState,
    config: Config,
    recv_buf: BytesMut,
    /// bytes of `recv_buf` already handed to `parser.feed` for the frame
    /// currently in progress; always 0 right after a frame completes and
    /// its span is split off (see `handle_frame`)
    parsed: usize,
    parser: Parser,
    pin_refcount: usize,
    last_error: Option<WsError>,
}

impl Connection {
    /// Connect to `uri` (`ws://host[:port]/path`), performing the full
    /// HTTP upgrade handshake before returning. On success the
    /// connection's state is `OPEN`.
    pub fn connect(uri: &str, config: Config) -> Result<Connection, WsError> {
        debug_assert!(
            !config.enable_compression,
            "enable_compression is accepted for API compatibility but permessage-deflate is not implemented"
        );
        if config.enable_compression {
            tracing::warn!("enable_compression requested but this core does not implement permessage-deflate; ignoring");
        }

        let target = uri::parse(uri)?;
        let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| WsError::Network(format!("resolving {}: {e}", target.host)))?
            .next()
            .ok_or_else(|| WsError::Network(format!("no addresses for host {}", target.host)))?;

        let mut stream = net::connect_nonblocking(addr, deadline.saturating_duration_since(Instant::now()))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    WsError::Timeout
                } else {
                    WsError::Network(e.to_string())
                }
            })?;

        let key = handshake::generate_client_key();
        let opts = HandshakeOptions {
            user_agent: config.user_agent.as_deref(),
            origin: config.origin.as_deref(),
            protocol: config.protocol.as_deref(),
        };
        let mut request = Vec::new();
        handshake::build_request(&mut request, &target.host, target.port, &target.path, &key, &opts)?;

        write_all_nonblocking(&mut stream, &request, deadline).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                WsError::Handshake("timed out writing request".into())
            } else {
                WsError::Network(e.to_string())
            }
        })?;

        let response = read_handshake_response(&mut stream, deadline)?;
        handshake::validate_response(&response, &key)?;

        tracing::debug!(host = %target.host, port = target.port, "websocket handshake complete");

        Ok(Connection {
            stream,
            state: ConnState::Open,
            recv_buf: BytesMut::with_capacity(config.max_frame_size + 4096),
            parsed: 0,
            parser: Parser::new(config.max_frame_size),
            pin_refcount: 0,
            last_error: None,
            config,
        })
    }

    /// Current lifecycle state.
    pub fn get_state(&self) -> ConnState {
        self.state
    }

    /// Most recent non-OK error observed by this connection, if any.
    pub fn get_last_error(&self) -> Option<&WsError> {
        self.last_error.as_ref()
    }

    /// Underlying socket descriptor, for a caller that wants to fold this
    /// connection into its own readiness loop (e.g. a `poll`/`epoll` set
    /// spanning several connections).
    pub fn fileno(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn fail(&mut self, err: WsError, next_state: ConnState) -> WsError {
        tracing::warn!(error = %err, "connection entering {:?}", next_state);
        self.state = next_state;
        self.last_error = Some(clone_error(&err));
        err
    }

    fn send_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        if payload.len() > self.config.max_frame_size {
            return Err(WsError::BufferFull);
        }
        let mask = handshake::generate_mask_key();
        let mut out = BytesMut::new();
        frame::build_frame(fin, opcode, Some(mask), payload, &mut out);

        let deadline = Instant::now() + Duration::from_millis(self.config.handshake_timeout_ms);
        write_all_nonblocking(&mut self.stream, &out, deadline).map_err(|e| {
            let err = if e.kind() == io::ErrorKind::TimedOut {
                WsError::Timeout
            } else {
                WsError::Network(e.to_string())
            };
            self.fail(err, ConnState::Error)
        })
    }

    /// Send a TEXT frame. Allowed only in `OPEN`.
    pub fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidArgs("send_text requires an open connection".into()));
        }
        self.send_frame(true, OpCode::Text, text.as_bytes())
    }

    /// Send a BINARY frame. Allowed only in `OPEN`.
    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidArgs("send_binary requires an open connection".into()));
        }
        self.send_frame(true, OpCode::Binary, data)
    }

    /// Send a PING frame. `payload` must be 125 bytes or fewer.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        if self.state != ConnState::Open {
            return Err(WsError::InvalidArgs("send_ping requires an open connection".into()));
        }
        if payload.len() > 125 {
            return Err(WsError::InvalidArgs("ping payload exceeds 125 bytes".into()));
        }
        self.send_frame(true, OpCode::Ping, payload)
    }

    fn send_close_frame(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if !is_sendable_close_code(code) {
            return Err(WsError::InvalidArgs(format!(
                "close code {code} must not be sent on the wire"
            )));
        }
        let mut payload = code.to_be_bytes().to_vec();
        const MAX_REASON: usize = 123; // 125 - 2 code bytes
        let mut cut = reason.len().min(MAX_REASON);
        while cut > 0 && !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..cut]);
        self.send_frame(true, OpCode::Close, &payload)
    }

    /// Send a CLOSE frame and move to `CLOSING` (or stay there). Allowed
    /// in `OPEN` or `CLOSING`. Does not shut down the socket; call
    /// [`Connection::close`] to tear the connection down.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if !matches!(self.state, ConnState::Open | ConnState::Closing) {
            return Err(WsError::InvalidArgs("send_close requires an open connection".into()));
        }
        self.send_close_frame(code, reason)?;
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
        Ok(())
    }

    /// Receive one data message, transparently handling PING/PONG/CLOSE.
    ///
    /// Allowed only in `OPEN`, and only while no previously returned
    /// payload is still pinned (`not_ready` otherwise). Blocks on
    /// readability up to `timeout_ms`.
    pub fn recv(&mut self, timeout_ms: u64) -> Result<Message, WsError> {
        if self.pin_refcount > 0 {
            return Err(WsError::NotReady);
        }
        match self.state {
            ConnState::Open => {}
            ConnState::Closed => return Err(WsError::Closed),
            _ => return Err(WsError::NotReady),
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            // a previous call may have left a fully- or partially-buffered
            // next frame sitting unparsed (e.g. the socket read that
            // surfaced an auto-handled PING also pulled in the frame after
            // it); make progress on that before waiting on the socket again
            if self.parsed < self.recv_buf.len() {
                let input = &self.recv_buf[self.parsed..];
                let outcome = match self.parser.feed(input) {
                    FeedStatus::NeedMore { consumed } => Some((None, consumed)),
                    FeedStatus::Frame { frame, consumed } => Some((Some(frame.header), consumed)),
                    FeedStatus::Err(e) => {
                        return Err(self.fail(WsError::Protocol(e), ConnState::Error));
                    }
                };
                let (header, consumed) = outcome.expect("handled Err case above");
                self.parsed += consumed;
                if let Some(header) = header {
                    let total_span = self.parsed;
                    return self.handle_frame(header, total_span);
                }
                // NeedMore consumed everything buffered; fall through to
                // wait for more bytes from the socket
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WsError::Timeout);
            }
            match net::wait_readable_fd(self.stream.as_raw_fd(), remaining) {
                Ok(true) => {}
                Ok(false) => return Err(WsError::Timeout),
                Err(e) => return Err(self.fail(WsError::Network(e.to_string()), ConnState::Error)),
            }

            let mut tmp = [0u8; READ_CHUNK];
            match self.stream.read(&mut tmp) {
                Ok(0) => {
                    self.state = ConnState::Closed;
                    self.last_error = Some(WsError::Network("eof from peer".into()));
                    return Err(WsError::Closed);
                }
                Ok(n) => self.recv_buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(self.fail(WsError::Network(e.to_string()), ConnState::Error)),
            }
        }
    }

    /// Dispatch a just-completed frame spanning `recv_buf[0..total_span]`
    /// (always anchored at 0: the buffer is split down to its unconsumed
    /// tail every time a frame completes, so a fresh frame always starts
    /// parsing at the front).
    fn handle_frame(&mut self, header: FrameHeader, total_span: usize) -> Result<Message, WsError> {
        let payload_len = header.payload_len as usize;
        let hlen = frame::header_len(payload_len, header.masked);

        match header.opcode {
            OpCode::Ping => {
                let mut spanned = self.recv_buf.split_to(total_span);
                self.parsed = 0;
                let mut payload = spanned.split_off(hlen);
                if header.masked {
                    frame::apply_mask(&mut payload, header.mask_key);
                }
                let payload = payload.freeze();
                self.send_frame(true, OpCode::Pong, &payload)?;
                Err(WsError::NotReady)
            }
            OpCode::Pong => {
                let _ = self.recv_buf.split_to(total_span);
                self.parsed = 0;
                Err(WsError::NotReady)
            }
            OpCode::Close => {
                let _ = self.recv_buf.split_to(total_span);
                self.parsed = 0;
                let _ = self.send_close_frame(1000, "");
                let _ = self.stream.shutdown(std::net::Shutdown::Both);
                self.state = ConnState::Closed;
                Err(WsError::Closed)
            }
            OpCode::Text | OpCode::Binary | OpCode::Continue => {
                let spanned = self.recv_buf.split_to(total_span).freeze();
                self.parsed = 0;
                let mut payload = spanned.split_off(hlen);
                if header.masked {
                    let mut buf = payload.to_vec();
                    frame::apply_mask(&mut buf, header.mask_key);
                    payload = Bytes::from(buf);
                }
                self.pin_refcount = 1;
                Ok(Message {
                    opcode: header.opcode,
                    payload,
                    fin: header.fin,
                })
            }
        }
    }

    /// Bump the pin refcount so an additional logical consumer of the
    /// most recently returned payload can hold a reference. Only valid
    /// while a payload from `recv` is still outstanding.
    pub fn retain_payload(&mut self) -> Result<(), WsError> {
        if self.pin_refcount == 0 {
            return Err(WsError::InvalidArgs("no payload is currently pinned".into()));
        }
        self.pin_refcount += 1;
        Ok(())
    }

    /// Release one reference to the most recently returned payload. Once
    /// the refcount reaches zero `recv` may be called again.
    pub fn release_payload(&mut self) -> Result<(), WsError> {
        if self.pin_refcount == 0 {
            return Err(WsError::InvalidArgs("no payload is currently pinned".into()));
        }
        self.pin_refcount -= 1;
        Ok(())
    }

    /// Send a CLOSE frame (best effort) and shut down the socket.
    /// Idempotent: closing an already-`CLOSED` connection succeeds.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        if matches!(self.state, ConnState::Open | ConnState::Closing) {
            let _ = self.send_close_frame(code, reason);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnState::Closed;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// `WsError` intentionally does not derive `Clone` (its `Protocol`
/// variant wraps a `Copy` error, but keeping `Clone` off the public type
/// avoids suggesting errors are cheap to fan out); this narrow internal
/// copy is only for `last_error` bookkeeping.
fn clone_error(err: &WsError) -> WsError {
    match err {
        WsError::InvalidArgs(s) => WsError::InvalidArgs(s.clone()),
        WsError::Memory => WsError::Memory,
        WsError::Network(s) => WsError::Network(s.clone()),
        WsError::Handshake(s) => WsError::Handshake(s.clone()),
        WsError::Protocol(e) => WsError::Protocol(*e),
        WsError::Timeout => WsError::Timeout,
        WsError::Closed => WsError::Closed,
        WsError::BufferFull => WsError::BufferFull,
        WsError::NotReady => WsError::NotReady,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendable_close_codes_exclude_1010() {
        assert!(is_sendable_close_code(1000));
        assert!(is_sendable_close_code(1011));
        assert!(is_sendable_close_code(3500));
        // 1010 is a receive-only code (client-to-server per RFC 6455 §7.4.1);
        // this client must never put it on the wire itself
        assert!(!is_sendable_close_code(1010));
        assert!(!is_sendable_close_code(1005));
        assert!(!is_sendable_close_code(1006));
    }
}
