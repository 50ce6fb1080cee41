//! End-to-end handshake and frame exchange against a hand-rolled server
//! thread over a real loopback TCP socket (no mocking of the socket
//! layer).

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};

use ws_client_core::frame::build_frame;
use ws_client_core::{Config, ConnState, Connection, OpCode, WsError};

fn decode_opcode(byte0: u8) -> OpCode {
    match byte0 & 0x0F {
        0x0 => OpCode::Continue,
        0x1 => OpCode::Text,
        0x2 => OpCode::Binary,
        0x8 => OpCode::Close,
        0x9 => OpCode::Ping,
        0xA => OpCode::Pong,
        other => panic!("unexpected opcode {other:#x}"),
    }
}

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_value(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Read one request line-by-header request off `stream` and return the
/// `Sec-WebSocket-Key` value.
fn read_client_key(stream: &mut std::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).unwrap();
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Sec-WebSocket-Key:") {
            return rest.trim().to_string();
        }
    }
    panic!("no Sec-WebSocket-Key header in request: {text}");
}

/// Minimal non-masking frame reader, used only on the server side of the
/// test harness to observe what the client sent.
fn read_one_frame(stream: &mut std::net::TcpStream) -> (OpCode, bool, Vec<u8>) {
    let mut b = [0u8; 2];
    stream.read_exact(&mut b).unwrap();
    let fin = b[0] & 0x80 != 0;
    let opcode = decode_opcode(b[0]);
    let masked = b[1] & 0x80 != 0;
    let len7 = b[1] & 0x7F;
    let len: u64 = match len7 {
        126 => {
            let mut e = [0u8; 2];
            stream.read_exact(&mut e).unwrap();
            u16::from_be_bytes(e) as u64
        }
        127 => {
            let mut e = [0u8; 8];
            stream.read_exact(&mut e).unwrap();
            u64::from_be_bytes(e)
        }
        n => n as u64,
    };
    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m).unwrap();
        Some(m)
    } else {
        None
    };
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).unwrap();
    if let Some(m) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= m[i % 4];
        }
    }
    (opcode, fin, payload)
}

fn write_frame(stream: &mut std::net::TcpStream, fin: bool, opcode: OpCode, payload: &[u8]) {
    let mut out = BytesMut::new();
    build_frame(fin, opcode, None, payload, &mut out);
    stream.write_all(&out).unwrap();
}

#[test]
fn handshake_then_text_echo_and_orderly_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let key = read_client_key(&mut stream);
        let accept = accept_value(&key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).unwrap();

        // 1. client says hello, server echoes it back uppercased
        let (opcode, fin, payload) = read_one_frame(&mut stream);
        assert_eq!(opcode, OpCode::Text);
        assert!(fin);
        let text = String::from_utf8(payload).unwrap();
        assert_eq!(text, "hello");
        write_frame(&mut stream, true, OpCode::Text, text.to_uppercase().as_bytes());

        // 2. client pings, server replies pong manually then sends a real message
        let (opcode, _, payload) = read_one_frame(&mut stream);
        assert_eq!(opcode, OpCode::Ping);
        write_frame(&mut stream, true, OpCode::Pong, &payload);
        write_frame(&mut stream, true, OpCode::Text, b"after-pong");

        // 3. server initiates close, expects an echoed close back
        write_frame(&mut stream, true, OpCode::Close, &1000u16.to_be_bytes());
        let (opcode, _, _) = read_one_frame(&mut stream);
        assert_eq!(opcode, OpCode::Close);
    });

    let config = Config {
        handshake_timeout_ms: 2000,
        ..Config::default()
    };
    let mut conn = Connection::connect(&format!("ws://127.0.0.1:{port}/"), config).unwrap();
    assert_eq!(conn.get_state(), ConnState::Open);

    conn.send_text("hello").unwrap();
    let msg = conn.recv(2000).unwrap();
    assert_eq!(msg.opcode, OpCode::Text);
    assert_eq!(&msg.payload[..], b"HELLO");
    conn.release_payload().unwrap();

    // recv() while a payload is still pinned must fail with not_ready
    conn.send_ping(b"ping-payload").unwrap();

    // the PONG the server sends back is swallowed internally; recv keeps
    // returning not_ready until the following real text frame arrives
    let msg = loop {
        match conn.recv(2000) {
            Err(WsError::NotReady) => continue,
            Ok(m) => break m,
            Err(e) => panic!("unexpected error: {e}"),
        }
    };
    assert_eq!(&msg.payload[..], b"after-pong");
    conn.release_payload().unwrap();

    match conn.recv(2000) {
        Err(WsError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    assert_eq!(conn.get_state(), ConnState::Closed);

    server.join().unwrap();
}

#[test]
fn recv_rejects_reentry_while_payload_pinned() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let key = read_client_key(&mut stream);
        let accept = accept_value(&key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).unwrap();
        write_frame(&mut stream, true, OpCode::Binary, b"payload-one");
        // hold the connection open long enough for the assertions below
        thread::sleep(Duration::from_millis(300));
    });

    let mut conn = Connection::connect(&format!("ws://127.0.0.1:{port}/"), Config::default()).unwrap();
    let msg = conn.recv(2000).unwrap();
    assert_eq!(&msg.payload[..], b"payload-one");

    assert!(matches!(conn.recv(50), Err(WsError::NotReady)));

    conn.retain_payload().unwrap();
    conn.release_payload().unwrap();
    assert!(matches!(conn.recv(50), Err(WsError::NotReady)));

    conn.release_payload().unwrap();
    // now unpinned, but no more data queued, so this should time out rather
    // than succeed or error
    assert!(matches!(conn.recv(50), Err(WsError::Timeout)));

    server.join().unwrap();
}

#[test]
fn connect_rejects_wss_uri() {
    let err = Connection::connect("wss://example.com/", Config::default()).unwrap_err();
    assert!(matches!(err, WsError::InvalidArgs(_)));
}
