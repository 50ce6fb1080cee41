//! Client key generation, request building, and response validation for
//! the HTTP/1.1 Upgrade handshake (RFC 6455 §1.3, §4.1).

use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::io::Write;

use crate::errors::WsError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Extra request headers an embedder may supply alongside the mandatory
/// upgrade headers.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions<'a> {
    pub user_agent: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub protocol: Option<&'a str>,
}

/// Draw 16 random bytes for the `Sec-WebSocket-Key`, preferring the
/// platform CSPRNG and falling back to a time-seeded mix if it is
/// unavailable (embedded targets without a `getrandom` backend).
fn random_16_bytes() -> [u8; 16] {
    let mut buf = [0u8; 16];
    if getrandom::getrandom(&mut buf).is_ok() {
        return buf;
    }
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = ((seed >> (i % 16)) ^ (seed >> ((i + 7) % 16))) as u8;
    }
    buf
}

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, standard
/// base64, always exactly 24 characters.
pub fn generate_client_key() -> String {
    BASE64.encode(random_16_bytes())
}

/// Generate a fresh 4-byte client-to-server masking key.
pub fn generate_mask_key() -> [u8; 4] {
    let bytes = random_16_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// `base64(SHA1(key ++ GUID))`, the value the server must echo back in
/// `Sec-WebSocket-Accept`.
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Write an HTTP/1.1 Upgrade request into `out`. Returns `Err` if `out`
/// does not have room for it (the buffer is not grown implicitly, so a
/// caller using a fixed scratch buffer gets a clean error instead of an
/// allocation).
pub fn build_request(
    out: &mut Vec<u8>,
    host: &str,
    port: u16,
    path: &str,
    key: &str,
    opts: &HandshakeOptions,
) -> Result<usize, WsError> {
    let start = out.len();
    let res = write_request_headers(out, host, port, path, key, opts);
    res.map_err(|e| WsError::InvalidArgs(format!("handshake request buffer: {e}")))?;
    Ok(out.len() - start)
}

fn write_request_headers(
    out: &mut Vec<u8>,
    host: &str,
    port: u16,
    path: &str,
    key: &str,
    opts: &HandshakeOptions,
) -> std::io::Result<()> {
    write!(out, "GET {path} HTTP/1.1\r\n")?;
    write!(out, "Host: {host}:{port}\r\n")?;
    write!(out, "Upgrade: websocket\r\n")?;
    write!(out, "Connection: Upgrade\r\n")?;
    write!(out, "Sec-WebSocket-Key: {key}\r\n")?;
    write!(out, "Sec-WebSocket-Version: 13\r\n")?;
    if let Some(ua) = opts.user_agent.filter(|s| !s.is_empty()) {
        write!(out, "User-Agent: {ua}\r\n")?;
    }
    if let Some(origin) = opts.origin.filter(|s| !s.is_empty()) {
        write!(out, "Origin: {origin}\r\n")?;
    }
    if let Some(proto) = opts.protocol.filter(|s| !s.is_empty()) {
        write!(out, "Sec-WebSocket-Protocol: {proto}\r\n")?;
    }
    write!(out, "\r\n")
}

/// Case-insensitive lookup of an HTTP header's first value, anchored to
/// the start of the header name (not a substring match anywhere in the
/// response).
fn find_header<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

fn contains_ci(haystack: &[u8], needle: &str) -> bool {
    let haystack = String::from_utf8_lossy(haystack).to_lowercase();
    haystack.contains(&needle.to_lowercase())
}

/// Validate a complete HTTP response (status line through the blank line
/// terminating headers) against the expected accept value derived from
/// the client key used to build the request.
pub fn validate_response(response: &[u8], key: &str) -> Result<(), WsError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp
        .parse(response)
        .map_err(|e| WsError::Handshake(format!("malformed response: {e}")))?;
    if status.is_partial() {
        return Err(WsError::Handshake("incomplete response".into()));
    }
    if resp.version != Some(1) {
        return Err(WsError::Handshake(format!(
            "expected HTTP/1.1, got version {:?}",
            resp.version
        )));
    }
    if resp.code != Some(101) {
        return Err(WsError::Handshake(format!(
            "expected 101, got {:?}",
            resp.code
        )));
    }

    let upgrade = find_header(resp.headers, "Upgrade")
        .ok_or_else(|| WsError::Handshake("missing Upgrade header".into()))?;
    if !contains_ci(upgrade, "websocket") {
        return Err(WsError::Handshake("Upgrade header missing 'websocket'".into()));
    }

    let connection = find_header(resp.headers, "Connection")
        .ok_or_else(|| WsError::Handshake("missing Connection header".into()))?;
    if !contains_ci(connection, "upgrade") {
        return Err(WsError::Handshake(
            "Connection header missing 'upgrade'".into(),
        ));
    }

    let accept = find_header(resp.headers, "Sec-WebSocket-Accept")
        .ok_or_else(|| WsError::Handshake("missing Sec-WebSocket-Accept header".into()))?;
    let accept = std::str::from_utf8(accept)
        .map_err(|_| WsError::Handshake("Sec-WebSocket-Accept is not valid UTF-8".into()))?
        .trim();
    let expected = compute_accept(key);
    if accept != expected {
        return Err(WsError::Handshake(format!(
            "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
        )));
    }

    Ok(())
}
