//! Minimal `ws://host[:port]/path` URI parsing. `wss://` and any other
//! scheme are rejected — TLS is an external collaborator this core does
//! not implement.

use crate::errors::WsError;

/// Parsed pieces of a `ws://` URI, with defaults already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUri {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parse and validate a client connection target.
pub fn parse(uri: &str) -> Result<WsUri, WsError> {
    let parsed: http::Uri = uri
        .parse()
        .map_err(|e| WsError::InvalidArgs(format!("invalid uri `{uri}`: {e}")))?;

    match parsed.scheme_str() {
        Some("ws") => {}
        Some("wss") => {
            return Err(WsError::InvalidArgs(
                "wss:// is unsupported; this core is plaintext-only".into(),
            ))
        }
        Some(other) => return Err(WsError::InvalidArgs(format!("unsupported scheme `{other}`"))),
        None => return Err(WsError::InvalidArgs("missing scheme".into())),
    }

    let host = parsed
        .host()
        .ok_or_else(|| WsError::InvalidArgs("missing host".into()))?
        .to_string();
    let port = parsed.port_u16().unwrap_or(80);
    let path = match parsed.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
        _ => "/".to_string(),
    };

    Ok(WsUri { host, port, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_path() {
        let u = parse("ws://example.com").unwrap();
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 80);
        assert_eq!(u.path, "/");
    }

    #[test]
    fn explicit_port_and_path() {
        let u = parse("ws://example.com:9001/chat").unwrap();
        assert_eq!(u.port, 9001);
        assert_eq!(u.path, "/chat");
    }

    #[test]
    fn rejects_wss() {
        assert!(parse("wss://example.com").is_err());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(parse("http://example.com").is_err());
    }
}
