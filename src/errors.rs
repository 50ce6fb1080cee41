use thiserror::Error;

/// Top level error type returned from every public operation.
///
/// Each variant maps to one of the error classes in the engine's error
/// taxonomy; [`error_string`](crate::error_string) turns any value of this
/// type into the stable, lower-case label a host application can log or
/// match on without depending on the `Display` wording.
#[derive(Debug, Error)]
pub enum WsError {
    /// malformed URI, null parameters, unsupported scheme, oversized input
    /// for a fixed buffer.
    #[error("invalid args: {0}")]
    InvalidArgs(String),

    /// allocation failure.
    #[error("memory")]
    Memory,

    /// socket creation/connect/read/write failure, EOF before handshake
    /// complete or mid-frame.
    #[error("network error: {0}")]
    Network(String),

    /// 101 status absent, missing/mismatching required header, timeout
    /// during handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// parser rule violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// readiness wait exceeded the caller-supplied or configured timeout.
    #[error("timeout")]
    Timeout,

    /// peer closed (orderly CLOSE received, or socket EOF after OPEN).
    #[error("closed")]
    Closed,

    /// outgoing frame larger than the internal scratch buffer allows.
    #[error("buffer full")]
    BufferFull,

    /// parser needs more bytes, payload currently pinned, or a control
    /// frame was consumed internally; transient, does not mutate state.
    #[error("not ready")]
    NotReady,
}

impl From<std::io::Error> for WsError {
    fn from(e: std::io::Error) -> Self {
        WsError::Network(e.to_string())
    }
}

/// Frame-parser rule violations, always surfaced wrapped in
/// [`WsError::Protocol`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bit set")]
    ReservedBitSet,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload too large ({0} bytes)")]
    ControlFrameTooLarge(usize),
    #[error("continuation frame without an open fragmented message")]
    UnexpectedContinuation,
    #[error("data frame opcode while a fragmented message is open")]
    DataFrameDuringFragment,
    #[error("payload length {0} exceeds configured max frame size {1}")]
    PayloadTooLarge(u64, usize),
    #[error("invalid close frame payload length {0}")]
    InvalidCloseLen(usize),
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 payload")]
    InvalidUtf8,
    #[error("extended length high bit set")]
    LengthOverflow,
}

/// Returns a stable, short, lower-case label for an error value.
///
/// This is the "FFI-friendly" sibling of `WsError`'s `Display` impl: the
/// wording above may grow detail over time, but this string will not.
pub fn error_string(err: &WsError) -> &'static str {
    match err {
        WsError::InvalidArgs(_) => "invalid_args",
        WsError::Memory => "memory",
        WsError::Network(_) => "network",
        WsError::Handshake(_) => "handshake",
        WsError::Protocol(_) => "protocol",
        WsError::Timeout => "timeout",
        WsError::Closed => "closed",
        WsError::BufferFull => "buffer_full",
        WsError::NotReady => "not_ready",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(error_string(&WsError::Timeout), "timeout");
        assert_eq!(
            error_string(&WsError::Protocol(ProtocolError::InvalidUtf8)),
            "protocol"
        );
        assert_eq!(error_string(&WsError::NotReady), "not_ready");
    }
}
