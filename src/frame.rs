//! Frame opcodes, header bit layout, and the client-side frame builder.

use bytes::{BufMut, BytesMut};

use crate::errors::ProtocolError;

/// Defines the interpretation of the payload data (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// 0x0, continuation of a fragmented message
    Continue,
    /// 0x1, text payload, must be valid UTF-8
    Text,
    /// 0x2, binary payload
    Binary,
    /// 0x8, connection close
    Close,
    /// 0x9, ping
    Ping,
    /// 0xA, pong
    Pong,
}

impl OpCode {
    /// numeric opcode used on the wire
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// control frames (Close/Ping/Pong) always carry FIN=1 and payload <= 125
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// data frames (Text/Binary/Continue) may fragment across frames
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

/// Decode a raw opcode nibble, rejecting reserved values (0x3-0x7, 0xB-0xF).
pub(crate) fn parse_opcode(byte0: u8) -> Result<OpCode, ProtocolError> {
    match byte0 & 0x0F {
        0x0 => Ok(OpCode::Continue),
        0x1 => Ok(OpCode::Text),
        0x2 => Ok(OpCode::Binary),
        0x8 => Ok(OpCode::Close),
        0x9 => Ok(OpCode::Ping),
        0xA => Ok(OpCode::Pong),
        other => Err(ProtocolError::ReservedOpcode(other)),
    }
}

/// XOR a payload in place against a 4-byte masking key, 4 bytes at a time
/// where the buffer length allows it.
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);
    let (chunks, rem) = buf.split_at_mut(buf.len() - buf.len() % 4);
    for chunk in chunks.chunks_exact_mut(4) {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let masked = (word ^ key).to_ne_bytes();
        chunk.copy_from_slice(&masked);
    }
    let key_bytes = mask;
    for (i, b) in rem.iter_mut().enumerate() {
        *b ^= key_bytes[i % 4];
    }
}

/// Encode a single frame (header + masked payload when `mask` is `Some`)
/// into `out`. Returns the number of bytes written, or `None` if `out`
/// does not have enough spare capacity for the header plus payload.
///
/// The client role always masks; a fresh `mask` should be drawn per call
/// by the caller (see [`crate::handshake::generate_mask_key`]).
pub fn build_frame(
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: &[u8],
    out: &mut BytesMut,
) -> usize {
    let start = out.len();
    let needed = header_len(payload.len(), mask.is_some()) + payload.len();
    out.reserve(needed);

    let mut byte0 = opcode.as_u8();
    if fin {
        byte0 |= 0x80;
    }
    out.put_u8(byte0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len <= 125 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    if let Some(key) = mask {
        out.extend_from_slice(&key);
        let payload_start = out.len();
        out.extend_from_slice(payload);
        apply_mask(&mut out[payload_start..], key);
    } else {
        out.extend_from_slice(payload);
    }

    out.len() - start
}

/// Header size in bytes for a given payload length and masked flag,
/// not counting the payload itself.
pub(crate) fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = if payload_len <= 125 {
        2
    } else if payload_len <= u16::MAX as usize {
        4
    } else {
        10
    };
    len_bytes + if masked { 4 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmasked_short_binary_frame() {
        let mut out = BytesMut::new();
        let n = build_frame(true, OpCode::Binary, None, &[1, 2, 3], &mut out);
        assert_eq!(n, 5);
        assert_eq!(&out[..], &[0x82, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn extended_16_length() {
        let payload = vec![0xABu8; 200];
        let mut out = BytesMut::new();
        build_frame(true, OpCode::Binary, None, &payload, &mut out);
        assert_eq!(&out[..4], &[0x82, 0x7E, 0x00, 0xC8]);
        assert!(out[4..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn masking_round_trips() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut data = b"hello world, this is more than four bytes".to_vec();
        let original = data.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn opcode_rejects_reserved_values() {
        assert!(parse_opcode(0x88).is_ok());
        assert!(parse_opcode(0x88).unwrap() == OpCode::Close);
        assert!(parse_opcode(0x83 & 0xF0 | 0x3).is_err());
        assert!(parse_opcode(0xB).is_err());
    }
}
