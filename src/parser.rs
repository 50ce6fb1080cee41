//! Incremental, zero-copy frame parser.
//!
//! [`Parser::feed`] consumes bytes from a caller-supplied slice and
//! either asks for more data, reports a fully decoded frame (with its
//! payload borrowed from the input slice), or reports a protocol
//! violation. Feeding the same bytes in any chunk sizes yields the same
//! sequence of frames (see the `incremental_equivalence` property test).

use crate::errors::ProtocolError;
use crate::frame::{parse_opcode, OpCode};
use crate::utf8::Utf8Validator;

const MAX_HEADER_LEN: usize = 14; // 2 base + 8 extended length + 4 mask

/// Valid application-settable close codes, plus the 3000-4999 range
/// which is accepted but not individually enumerated.
fn is_valid_close_code(code: u16) -> bool {
    matches!(
        code,
        1000 | 1001 | 1002 | 1003 | 1007 | 1008 | 1009 | 1010 | 1011
    ) || (3000..=4999).contains(&code)
}

/// A decoded frame header, not including the payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub mask_key: [u8; 4],
    pub payload_len: u64,
}

/// One fully parsed frame, with its payload borrowed from the buffer
/// `feed` was called with.
#[derive(Debug)]
pub struct ParsedFrame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

/// Result of a single [`Parser::feed`] call.
pub enum FeedStatus<'a> {
    /// not enough bytes yet; `consumed` bytes were accepted from the input
    NeedMore { consumed: usize },
    /// a complete frame was decoded, consuming `consumed` bytes total
    Frame {
        frame: ParsedFrame<'a>,
        consumed: usize,
    },
    /// a rule violation; the connection must be torn down
    Err(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Payload,
}

/// Incremental parser state for one connection's inbound stream.
pub struct Parser {
    max_frame_size: usize,

    phase: Phase,
    header_buf: [u8; MAX_HEADER_LEN],
    header_have: usize,
    header_needed: usize,
    header: Option<FrameHeader>,
    payload_read: u64,

    in_fragmented_message: bool,
    first_fragment_opcode: OpCode,
    text_validator: Utf8Validator,

    // control frames are capped at 125 bytes; buffered in full so the
    // close-code/UTF-8 checks below can run even when the payload
    // arrives split across several `feed` calls
    control_buf: [u8; 125],
    control_have: usize,
}

impl Parser {
    /// Create a parser that rejects any frame whose payload exceeds
    /// `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            phase: Phase::Header,
            header_buf: [0u8; MAX_HEADER_LEN],
            header_have: 0,
            header_needed: 2,
            header: None,
            payload_read: 0,
            in_fragmented_message: false,
            first_fragment_opcode: OpCode::Binary,
            text_validator: Utf8Validator::new(),
            control_buf: [0u8; 125],
            control_have: 0,
        }
    }

    fn reset_for_next_frame(&mut self) {
        self.phase = Phase::Header;
        self.header_have = 0;
        self.header_needed = 2;
        self.header = None;
        self.payload_read = 0;
        self.control_have = 0;
    }

    /// Feed more bytes into the parser. `input` is only ever read from,
    /// never retained past this call except through the borrow on the
    /// returned [`ParsedFrame`].
    pub fn feed<'a>(&mut self, input: &'a [u8]) -> FeedStatus<'a> {
        let mut offset = 0;

        if self.phase == Phase::Header {
            match self.feed_header(&input[offset..]) {
                Ok(n) => offset += n,
                Err(e) => return FeedStatus::Err(e),
            }
            if self.phase == Phase::Header {
                return FeedStatus::NeedMore { consumed: offset };
            }
        }

        let header = self.header.expect("payload phase implies decoded header");
        let remaining = (header.payload_len - self.payload_read) as usize;
        let available = input.len() - offset;
        let take = remaining.min(available);
        let chunk = &input[offset..offset + take];

        if matches!(header.opcode, OpCode::Text) || self.validating_continuation(&header) {
            if !self.text_validator.feed(chunk) {
                return FeedStatus::Err(ProtocolError::InvalidUtf8);
            }
        }
        if header.opcode.is_control() {
            self.control_buf[self.control_have..self.control_have + chunk.len()]
                .copy_from_slice(chunk);
            self.control_have += chunk.len();
        }

        self.payload_read += take as u64;
        offset += take;

        if self.payload_read < header.payload_len {
            return FeedStatus::NeedMore { consumed: offset };
        }

        // full payload observed across however many feed() calls it took;
        // run the frame-completion checks that need the whole payload
        let control_payload = self.control_buf[..self.control_have].to_vec();
        if let Err(e) = self.finish_frame_checks(&header, &control_payload) {
            return FeedStatus::Err(e);
        }

        let consumed = offset;
        self.reset_for_next_frame();
        FeedStatus::Frame {
            frame: ParsedFrame {
                header,
                payload: chunk,
            },
            consumed,
        }
    }

    fn validating_continuation(&self, header: &FrameHeader) -> bool {
        // by the time this runs, `decode_completed_header` has already
        // cleared `in_fragmented_message` for a final (FIN=1) frame, so
        // this only depends on which message the continuation belongs to
        header.opcode == OpCode::Continue && self.first_fragment_opcode == OpCode::Text
    }

    /// Accumulate header bytes; on completion, decodes into `self.header`
    /// and flips `self.phase` to `Payload`. Returns the number of bytes
    /// consumed from `input`.
    fn feed_header(&mut self, input: &[u8]) -> Result<usize, ProtocolError> {
        let mut offset = 0;

        // stage 1: first 2 bytes, which tell us how many more we need
        if self.header_have < 2 {
            let need = 2 - self.header_have;
            let take = need.min(input.len() - offset);
            self.header_buf[self.header_have..self.header_have + take]
                .copy_from_slice(&input[offset..offset + take]);
            self.header_have += take;
            offset += take;
            if self.header_have < 2 {
                return Ok(offset);
            }

            let byte0 = self.header_buf[0];
            let byte1 = self.header_buf[1];
            if byte0 & 0x70 != 0 {
                return Err(ProtocolError::ReservedBitSet);
            }
            let opcode = parse_opcode(byte0)?;
            let masked = byte1 & 0x80 != 0;
            let len7 = byte1 & 0x7F;

            self.header_needed = 2
                + match len7 {
                    126 => 2,
                    127 => 8,
                    _ => 0,
                }
                + if masked { 4 } else { 0 };

            if opcode.is_control() {
                if byte0 & 0x80 == 0 {
                    return Err(ProtocolError::FragmentedControlFrame);
                }
                if len7 > 125 {
                    return Err(ProtocolError::ControlFrameTooLarge(len7 as usize));
                }
            }
        }

        // stage 2: any remaining extended-length / mask-key bytes
        if self.header_have < self.header_needed {
            let need = self.header_needed - self.header_have;
            let take = need.min(input.len() - offset);
            self.header_buf[self.header_have..self.header_have + take]
                .copy_from_slice(&input[offset..offset + take]);
            self.header_have += take;
            offset += take;
            if self.header_have < self.header_needed {
                return Ok(offset);
            }
        }

        self.header = Some(self.decode_completed_header()?);
        self.phase = Phase::Payload;
        Ok(offset)
    }

    fn decode_completed_header(&mut self) -> Result<FrameHeader, ProtocolError> {
        let byte0 = self.header_buf[0];
        let byte1 = self.header_buf[1];
        let fin = byte0 & 0x80 != 0;
        let opcode = parse_opcode(byte0)?;
        let masked = byte1 & 0x80 != 0;
        let len7 = byte1 & 0x7F;

        let mut idx = 2;
        let payload_len: u64 = match len7 {
            0..=125 => len7 as u64,
            126 => {
                let v = u16::from_be_bytes([self.header_buf[idx], self.header_buf[idx + 1]]);
                idx += 2;
                v as u64
            }
            127 => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&self.header_buf[idx..idx + 8]);
                idx += 8;
                let v = u64::from_be_bytes(arr);
                if v & (1 << 63) != 0 {
                    return Err(ProtocolError::LengthOverflow);
                }
                v
            }
            _ => unreachable!("7-bit field"),
        };

        let mut mask_key = [0u8; 4];
        if masked {
            mask_key.copy_from_slice(&self.header_buf[idx..idx + 4]);
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(ProtocolError::PayloadTooLarge(payload_len, self.max_frame_size));
        }

        // fragmentation bookkeeping happens here, once per frame, before
        // any payload bytes are consumed
        match opcode {
            OpCode::Continue => {
                if !self.in_fragmented_message {
                    return Err(ProtocolError::UnexpectedContinuation);
                }
                if fin {
                    self.in_fragmented_message = false;
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.in_fragmented_message {
                    return Err(ProtocolError::DataFrameDuringFragment);
                }
                if !fin {
                    self.in_fragmented_message = true;
                    self.first_fragment_opcode = opcode;
                    if opcode == OpCode::Text {
                        self.text_validator = Utf8Validator::new();
                    }
                } else if opcode == OpCode::Text {
                    self.text_validator = Utf8Validator::new();
                }
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                if payload_len == 1 && opcode == OpCode::Close {
                    return Err(ProtocolError::InvalidCloseLen(1));
                }
            }
        }

        Ok(FrameHeader {
            fin,
            opcode,
            masked,
            mask_key,
            payload_len,
        })
    }

    fn finish_frame_checks(
        &mut self,
        header: &FrameHeader,
        full_payload: &[u8],
    ) -> Result<(), ProtocolError> {
        match header.opcode {
            OpCode::Text => {
                if header.fin && !self.text_validator.is_complete() {
                    return Err(ProtocolError::InvalidUtf8);
                }
            }
            OpCode::Continue => {
                if header.fin
                    && self.first_fragment_opcode == OpCode::Text
                    && !self.text_validator.is_complete()
                {
                    return Err(ProtocolError::InvalidUtf8);
                }
            }
            OpCode::Close => {
                if header.payload_len >= 2 {
                    let code = u16::from_be_bytes([full_payload[0], full_payload[1]]);
                    if !is_valid_close_code(code) {
                        return Err(ProtocolError::InvalidCloseCode(code));
                    }
                    if !crate::utf8::validate_complete(&full_payload[2..]) {
                        return Err(ProtocolError::InvalidUtf8);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
