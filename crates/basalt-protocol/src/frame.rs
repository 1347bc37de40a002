//! Frame header encoding and decoding.

use thiserror::Error;

/// The only protocol version this codec implements.
pub const PROTOCOL_VERSION: u8 = 2;

/// Direction bit: set on frames travelling server → client.
const RESPONSE_DIRECTION: u8 = 0x80;

/// Version byte for client → server frames.
pub const REQUEST_VERSION: u8 = PROTOCOL_VERSION;

/// Version byte for server → client frames.
pub const RESPONSE_VERSION: u8 = RESPONSE_DIRECTION | PROTOCOL_VERSION;

/// Fixed size of a frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// Stream-id space per connection: ids 0..128 may be outstanding at once.
pub const MAX_STREAMS: usize = 128;

/// Upper bound on a frame body. A header declaring more than this is
/// rejected before anything is allocated for it.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unsupported protocol version byte {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("declared frame body of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge(u32),

    #[error("frame body length mismatch: header declares {declared} bytes, got {actual}")]
    BodyLengthMismatch { declared: u32, actual: usize },

    #[error("frame body truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid utf-8 in string field")]
    InvalidString,
}

impl CodecError {
    /// Whether this error is confined to a single frame's bytes.
    /// Errors that leave the stream position untrustworthy (a version
    /// this codec does not speak, a body too large to read past) are
    /// excluded.
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            CodecError::UnsupportedVersion(_) | CodecError::FrameTooLarge(_)
        )
    }
}

/// Message opcodes. Values are fixed by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(CodecError::UnknownOpcode(other)),
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    /// Whether the direction bit marks this as a server → client frame.
    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION != 0
    }
}

/// Decodes a frame header from exactly [`HEADER_LEN`] bytes.
///
/// Fails with [`CodecError::UnsupportedVersion`] when the version byte
/// (direction bit stripped) is not version 2.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<FrameHeader, CodecError> {
    let version = buf[0];
    if version & !RESPONSE_DIRECTION != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = buf[1];
    let stream = i16::from_be_bytes([buf[2], buf[3]]);
    let opcode = Opcode::from_u8(buf[4])?;
    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    if length as usize > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(length));
    }
    Ok(FrameHeader {
        version,
        flags,
        stream,
        opcode,
        length,
    })
}

/// Encodes a frame header followed by `body` into a single buffer.
pub fn encode_frame(version: u8, stream: i16, opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.push(version);
    buf.push(0); // flags
    buf.extend_from_slice(&stream.to_be_bytes());
    buf.push(opcode as u8);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}
