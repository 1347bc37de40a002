//! basalt-protocol — wire protocol for the Basalt distributed database.
//!
//! Pure frame codec: no I/O, no shared state. Frames carry a small
//! stream identifier so that many requests can be outstanding on one
//! connection at once; responses are matched back to requests by stream
//! id, never by arrival order.
//!
//! Frame layout (header is [`HEADER_LEN`] bytes, all integers big-endian):
//!
//! ```text
//! version:u8 | flags:u8 | stream:i16 | opcode:u8 | length:u32 | body
//! ```
//!
//! The high bit of the version byte marks direction: `0x02` is a
//! request, `0x82` a response. Protocol version 2 is the only version
//! this codec implements.

pub mod frame;
pub mod message;

pub use frame::{
    decode_header, CodecError, FrameHeader, Opcode, HEADER_LEN, MAX_FRAME_LEN, MAX_STREAMS,
    PROTOCOL_VERSION,
};
pub use message::{Request, Response};
