//! Request and response message bodies.
//!
//! Both directions are implemented: the driver encodes requests and
//! decodes responses; test servers do the reverse.

use std::collections::HashMap;

use bytes::Bytes;

use crate::frame::{
    encode_frame, CodecError, FrameHeader, Opcode, REQUEST_VERSION, RESPONSE_VERSION,
};

/// A client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Opens the logical connection; carries startup options.
    Startup { options: HashMap<String, String> },
    /// Asks for supported options. Cheap no-op, doubles as a heartbeat.
    Options,
    /// Executes a query string.
    Query { text: String },
    /// Continues an authentication exchange.
    AuthResponse { token: Vec<u8> },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query { .. } => Opcode::Query,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
        }
    }

    /// Encodes this request into a complete frame addressed to `stream`.
    pub fn encode(&self, stream: i16) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Request::Startup { options } => put_string_map(&mut body, options),
            Request::Options => {}
            Request::Query { text } => put_long_string(&mut body, text),
            Request::AuthResponse { token } => put_bytes(&mut body, token),
        }
        encode_frame(REQUEST_VERSION, stream, self.opcode(), &body)
    }

    /// Decodes a request body. Used by the server side of tests.
    pub fn decode(header: &FrameHeader, body: &[u8]) -> Result<Self, CodecError> {
        check_length(header, body)?;
        let mut r = Reader::new(body);
        let request = match header.opcode {
            Opcode::Startup => Request::Startup {
                options: r.string_map()?,
            },
            Opcode::Options => Request::Options,
            Opcode::Query => Request::Query {
                text: r.long_string()?,
            },
            Opcode::AuthResponse => Request::AuthResponse { token: r.bytes()? },
            other => return Err(CodecError::UnknownOpcode(other as u8)),
        };
        Ok(request)
    }
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Startup accepted without authentication.
    Ready,
    /// Reply to [`Request::Options`].
    Supported { options: HashMap<String, String> },
    /// Query result payload, opaque to this layer.
    Rows { payload: Bytes },
    /// Server demands authentication with the named authenticator.
    Authenticate { authenticator: String },
    /// Authentication exchange finished successfully.
    AuthSuccess,
    /// Server-reported failure for a single request.
    Error { code: u32, message: String },
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Ready => Opcode::Ready,
            Response::Supported { .. } => Opcode::Supported,
            Response::Rows { .. } => Opcode::Result,
            Response::Authenticate { .. } => Opcode::Authenticate,
            Response::AuthSuccess => Opcode::AuthSuccess,
            Response::Error { .. } => Opcode::Error,
        }
    }

    /// Encodes this response into a complete frame addressed to `stream`.
    /// Used by the server side of tests.
    pub fn encode(&self, stream: i16) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Response::Ready | Response::AuthSuccess => {}
            Response::Supported { options } => put_string_map(&mut body, options),
            Response::Rows { payload } => body.extend_from_slice(payload),
            Response::Authenticate { authenticator } => put_string(&mut body, authenticator),
            Response::Error { code, message } => {
                body.extend_from_slice(&code.to_be_bytes());
                put_string(&mut body, message);
            }
        }
        encode_frame(RESPONSE_VERSION, stream, self.opcode(), &body)
    }

    /// Decodes a response body for the opcode carried in `header`.
    ///
    /// Fails with a malformed-frame error when the declared body length
    /// disagrees with the bytes supplied, or when a field is truncated.
    pub fn decode(header: &FrameHeader, body: &[u8]) -> Result<Self, CodecError> {
        check_length(header, body)?;
        let mut r = Reader::new(body);
        let response = match header.opcode {
            Opcode::Ready => Response::Ready,
            Opcode::AuthSuccess => Response::AuthSuccess,
            Opcode::Supported => Response::Supported {
                options: r.string_map()?,
            },
            Opcode::Result => Response::Rows {
                payload: Bytes::copy_from_slice(body),
            },
            Opcode::Authenticate => Response::Authenticate {
                authenticator: r.string()?,
            },
            Opcode::Error => Response::Error {
                code: r.u32()?,
                message: r.string()?,
            },
            other => return Err(CodecError::UnknownOpcode(other as u8)),
        };
        Ok(response)
    }
}

fn check_length(header: &FrameHeader, body: &[u8]) -> Result<(), CodecError> {
    if header.length as usize != body.len() {
        return Err(CodecError::BodyLengthMismatch {
            declared: header.length,
            actual: body.len(),
        });
    }
    Ok(())
}

// Field encodings: [string] is u16 length + utf-8, [long string] and
// [bytes] use a u32 length, [string map] is a u16 pair count.

fn put_string(buf: &mut Vec<u8>, s: &str) {
    // The length prefix is u16; longer input is truncated on a char
    // boundary so the declared length always matches the bytes written.
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&(end as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..end]);
}

fn put_long_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
    buf.extend_from_slice(b);
}

fn put_string_map(buf: &mut Vec<u8>, map: &HashMap<String, String>) {
    buf.extend_from_slice(&(map.len() as u16).to_be_bytes());
    // Deterministic encoding regardless of hash order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        put_string(buf, key);
        put_string(buf, &map[key]);
    }
}

/// Checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n - self.buf.len(),
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidString)
    }

    fn long_string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidString)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string_map(&mut self) -> Result<HashMap<String, String>, CodecError> {
        let count = self.u16()? as usize;
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.string()?;
            let value = self.string()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}
