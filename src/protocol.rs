//! Length-prefixed binary protocol.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! Frame:            u32 length || payload[length]
//! Request payload:  u32 argc || (u32 len || byte[len]) * argc
//! Response payload: u32 status || byte[] value
//! ```
//!
//! All integers are little-endian. Requests and responses share the outer frame,
//! so the same header logic serves both the server and the client.

use crate::runtime::buffer::ByteBuffer;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the length prefix and of every integer field.
pub const HEADER_SIZE: usize = 4;

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 << 20;

/// Default upper bound on the argument count of a request.
pub const DEFAULT_MAX_ARGS: usize = 200_000;

/// A parsed command vector.
pub type Request = Vec<Vec<u8>>;

/// Bounds applied while decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest accepted payload, excluding the length prefix.
    pub max_message_size: usize,
    /// Largest accepted argument count.
    pub max_args: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_args: DEFAULT_MAX_ARGS,
        }
    }
}

/// Framing errors. All of them are fatal for the connection that produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("too many arguments: {count} (max: {max})")]
    TooManyArgs { count: usize, max: usize },

    #[error("payload truncated")]
    Truncated,

    #[error("{0} trailing bytes after last argument")]
    TrailingBytes(usize),

    #[error("unknown status code: {0}")]
    UnknownStatus(u32),
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// Malformed or unrecognized command.
    Error = 1,
    NotFound = 2,
}

impl Status {
    /// Wire representation.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire status code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Error),
            2 => Some(Status::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
            Status::NotFound => write!(f, "NOT_FOUND"),
        }
    }
}

/// A command result: status plus value bytes (empty unless the command returns data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub value: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self::with_value(Vec::new())
    }

    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            value,
        }
    }

    pub fn error() -> Self {
        Self {
            status: Status::Error,
            value: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            value: Vec::new(),
        }
    }
}

/// Try to take one complete request off the front of `incoming`.
///
/// Returns `Ok(None)` without touching the buffer when the header or the body
/// has not fully arrived yet. On success exactly one frame is consumed. On error
/// nothing is consumed and the caller must close the connection.
pub fn try_parse_one(
    incoming: &mut ByteBuffer,
    limits: &FrameLimits,
) -> Result<Option<Request>, FrameError> {
    let data = incoming.data();
    let len = match frame_len(data, limits)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if data.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    let request = parse_request(&data[HEADER_SIZE..HEADER_SIZE + len], limits)?;
    incoming.consume(HEADER_SIZE + len);
    Ok(Some(request))
}

/// Decode a request payload (the bytes after the length prefix).
pub fn parse_request(payload: &[u8], limits: &FrameLimits) -> Result<Request, FrameError> {
    let mut cur = payload;
    let argc = read_u32(&mut cur)? as usize;
    if argc > limits.max_args {
        return Err(FrameError::TooManyArgs {
            count: argc,
            max: limits.max_args,
        });
    }

    // Each argument needs at least its own length field.
    let mut args = Vec::with_capacity(argc.min(cur.len() / HEADER_SIZE));
    for _ in 0..argc {
        let len = read_u32(&mut cur)? as usize;
        if cur.len() < len {
            return Err(FrameError::Truncated);
        }
        args.push(cur[..len].to_vec());
        cur.advance(len);
    }

    if !cur.is_empty() {
        return Err(FrameError::TrailingBytes(cur.len()));
    }
    Ok(args)
}

/// Frame a request for sending.
pub fn encode_request<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    let payload_len = HEADER_SIZE
        + args
            .iter()
            .map(|arg| HEADER_SIZE + arg.as_ref().len())
            .sum::<usize>();

    out.reserve(HEADER_SIZE + payload_len);
    out.put_u32_le(payload_len as u32);
    out.put_u32_le(args.len() as u32);
    for arg in args {
        let arg = arg.as_ref();
        out.put_u32_le(arg.len() as u32);
        out.put_slice(arg);
    }
}

/// Frame a response onto a connection's outgoing buffer.
pub fn encode_response(response: &Response, out: &mut ByteBuffer) {
    let payload_len = (HEADER_SIZE + response.value.len()) as u32;

    let mut header = [0u8; 2 * HEADER_SIZE];
    header[..HEADER_SIZE].copy_from_slice(&payload_len.to_le_bytes());
    header[HEADER_SIZE..].copy_from_slice(&response.status.code().to_le_bytes());

    out.append(&header);
    out.append(&response.value);
}

/// Try to decode one response frame from the front of `buf`.
///
/// Returns the response and the number of bytes it occupied, or `Ok(None)` if
/// the frame is incomplete.
pub fn parse_response(
    buf: &[u8],
    limits: &FrameLimits,
) -> Result<Option<(Response, usize)>, FrameError> {
    let len = match frame_len(buf, limits)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    let mut payload = &buf[HEADER_SIZE..HEADER_SIZE + len];
    let code = read_u32(&mut payload)?;
    let status = Status::from_code(code).ok_or(FrameError::UnknownStatus(code))?;

    Ok(Some((
        Response {
            status,
            value: payload.to_vec(),
        },
        HEADER_SIZE + len,
    )))
}

/// Read the declared payload length, enforcing the size limit.
fn frame_len(buf: &[u8], limits: &FrameLimits) -> Result<Option<usize>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut cur = buf;
    let len = cur.get_u32_le() as usize;
    if len > limits.max_message_size {
        return Err(FrameError::MessageTooLarge {
            size: len,
            max: limits.max_message_size,
        });
    }
    Ok(Some(len))
}

fn read_u32(cur: &mut &[u8]) -> Result<u32, FrameError> {
    if cur.remaining() < HEADER_SIZE {
        return Err(FrameError::Truncated);
    }
    Ok(cur.get_u32_le())
}
