//! Frame codec.
//!
//! Wire format:
//!
//! ```text
//! 0xAA | length | opcode | payload...
//! ```
//!
//! `length` is the payload size plus two, so a frame without payload carries
//! a length of 2 and a response (`opcode = Response`, echoed opcode, status)
//! carries 4. Opcode and payload are byte-stuffed: 0xAA becomes `AB AC` and
//! 0xAB becomes `AB AB`. The start marker is never stuffed, so a raw 0xAA on
//! the line always starts a frame.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use super::constants::*;
use super::opcode::{OpCode, OpStatus};
use crate::transport::{ByteTransport, TransportError};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid escape sequence 0xAB 0x{0:02X}")]
    InvalidEscape(u8),

    #[error("frame ends inside an escape sequence")]
    TruncatedEscape,

    #[error("malformed frame: {0}")]
    MalformedHeader(String),

    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),

    #[error("payload of {0} bytes exceeds the 253-byte frame limit")]
    PayloadTooLarge(usize),

    #[error("short read: got {received} of {expected} bytes before timing out")]
    ShortRead { expected: usize, received: usize },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Stuff `0xAA` and `0xAB` bytes.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    escape_into(data, &mut out);
    out
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        match b {
            FRAME_START => out.extend_from_slice(&[ESCAPE, ESCAPED_START]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            _ => out.push(b),
        }
    }
}

/// Byte-at-a-time unstuffing state.
#[derive(Debug, Default)]
pub struct Unescaper {
    pending: bool,
}

impl Unescaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one wire byte; yields a logical byte once one is complete.
    pub fn push(&mut self, byte: u8) -> Result<Option<u8>, FrameError> {
        if !self.pending {
            if byte == ESCAPE {
                self.pending = true;
                return Ok(None);
            }
            return Ok(Some(byte));
        }

        self.pending = false;
        match byte {
            ESCAPED_ESCAPE => Ok(Some(ESCAPE)),
            ESCAPED_START => Ok(Some(FRAME_START)),
            other => Err(FrameError::InvalidEscape(other)),
        }
    }

    /// Whether the last byte fed was an unfinished escape prefix.
    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Reverse [`escape`].
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut unescaper = Unescaper::new();
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if let Some(byte) = unescaper.push(b)? {
            out.push(byte);
        }
    }
    if unescaper.is_pending() {
        return Err(FrameError::TruncatedEscape);
    }
    Ok(out)
}

/// Encode a request frame.
pub fn encode(opcode: OpCode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(3 + payload.len() * 2);
    out.push(FRAME_START);
    out.push(payload.len() as u8 + MIN_FRAME_LENGTH);
    escape_into(&[opcode.as_u8()], &mut out);
    escape_into(payload, &mut out);
    Ok(out)
}

/// Encode a response frame as a device would send it. Raw bytes so that
/// out-of-range values can be produced.
pub fn encode_response(echoed: u8, status: u8) -> Vec<u8> {
    let mut out = vec![FRAME_START, RESPONSE_LENGTH];
    escape_into(&[OpCode::Response.as_u8(), echoed, status], &mut out);
    out
}

/// Decode one complete wire frame.
pub fn decode(wire: &[u8]) -> Result<Frame, FrameError> {
    let (&start, rest) = wire
        .split_first()
        .ok_or_else(|| FrameError::MalformedHeader("empty frame".into()))?;
    if start != FRAME_START {
        return Err(FrameError::MalformedHeader(format!(
            "start byte 0x{start:02X}"
        )));
    }
    let (&length, body) = rest
        .split_first()
        .ok_or_else(|| FrameError::MalformedHeader("missing length".into()))?;
    frame_from_body(length, &unescape(body)?)
}

fn frame_from_body(length: u8, body: &[u8]) -> Result<Frame, FrameError> {
    if length < MIN_FRAME_LENGTH {
        return Err(FrameError::MalformedHeader(format!("length {length}")));
    }
    if body.len() != length as usize - 1 {
        return Err(FrameError::MalformedHeader(format!(
            "length {length} but {} body bytes",
            body.len()
        )));
    }
    let opcode = OpCode::try_from(body[0]).map_err(FrameError::UnknownOpCode)?;
    Ok(Frame {
        opcode,
        payload: body[1..].to_vec(),
    })
}

/// Write one request frame.
pub fn write_frame<T: ByteTransport + ?Sized>(
    transport: &mut T,
    opcode: OpCode,
    payload: &[u8],
) -> Result<(), FrameError> {
    let wire = encode(opcode, payload)?;
    trace!(op = %opcode, frame = %hex::encode_upper(&wire), "<");
    transport.write_all(&wire)?;
    Ok(())
}

fn read_byte<T: ByteTransport + ?Sized>(
    transport: &mut T,
    deadline: Instant,
) -> Result<Option<u8>, TransportError> {
    let mut byte = [0u8; 1];
    loop {
        if transport.read(&mut byte)? == 1 {
            return Ok(Some(byte[0]));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Read up to `max_len` unframed bytes, stopping early at `stop`.
///
/// Returns whatever arrived before `timeout`, possibly nothing.
pub fn read_raw<T: ByteTransport + ?Sized>(
    transport: &mut T,
    max_len: usize,
    timeout: Duration,
    stop: Option<u8>,
) -> Result<Vec<u8>, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    while out.len() < max_len {
        let Some(byte) = read_byte(transport, deadline)? else {
            break;
        };
        out.push(byte);
        if Some(byte) == stop {
            break;
        }
    }
    if !out.is_empty() {
        trace!(bytes = %hex::encode_upper(&out), "> raw");
    }
    Ok(out)
}

/// Read exactly `len` unstuffed bytes before `deadline`.
fn read_logical<T: ByteTransport + ?Sized>(
    transport: &mut T,
    len: usize,
    deadline: Instant,
    expected: usize,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let mut unescaper = Unescaper::new();
    let target = out.len() + len;
    while out.len() < target {
        let Some(b) = read_byte(transport, deadline)? else {
            return Err(FrameError::ShortRead {
                expected,
                received: out.len(),
            });
        };
        if let Some(byte) = unescaper.push(b)? {
            out.push(byte);
        }
    }
    Ok(())
}

/// Receive one frame within `timeout`. Bytes preceding the start marker are
/// discarded.
pub fn read_frame<T: ByteTransport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Frame, FrameError> {
    let deadline = Instant::now() + timeout;

    let mut skipped = 0usize;
    loop {
        match read_byte(transport, deadline)? {
            Some(FRAME_START) => break,
            Some(_) => skipped += 1,
            None => {
                return Err(FrameError::ShortRead {
                    expected: RESPONSE_FRAME_SIZE,
                    received: 0,
                });
            }
        }
    }
    if skipped > 0 {
        debug!(skipped, "Discarded bytes before frame start");
    }

    let Some(length) = read_byte(transport, deadline)? else {
        return Err(FrameError::ShortRead {
            expected: RESPONSE_FRAME_SIZE,
            received: 1,
        });
    };
    if length < MIN_FRAME_LENGTH {
        return Err(FrameError::MalformedHeader(format!("length {length}")));
    }

    let mut logical = vec![FRAME_START, length];
    let total = length as usize + 1;
    read_logical(transport, length as usize - 1, deadline, total, &mut logical)?;
    trace!(frame = %hex::encode_upper(&logical), ">");

    frame_from_body(length, &logical[2..])
}

/// Body of a Response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Opcode of the request being answered, as sent by the device.
    pub echoed: u8,
    pub status: u8,
}

impl Response {
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.opcode != OpCode::Response {
            return Err(FrameError::MalformedHeader(format!(
                "expected {} frame, got {}",
                OpCode::Response,
                frame.opcode
            )));
        }
        match frame.payload.as_slice() {
            &[echoed, status] => Ok(Self { echoed, status }),
            other => Err(FrameError::MalformedHeader(format!(
                "response payload of {} bytes",
                other.len()
            ))),
        }
    }

    pub fn opcode(&self) -> Result<OpCode, u8> {
        OpCode::try_from(self.echoed)
    }

    pub fn op_status(&self) -> Result<OpStatus, u8> {
        OpStatus::try_from(self.status)
    }
}

/// Receive a Response frame.
pub fn read_response<T: ByteTransport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Response, FrameError> {
    let frame = read_frame(transport, timeout)?;
    Response::from_frame(&frame)
}
