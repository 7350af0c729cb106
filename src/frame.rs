//! Wire framing for the measurement protocol.
//!
//! Every frame is one binary WebSocket message starting with a big-endian
//! `magic | kind` header. Control frames (probe and run bracketing) are
//! small, deliberately below a typical MTU so their own transmission time
//! does not distort processing-time measurements. Data frames ([`Frame::Chunk`])
//! are exactly `chunk_size` bytes, the size agreed by both ends in
//! [`Frame::RunStart`] before the run begins.
//!
//! Encoding and decoding are pure transforms; a malformed or mis-sized frame
//! yields a [`FramingError`] and nothing else.

use bytes::Bytes;
use thiserror::Error;

use crate::sample::{Direction, RunBound};

/// Magic number opening every frame.
pub const MAGIC: u16 = 0xA7D1;

/// Size of the `magic | kind` header.
pub const HEADER_SIZE: usize = 4;

/// Bytes of a chunk frame that are not payload (header plus sequence number).
pub const CHUNK_OVERHEAD: usize = HEADER_SIZE + 8;

const KIND_PING: u16 = 1;
const KIND_PONG: u16 = 2;
const KIND_RUN_START: u16 = 3;
const KIND_RUN_END: u16 = 4;
const KIND_CHUNK: u16 = 5;

const DIR_DOWNLOAD: u8 = 0;
const DIR_UPLOAD: u8 = 1;

const BOUND_DURATION: u8 = 0;
const BOUND_BYTES: u8 = 1;

/// A malformed or mis-sized frame.
///
/// The offending frame is discarded by the receiver; the connection is only
/// torn down when framing errors recur past the configured threshold.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid magic number {0:#06x}")]
    BadMagic(u16),
    #[error("unknown frame kind {0}")]
    UnknownKind(u16),
    #[error("frame kind {kind} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        kind: u16,
        expected: usize,
        actual: usize,
    },
    #[error("chunk frame of {actual} bytes, negotiated chunk size is {expected}")]
    WrongChunkSize { expected: usize, actual: usize },
    #[error("chunk frame received outside an active run")]
    UnexpectedChunk,
    #[error("unknown direction code {0}")]
    BadDirection(u8),
    #[error("unknown bound kind {0}")]
    BadBound(u8),
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Latency probe, initiator to responder. `t1` doubles as the nonce
    /// that matches the eventual [`Frame::Pong`] to this probe.
    Ping { t1: u64 },
    /// Probe reply: the echoed `t1` plus the responder's receive and send
    /// timestamps in its own clock domain.
    Pong { t1: u64, t2: u64, t3: u64 },
    /// Opens a throughput run and fixes its chunk size and bound.
    RunStart {
        direction: Direction,
        chunk_size: u32,
        bound: RunBound,
    },
    /// Closes a throughput run, carrying the sender-side byte total.
    RunEnd { direction: Direction, bytes_total: u64 },
    /// One fixed-size block of measurement payload.
    Chunk { sequence: u64, payload: Bytes },
}

impl Frame {
    /// Build a chunk frame of exactly `chunk_size` bytes from a payload
    /// template. The template must be `chunk_size - CHUNK_OVERHEAD` long.
    pub fn chunk(sequence: u64, payload: Bytes) -> Frame {
        Frame::Chunk { sequence, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(MAGIC.to_be_bytes());

        match self {
            Frame::Ping { t1 } => {
                buf.extend(KIND_PING.to_be_bytes());
                buf.extend(t1.to_be_bytes());
            }
            Frame::Pong { t1, t2, t3 } => {
                buf.extend(KIND_PONG.to_be_bytes());
                buf.extend(t1.to_be_bytes());
                buf.extend(t2.to_be_bytes());
                buf.extend(t3.to_be_bytes());
            }
            Frame::RunStart {
                direction,
                chunk_size,
                bound,
            } => {
                buf.extend(KIND_RUN_START.to_be_bytes());
                buf.push(dir_code(*direction));
                match bound {
                    RunBound::Duration(d) => {
                        buf.push(BOUND_DURATION);
                        buf.extend(chunk_size.to_be_bytes());
                        buf.extend((d.as_millis() as u64).to_be_bytes());
                    }
                    RunBound::Bytes(n) => {
                        buf.push(BOUND_BYTES);
                        buf.extend(chunk_size.to_be_bytes());
                        buf.extend(n.to_be_bytes());
                    }
                }
            }
            Frame::RunEnd {
                direction,
                bytes_total,
            } => {
                buf.extend(KIND_RUN_END.to_be_bytes());
                buf.push(dir_code(*direction));
                buf.extend(bytes_total.to_be_bytes());
            }
            Frame::Chunk { sequence, payload } => {
                buf.extend(KIND_CHUNK.to_be_bytes());
                buf.extend(sequence.to_be_bytes());
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Decode one frame. `chunk_size` is the size negotiated for the active
    /// run, or `None` when no run is active and chunk frames are not legal.
    pub fn decode(bytes: &[u8], chunk_size: Option<usize>) -> Result<Frame, FramingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FramingError::Truncated {
                kind: 0,
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
        if magic != MAGIC {
            return Err(FramingError::BadMagic(magic));
        }
        let kind = u16::from_be_bytes([bytes[2], bytes[3]]);
        let body = &bytes[HEADER_SIZE..];

        match kind {
            KIND_PING => {
                let t1 = read_u64(kind, body, 0, bytes.len())?;
                Ok(Frame::Ping { t1 })
            }
            KIND_PONG => {
                let t1 = read_u64(kind, body, 0, bytes.len())?;
                let t2 = read_u64(kind, body, 8, bytes.len())?;
                let t3 = read_u64(kind, body, 16, bytes.len())?;
                Ok(Frame::Pong { t1, t2, t3 })
            }
            KIND_RUN_START => {
                if body.len() < 14 {
                    return Err(FramingError::Truncated {
                        kind,
                        expected: HEADER_SIZE + 14,
                        actual: bytes.len(),
                    });
                }
                let direction = dir_from(body[0])?;
                let bound_kind = body[1];
                let chunk = u32::from_be_bytes(body[2..6].try_into().unwrap());
                let value = u64::from_be_bytes(body[6..14].try_into().unwrap());
                let bound = match bound_kind {
                    BOUND_DURATION => RunBound::Duration(std::time::Duration::from_millis(value)),
                    BOUND_BYTES => RunBound::Bytes(value),
                    other => return Err(FramingError::BadBound(other)),
                };
                Ok(Frame::RunStart {
                    direction,
                    chunk_size: chunk,
                    bound,
                })
            }
            KIND_RUN_END => {
                if body.len() < 9 {
                    return Err(FramingError::Truncated {
                        kind,
                        expected: HEADER_SIZE + 9,
                        actual: bytes.len(),
                    });
                }
                let direction = dir_from(body[0])?;
                let bytes_total = u64::from_be_bytes(body[1..9].try_into().unwrap());
                Ok(Frame::RunEnd {
                    direction,
                    bytes_total,
                })
            }
            KIND_CHUNK => {
                let Some(expected) = chunk_size else {
                    return Err(FramingError::UnexpectedChunk);
                };
                if bytes.len() != expected {
                    return Err(FramingError::WrongChunkSize {
                        expected,
                        actual: bytes.len(),
                    });
                }
                let sequence = read_u64(kind, body, 0, bytes.len())?;
                Ok(Frame::Chunk {
                    sequence,
                    payload: Bytes::copy_from_slice(&body[8..]),
                })
            }
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

fn dir_code(direction: Direction) -> u8 {
    match direction {
        Direction::Download => DIR_DOWNLOAD,
        Direction::Upload => DIR_UPLOAD,
    }
}

fn dir_from(code: u8) -> Result<Direction, FramingError> {
    match code {
        DIR_DOWNLOAD => Ok(Direction::Download),
        DIR_UPLOAD => Ok(Direction::Upload),
        other => Err(FramingError::BadDirection(other)),
    }
}

fn read_u64(kind: u16, body: &[u8], offset: usize, total: usize) -> Result<u64, FramingError> {
    body.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes(b.try_into().unwrap()))
        .ok_or(FramingError::Truncated {
            kind,
            expected: HEADER_SIZE + offset + 8,
            actual: total,
        })
}
