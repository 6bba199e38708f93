//! Binary framing for replication messages.
//!
//! Frame layout (little-endian):
//!
//! | bytes | field |
//! |---|---|
//! | 4 | magic `SCRP` |
//! | 2 | schema major |
//! | 2 | schema minor |
//! | 1 | message kind |
//! | 4 | body length |
//! | n | bincode body |

use serde::{Deserialize, Serialize};
use suspense_common::{FormatError, MagicBytes, SchemaVersion};
use thiserror::Error;
use tracing::warn;

use crate::replicator::{ClientRequest, FullStateSync, PredictionAck, ReplicationDelta};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 13;

/// Default cap on a single frame, header included.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Errors from encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Frame does not start with `SCRP`
    #[error("Invalid frame magic {0:?}")]
    InvalidMagic([u8; 4]),

    /// Peer speaks an incompatible protocol
    #[error("Incompatible protocol version {major}.{minor}")]
    VersionMismatch {
        /// Peer major version
        major: u16,
        /// Peer minor version
        minor: u16,
    },

    /// Kind byte not recognised
    #[error("Unknown message kind {0}")]
    UnknownKind(u8),

    /// More bytes are needed
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Frame exceeds the configured limit
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Body failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport went away
    #[error("Transport closed")]
    Disconnected,
}

impl From<FormatError> for WireError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::InvalidMagic { actual, .. } => Self::InvalidMagic(actual),
            FormatError::Truncated { needed, available } => Self::Truncated { needed, available },
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Everything that travels between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Server to client: incremental changes
    Delta(ReplicationDelta),
    /// Server to client: complete state
    FullState(FullStateSync),
    /// Client to server: predicted mutation
    Request(ClientRequest),
    /// Server to client: verdict on a request
    Ack(PredictionAck),
}

impl ReplicationMessage {
    /// Kind byte written into the header.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self {
            Self::Delta(_) => 1,
            Self::FullState(_) => 2,
            Self::Request(_) => 3,
            Self::Ack(_) => 4,
        }
    }
}

fn ser<T: Serialize>(value: &T) -> WireResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| WireError::Serialization(e.to_string()))
}

fn de<'a, T: Deserialize<'a>>(body: &'a [u8]) -> WireResult<T> {
    bincode::deserialize(body).map_err(|e| WireError::Serialization(e.to_string()))
}

/// Encodes one message into a complete frame.
pub fn encode_frame(message: &ReplicationMessage) -> WireResult<Vec<u8>> {
    let body = match message {
        ReplicationMessage::Delta(delta) => ser(delta)?,
        ReplicationMessage::FullState(sync) => ser(sync)?,
        ReplicationMessage::Request(request) => ser(request)?,
        ReplicationMessage::Ack(ack) => ser(ack)?,
    };
    let body_len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&MagicBytes::REPLICATION.0);
    frame.extend_from_slice(&SchemaVersion::REPLICATION.major.to_le_bytes());
    frame.extend_from_slice(&SchemaVersion::REPLICATION.minor.to_le_bytes());
    frame.push(message.kind());
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Decodes the first frame in `bytes`, returning the message and bytes consumed.
pub fn decode_frame(bytes: &[u8], max_frame: usize) -> WireResult<(ReplicationMessage, usize)> {
    MagicBytes::REPLICATION.check(bytes)?;
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let major = u16::from_le_bytes([bytes[4], bytes[5]]);
    let minor = u16::from_le_bytes([bytes[6], bytes[7]]);
    if !SchemaVersion::REPLICATION.can_read(&SchemaVersion::new(major, minor, 0)) {
        return Err(WireError::VersionMismatch { major, minor });
    }

    let kind = bytes[8];
    let body_len = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]) as usize;
    let total = HEADER_LEN + body_len;
    if total > max_frame {
        return Err(WireError::FrameTooLarge {
            size: total,
            max: max_frame,
        });
    }
    if bytes.len() < total {
        return Err(WireError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }

    let body = &bytes[HEADER_LEN..total];
    let message = match kind {
        1 => ReplicationMessage::Delta(de(body)?),
        2 => ReplicationMessage::FullState(de(body)?),
        3 => ReplicationMessage::Request(de(body)?),
        4 => ReplicationMessage::Ack(de(body)?),
        other => return Err(WireError::UnknownKind(other)),
    };
    Ok((message, total))
}

/// Reassembles messages from a byte stream of concatenated frames.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameDecoder {
    /// Creates a decoder rejecting frames larger than `max_frame`.
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame: max_frame.max(HEADER_LEN),
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete message.
    ///
    /// Returns `Ok(None)` while a frame is incomplete. Any other error
    /// discards the buffer, since the stream can no longer be trusted.
    pub fn next_message(&mut self) -> WireResult<Option<ReplicationMessage>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match decode_frame(&self.buffer, self.max_frame) {
            Ok((message, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(message))
            }
            Err(WireError::Truncated { .. }) => Ok(None),
            Err(e) => {
                warn!("Dropping {} buffered bytes: {}", self.buffer.len(), e);
                self.buffer.clear();
                Err(e)
            }
        }
    }
}
