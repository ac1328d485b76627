use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{FileMetadata, ProtocolError};

/// Separates a chunk header from its payload.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Small JSON control messages exchanged around the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Announces the file; precedes every chunk of a session.
    Metadata { metadata: FileMetadata },
    /// Sender has queued every chunk of the current round.
    Complete,
    /// Receiver reassembled and verified the file.
    Ack,
    /// Receiver is missing the listed chunk indices (sorted).
    Nack {
        #[serde(rename = "missingChunks")]
        missing_chunks: Vec<u32>,
    },
    /// Either side aborted the session.
    Error {
        error: String,
        /// Absent on frames from peers that do not tag aborts; such an
        /// ERROR ends whatever transfer is in flight in either direction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<ErrorScope>,
    },
}

/// Which transfer an ERROR ends, seen from the side that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    /// The author stopped sending its file.
    Send,
    /// The author refused or dropped the file it was receiving.
    Receive,
}

impl ControlFrame {
    /// An ERROR tagged with the author's side of the transfer.
    pub fn error(scope: ErrorScope, reason: impl Into<String>) -> Self {
        ControlFrame::Error {
            error: reason.into(),
            scope: Some(scope),
        }
    }

    /// Serializes this frame to its wire bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Short lowercase name, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Metadata { .. } => "metadata",
            ControlFrame::Complete => "complete",
            ControlFrame::Ack => "ack",
            ControlFrame::Nack { .. } => "nack",
            ControlFrame::Error { .. } => "error",
        }
    }
}

/// Header preceding the payload of a chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    /// Total chunk count as computed by the sender. Authoritative.
    pub total_chunks: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HeaderRepr {
    Chunk {
        index: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },
}

impl From<ChunkHeader> for HeaderRepr {
    fn from(h: ChunkHeader) -> Self {
        HeaderRepr::Chunk {
            index: h.index,
            total_chunks: h.total_chunks,
        }
    }
}

impl From<HeaderRepr> for ChunkHeader {
    fn from(r: HeaderRepr) -> Self {
        let HeaderRepr::Chunk {
            index,
            total_chunks,
        } = r;
        ChunkHeader {
            index,
            total_chunks,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk { header: ChunkHeader, payload: Bytes },
}

impl Frame {
    /// Serializes this frame to its wire bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Frame::Control(control) => control.encode(),
            Frame::Chunk { header, payload } => encode_chunk(*header, payload),
        }
    }

    /// Parses a frame received from the data channel.
    ///
    /// Splits on the first delimiter only; the payload may contain any
    /// number of `0x0A` bytes. The payload is a zero-copy slice of `data`.
    pub fn decode(data: Bytes) -> Result<Frame, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        match data.iter().position(|&b| b == FRAME_DELIMITER) {
            Some(pos) => {
                let repr: HeaderRepr = serde_json::from_slice(&data[..pos])
                    .map_err(|e| ProtocolError::InvalidHeader(e.to_string()))?;
                let header = ChunkHeader::from(repr);
                if header.index >= header.total_chunks {
                    return Err(ProtocolError::InvalidHeader(format!(
                        "index {} out of range for {} chunks",
                        header.index, header.total_chunks
                    )));
                }
                Ok(Frame::Chunk {
                    header,
                    payload: data.slice(pos + 1..),
                })
            }
            None => Ok(Frame::Control(serde_json::from_slice(&data)?)),
        }
    }
}

/// Builds a chunk frame: JSON header, one delimiter byte, raw payload.
pub fn encode_chunk(header: ChunkHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let head = serde_json::to_vec(&HeaderRepr::from(header))?;
    let mut buf = BytesMut::with_capacity(head.len() + 1 + payload.len());
    buf.put_slice(&head);
    buf.put_u8(FRAME_DELIMITER);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
