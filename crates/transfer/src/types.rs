use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use dropwire_protocol::FileMetadata;

use crate::TransferError;

/// One indexed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position within the file.
    pub index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
}

/// Which side of a transfer a session or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

/// Lifecycle of a send session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    AnnouncingMetadata,
    Streaming,
    Draining,
    AwaitingAck,
    Retransmitting,
    Done,
    Failed,
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SenderState::Idle => "idle",
            SenderState::AnnouncingMetadata => "announcing_metadata",
            SenderState::Streaming => "streaming",
            SenderState::Draining => "draining",
            SenderState::AwaitingAck => "awaiting_ack",
            SenderState::Retransmitting => "retransmitting",
            SenderState::Done => "done",
            SenderState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time transfer statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub chunks_transferred: u32,
    pub total_chunks: u32,
    /// Never exceeds `total_bytes`.
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// In `[0, 100]`.
    pub percentage: f64,
    /// Bytes per second.
    pub speed: f64,
    /// Seconds remaining; 0 when speed is 0 or the transfer is complete.
    pub eta: f64,
}

/// A fully reassembled and length-verified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

/// Outcome of a send that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub metadata: FileMetadata,
    pub total_chunks: u32,
    /// Payload bytes handed to the transport, retransmissions included.
    pub bytes_sent: u64,
    pub retransmit_rounds: u32,
    /// `false` when the ack wait timed out and success is best-effort.
    pub acknowledged: bool,
    pub elapsed: Duration,
}

/// Notifications emitted by a [`Peer`](crate::Peer).
#[derive(Debug)]
pub enum TransferEvent {
    Progress {
        direction: Direction,
        snapshot: ProgressSnapshot,
    },
    /// The remote side announced a file.
    Incoming(FileMetadata),
    Received(ReceivedFile),
    ReceiveFailed(TransferError),
}
