//! Chunked file transfer over an ordered message transport.
//!
//! The sender streams fixed-size chunks through a [`BackpressureGate`],
//! drains the transport, announces COMPLETE and retransmits whatever the
//! receiver NACKs. The receiver is a pure state machine driven by
//! [`receiver::step`]. [`Peer`] ties both to one [`Transport`].

pub mod chunked;
pub mod config;
pub mod gate;
pub mod peer;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod transport;
mod types;
mod validation;

use std::time::Duration;

use dropwire_protocol::ProtocolError;

pub use chunked::{ByteSource, ChunkPlanner, FileSource, MemorySource, chunk_count};
pub use config::TransferConfig;
pub use gate::BackpressureGate;
pub use peer::Peer;
pub use progress::{ProgressThrottle, ProgressTracker, compute_progress};
pub use receiver::{ReceiverEffect, ReceiverState};
pub use sender::{SendSession, Sender, SenderReply};
pub use transport::{MemoryTransport, Transport, TransportError};
pub use types::{
    Chunk, Direction, ProgressSnapshot, ReceivedFile, SendReport, SenderState, TransferEvent,
};
pub use validation::{save_received_file, validate_output_name};

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection not ready")]
    ConnectionNotReady,

    #[error("transport buffer did not drain within {0:?}")]
    BackpressureTimeout(Duration),

    #[error("failed to send chunk {index}: {reason}")]
    ChunkSendFailure { index: u32, reason: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("receiver still missing {missing} chunks after {rounds} retransmission rounds")]
    IncompleteTransfer { rounds: u32, missing: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("a send is already active on this channel")]
    SessionBusy,

    #[error("peer aborted the transfer: {0}")]
    RemoteAborted(String),

    #[error("chunk {index} out of range for {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
