//! Receive-side state machine.
//!
//! [`step`] is a pure transition function: it takes the current state and
//! one decoded frame and returns the next state plus the effects the caller
//! must carry out, in order. It never touches the transport.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use dropwire_protocol::{ChunkHeader, ControlFrame, ErrorScope, FileMetadata, Frame};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::chunked::chunk_count;
use crate::progress::ProgressTracker;
use crate::types::{ProgressSnapshot, ReceivedFile};
use crate::{TransferConfig, TransferError};

/// Most indices one NACK carries. Encoded, that stays well under the TCP
/// adapter's 32 MiB frame limit; the rest are requested next round.
pub const MAX_NACK_INDICES: usize = 1 << 20;

/// What the receiver is doing.
#[derive(Debug, Default)]
pub enum ReceiverState {
    #[default]
    Idle,
    /// METADATA seen; chunks are being collected.
    Buffering(Box<InboundTransfer>),
}

impl ReceiverState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ReceiverState::Idle)
    }

    /// Metadata of the transfer being buffered.
    pub fn metadata(&self) -> Option<&FileMetadata> {
        match self {
            ReceiverState::Idle => None,
            ReceiverState::Buffering(t) => Some(&t.metadata),
        }
    }
}

/// Bookkeeping for one inbound file.
#[derive(Debug)]
pub struct InboundTransfer {
    metadata: FileMetadata,
    chunks: BTreeMap<u32, Bytes>,
    /// Taken from the first chunk header and never changed afterwards.
    total_chunks: Option<u32>,
    bytes_received: u64,
    nacks_sent: u32,
    progress: ProgressTracker,
}

impl InboundTransfer {
    fn new(metadata: FileMetadata, now: Instant, config: &TransferConfig) -> Self {
        let progress = ProgressTracker::new(0, metadata.size, config.progress_interval, now);
        Self {
            metadata,
            chunks: BTreeMap::new(),
            total_chunks: None,
            bytes_received: 0,
            nacks_sent: 0,
            progress,
        }
    }

    /// Sorted indices in `0..total` not yet received, at most `limit`.
    fn missing(&self, total: u32, limit: usize) -> Vec<u32> {
        (0..total)
            .filter(|i| !self.chunks.contains_key(i))
            .take(limit)
            .collect()
    }

    fn reassemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.bytes_received as usize);
        for payload in self.chunks.values() {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }
}

/// Side effects requested by [`step`].
#[derive(Debug)]
pub enum ReceiverEffect {
    /// Send a control frame back to the sender.
    Send(ControlFrame),
    Incoming(FileMetadata),
    Progress(ProgressSnapshot),
    Delivered(ReceivedFile),
    Failed(TransferError),
}

/// Advances the receiver by one frame.
pub fn step(
    state: ReceiverState,
    frame: Frame,
    now: Instant,
    config: &TransferConfig,
) -> (ReceiverState, Vec<ReceiverEffect>) {
    match frame {
        Frame::Control(ControlFrame::Metadata { metadata }) => {
            on_metadata(state, metadata, now, config)
        }
        Frame::Chunk { header, payload } => on_chunk(state, header, payload, now),
        Frame::Control(ControlFrame::Complete) => on_complete(state, now, config),
        Frame::Control(ControlFrame::Error { error, .. }) => match state {
            ReceiverState::Buffering(t) => {
                warn!(file = %t.metadata.name, reason = %error, "sender aborted transfer");
                (
                    ReceiverState::Idle,
                    vec![ReceiverEffect::Failed(TransferError::RemoteAborted(error))],
                )
            }
            ReceiverState::Idle => {
                debug!(reason = %error, "ERROR frame while idle");
                (ReceiverState::Idle, Vec::new())
            }
        },
        Frame::Control(other @ (ControlFrame::Ack | ControlFrame::Nack { .. })) => {
            debug!(kind = other.kind(), "ignoring sender-bound frame");
            (state, Vec::new())
        }
    }
}

fn on_metadata(
    state: ReceiverState,
    metadata: FileMetadata,
    now: Instant,
    config: &TransferConfig,
) -> (ReceiverState, Vec<ReceiverEffect>) {
    if let ReceiverState::Buffering(previous) = &state {
        warn!(
            previous = %previous.metadata.name,
            chunks = previous.chunks.len(),
            "new METADATA replaces unfinished transfer"
        );
    }

    if let Err(e) = metadata.validate() {
        warn!(error = %e, "rejecting METADATA");
        let reason = e.to_string();
        return (
            ReceiverState::Idle,
            vec![
                ReceiverEffect::Send(ControlFrame::error(ErrorScope::Receive, reason.clone())),
                ReceiverEffect::Failed(TransferError::InvalidMetadata(reason)),
            ],
        );
    }

    info!(
        file = %metadata.name,
        size = metadata.size,
        content_type = %metadata.content_type,
        "incoming file"
    );
    let transfer = InboundTransfer::new(metadata.clone(), now, config);
    (
        ReceiverState::Buffering(Box::new(transfer)),
        vec![ReceiverEffect::Incoming(metadata)],
    )
}

fn on_chunk(
    state: ReceiverState,
    header: ChunkHeader,
    payload: Bytes,
    now: Instant,
) -> (ReceiverState, Vec<ReceiverEffect>) {
    let mut t = match state {
        ReceiverState::Buffering(t) => t,
        ReceiverState::Idle => {
            warn!(index = header.index, "chunk before METADATA, dropping");
            return (ReceiverState::Idle, Vec::new());
        }
    };

    let total = match t.total_chunks {
        Some(total) => {
            if header.total_chunks != total {
                warn!(
                    index = header.index,
                    header_total = header.total_chunks,
                    total,
                    "chunk disagrees on total count; keeping the first"
                );
            }
            total
        }
        // Every chunk carries at least one byte.
        None if u64::from(header.total_chunks) > t.metadata.size => {
            warn!(
                file = %t.metadata.name,
                size = t.metadata.size,
                total = header.total_chunks,
                "chunk count impossible for announced size"
            );
            let reason = format!(
                "{} chunks announced for a {} byte file",
                header.total_chunks, t.metadata.size
            );
            return (
                ReceiverState::Idle,
                vec![
                    ReceiverEffect::Send(ControlFrame::error(ErrorScope::Receive, reason.clone())),
                    ReceiverEffect::Failed(TransferError::InvalidMetadata(reason)),
                ],
            );
        }
        None => {
            debug!(file = %t.metadata.name, total = header.total_chunks, "expecting chunks");
            t.total_chunks = Some(header.total_chunks);
            t.progress.set_total_chunks(header.total_chunks);
            header.total_chunks
        }
    };

    if header.index >= total {
        warn!(index = header.index, total, "chunk index out of range, dropping");
        return (ReceiverState::Buffering(t), Vec::new());
    }

    let len = payload.len() as u64;
    if let Some(old) = t.chunks.insert(header.index, payload) {
        trace!(index = header.index, "duplicate chunk replaced");
        t.bytes_received -= old.len() as u64;
    }
    t.bytes_received += len;

    if (header.index + 1) % 100 == 0 {
        trace!(index = header.index, total, "chunk received");
    }

    let received = t.chunks.len() as u32;
    let bytes = t.bytes_received;
    let effects = t
        .progress
        .throttled(received, bytes, now)
        .map(ReceiverEffect::Progress)
        .into_iter()
        .collect();
    (ReceiverState::Buffering(t), effects)
}

fn on_complete(
    state: ReceiverState,
    now: Instant,
    config: &TransferConfig,
) -> (ReceiverState, Vec<ReceiverEffect>) {
    let mut t = match state {
        ReceiverState::Buffering(t) => t,
        ReceiverState::Idle => {
            warn!("COMPLETE without METADATA, ignoring");
            return (ReceiverState::Idle, Vec::new());
        }
    };

    // No chunk seen: derive the count locally. Zero for an empty file.
    let total = match t.total_chunks {
        Some(total) => total,
        None => chunk_count(t.metadata.size, config.chunk_size).unwrap_or(0),
    };

    let missing = t.missing(total, MAX_NACK_INDICES);
    if !missing.is_empty() {
        t.nacks_sent += 1;
        warn!(
            file = %t.metadata.name,
            missing = missing.len(),
            capped = missing.len() == MAX_NACK_INDICES,
            total,
            round = t.nacks_sent,
            first = ?&missing[..missing.len().min(10)],
            "requesting retransmission"
        );
        return (
            ReceiverState::Buffering(t),
            vec![ReceiverEffect::Send(ControlFrame::Nack {
                missing_chunks: missing,
            })],
        );
    }

    let data = t.reassemble();
    let actual = data.len() as u64;
    if actual != t.metadata.size {
        warn!(
            file = %t.metadata.name,
            expected = t.metadata.size,
            actual,
            "reassembled size does not match METADATA"
        );
        return (
            ReceiverState::Idle,
            vec![ReceiverEffect::Failed(TransferError::SizeMismatch {
                expected: t.metadata.size,
                actual,
            })],
        );
    }

    t.progress.set_total_chunks(total);
    let snapshot = t.progress.snapshot(total, actual, now);
    info!(
        file = %t.metadata.name,
        size = actual,
        chunks = total,
        nack_rounds = t.nacks_sent,
        "file received"
    );

    let InboundTransfer { metadata, .. } = *t;
    (
        ReceiverState::Idle,
        vec![
            ReceiverEffect::Progress(snapshot),
            ReceiverEffect::Delivered(ReceivedFile { metadata, data }),
            ReceiverEffect::Send(ControlFrame::Ack),
        ],
    )
}
