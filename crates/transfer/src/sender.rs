//! Send-side transfer pipeline.
//!
//! ```text
//! Idle → AnnouncingMetadata → Streaming → Draining → AwaitingAck
//!                                                      │
//!        Done ◄── ACK ─────────────────────────────────┤
//!        Failed ◄── rounds exhausted / ERROR / cancel ─┤
//!        Retransmitting → Draining → AwaitingAck ◄─ NACK
//! ```
//!
//! The pipeline is plain sequential async code. It suspends only in the
//! gate, the drain poll and the ack wait, and observes cancellation there
//! and before every chunk.

use std::sync::Arc;

use dropwire_protocol::{ChunkHeader, ControlFrame, ErrorScope, FileMetadata, encode_chunk};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::{ByteSource, ChunkPlanner};
use crate::gate::BackpressureGate;
use crate::progress::ProgressTracker;
use crate::transport::Transport;
use crate::types::{Direction, ProgressSnapshot, SendReport, SenderState, TransferEvent};
use crate::{TransferConfig, TransferError};

/// Receiver verdict routed to the active send session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderReply {
    Ack,
    Nack(Vec<u32>),
    /// The receiver sent an ERROR frame.
    Aborted(String),
}

/// Everything one send attempt mutates.
///
/// Created fresh per attempt; nothing survives into the next one.
pub struct SendSession<S> {
    state: SenderState,
    metadata: FileMetadata,
    planner: ChunkPlanner<S>,
    /// Next chunk index to stream.
    cursor: u32,
    rounds: u32,
    bytes_sent: u64,
    replies: mpsc::UnboundedReceiver<SenderReply>,
}

impl<S: ByteSource> SendSession<S> {
    /// Plans `source` for sending. `metadata.size` must match the source.
    pub fn new(
        source: S,
        metadata: FileMetadata,
        chunk_size: usize,
        replies: mpsc::UnboundedReceiver<SenderReply>,
    ) -> Result<Self, TransferError> {
        metadata
            .validate()
            .map_err(|e| TransferError::InvalidMetadata(e.to_string()))?;
        if metadata.size != source.size() {
            return Err(TransferError::InvalidMetadata(format!(
                "metadata says {} bytes but source has {}",
                metadata.size,
                source.size()
            )));
        }

        Ok(Self {
            state: SenderState::Idle,
            metadata,
            planner: ChunkPlanner::new(source, chunk_size)?,
            cursor: 0,
            rounds: 0,
            bytes_sent: 0,
            replies,
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn total_chunks(&self) -> u32 {
        self.planner.total_chunks()
    }

    pub fn retransmit_rounds(&self) -> u32 {
        self.rounds
    }

    fn transition(&mut self, next: SenderState) {
        debug!(from = %self.state, to = %next, file = %self.metadata.name, "send state");
        self.state = next;
    }
}

/// Drives a [`SendSession`] over a transport.
pub struct Sender {
    transport: Arc<dyn Transport>,
    gate: BackpressureGate,
    config: TransferConfig,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        let gate = BackpressureGate::new(Arc::clone(&transport), &config);
        Self {
            transport,
            gate,
            config,
            cancel,
            events: None,
        }
    }

    /// Routes progress snapshots to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the session to a terminal state.
    pub async fn run<S: ByteSource>(
        &self,
        session: &mut SendSession<S>,
    ) -> Result<SendReport, TransferError> {
        if session.state != SenderState::Idle {
            return Err(TransferError::InvalidConfig(format!(
                "send session already used (state {})",
                session.state
            )));
        }

        let started = Instant::now();
        let result = self.drive(session, started).await;

        match &result {
            Ok(report) => {
                session.transition(SenderState::Done);
                info!(
                    file = %report.metadata.name,
                    bytes = report.metadata.size,
                    chunks = report.total_chunks,
                    rounds = report.retransmit_rounds,
                    acknowledged = report.acknowledged,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "send finished"
                );
            }
            Err(e) => {
                session.transition(SenderState::Failed);
                if matches!(e, TransferError::Cancelled) {
                    self.abort_remote("cancelled");
                }
                warn!(file = %session.metadata.name, error = %e, "send failed");
            }
        }
        result
    }

    async fn drive<S: ByteSource>(
        &self,
        session: &mut SendSession<S>,
        started: Instant,
    ) -> Result<SendReport, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        session.transition(SenderState::AnnouncingMetadata);
        self.send_control(&ControlFrame::Metadata {
            metadata: session.metadata.clone(),
        })
        .await?;
        info!(
            file = %session.metadata.name,
            size = session.metadata.size,
            chunks = session.planner.total_chunks(),
            "sending file"
        );

        session.transition(SenderState::Streaming);
        let mut tracker = ProgressTracker::new(
            session.planner.total_chunks(),
            session.metadata.size,
            self.config.progress_interval,
            started,
        );
        self.stream(session, &mut tracker).await?;

        self.drain(session).await?;
        self.send_control(&ControlFrame::Complete).await?;
        session.transition(SenderState::AwaitingAck);

        loop {
            let reply = self.await_reply(session).await?;
            match reply {
                Some(SenderReply::Ack) => {
                    return Ok(report(session, true, started));
                }
                None => {
                    warn!(
                        file = %session.metadata.name,
                        timeout_s = self.config.ack_timeout.as_secs(),
                        "no ACK from receiver; all data was sent, assuming delivered"
                    );
                    return Ok(report(session, false, started));
                }
                Some(SenderReply::Aborted(reason)) => {
                    return Err(TransferError::RemoteAborted(reason));
                }
                Some(SenderReply::Nack(missing)) => {
                    if session.rounds >= self.config.max_retransmit_rounds {
                        return Err(TransferError::IncompleteTransfer {
                            rounds: session.rounds,
                            missing: missing.len(),
                        });
                    }
                    session.rounds += 1;
                    session.transition(SenderState::Retransmitting);
                    self.retransmit(session, &missing).await?;

                    self.drain(session).await?;
                    self.send_control(&ControlFrame::Complete).await?;
                    session.transition(SenderState::AwaitingAck);
                }
            }
        }
    }

    async fn stream<S: ByteSource>(
        &self,
        session: &mut SendSession<S>,
        tracker: &mut ProgressTracker,
    ) -> Result<(), TransferError> {
        let total = session.planner.total_chunks();

        for chunk in session.planner.iter_from(session.cursor) {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let chunk = chunk?;
            let index = chunk.index;
            let len = chunk.payload.len() as u64;
            let frame = encode_chunk(
                ChunkHeader {
                    index,
                    total_chunks: chunk.total_chunks,
                },
                &chunk.payload,
            )?;

            self.gate
                .submit(frame, &self.cancel)
                .await
                .map_err(|e| chunk_failure(index, e))?;

            session.cursor = index + 1;
            session.bytes_sent += len;

            if let Some(snapshot) = tracker.throttled(index + 1, session.bytes_sent, Instant::now())
            {
                self.emit_progress(snapshot);
            }
            if (index + 1) % 100 == 0 {
                debug!(sent = index + 1, total, "chunks queued");
            }
        }

        self.emit_progress(tracker.snapshot(total, session.bytes_sent, Instant::now()));
        Ok(())
    }

    async fn retransmit<S: ByteSource>(
        &self,
        session: &mut SendSession<S>,
        missing: &[u32],
    ) -> Result<(), TransferError> {
        let total = session.planner.total_chunks();
        let mut resent = 0usize;

        for &index in missing {
            if index >= total {
                warn!(index, total, "ignoring out-of-range index in NACK");
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let chunk = session.planner.chunk(index)?;
            let len = chunk.payload.len() as u64;
            let frame = encode_chunk(
                ChunkHeader {
                    index,
                    total_chunks: total,
                },
                &chunk.payload,
            )?;
            self.gate
                .submit(frame, &self.cancel)
                .await
                .map_err(|e| chunk_failure(index, e))?;

            session.bytes_sent += len;
            resent += 1;
        }

        info!(
            round = session.rounds,
            requested = missing.len(),
            resent,
            "retransmitted missing chunks"
        );
        Ok(())
    }

    /// Waits for the transport queue to empty out before a COMPLETE, so
    /// the COMPLETE cannot overtake chunks still queued locally.
    async fn drain<S: ByteSource>(&self, session: &mut SendSession<S>) -> Result<(), TransferError> {
        session.transition(SenderState::Draining);
        let started = Instant::now();

        loop {
            if !self.transport.is_open() {
                return Err(TransferError::ConnectionNotReady);
            }

            let buffered = self.transport.buffered_amount();
            if buffered <= self.config.flush_target {
                debug!(
                    buffered,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "send queue flushed"
                );
                return Ok(());
            }

            if started.elapsed() >= self.config.flush_timeout {
                warn!(
                    buffered,
                    timeout_s = self.config.flush_timeout.as_secs(),
                    "send queue still not flushed; sending COMPLETE anyway"
                );
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.config.flush_poll_interval) => {}
            }
        }
    }

    /// `Ok(None)` means the ack wait timed out.
    async fn await_reply<S: ByteSource>(
        &self,
        session: &mut SendSession<S>,
    ) -> Result<Option<SenderReply>, TransferError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            reply = tokio::time::timeout(self.config.ack_timeout, session.replies.recv()) => {
                match reply {
                    Ok(Some(r)) => Ok(Some(r)),
                    Ok(None) => Err(TransferError::ConnectionNotReady),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    async fn send_control(&self, frame: &ControlFrame) -> Result<(), TransferError> {
        debug!(kind = frame.kind(), "sending control frame");
        self.gate.submit(frame.encode()?, &self.cancel).await
    }

    fn abort_remote(&self, reason: &str) {
        let frame = ControlFrame::error(ErrorScope::Send, reason);
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(bytes) {
                    debug!(error = %e, "could not notify receiver of abort");
                }
            }
            Err(e) => debug!(error = %e, "could not encode abort frame"),
        }
    }

    fn emit_progress(&self, snapshot: ProgressSnapshot) {
        if let Some(tx) = &self.events {
            let _ = tx.send(TransferEvent::Progress {
                direction: Direction::Send,
                snapshot,
            });
        }
    }
}

fn chunk_failure(index: u32, err: TransferError) -> TransferError {
    match err {
        TransferError::Transport(e) => TransferError::ChunkSendFailure {
            index,
            reason: e.to_string(),
        },
        other => other,
    }
}

fn report<S: ByteSource>(
    session: &SendSession<S>,
    acknowledged: bool,
    started: Instant,
) -> SendReport {
    SendReport {
        metadata: session.metadata.clone(),
        total_chunks: session.planner.total_chunks(),
        bytes_sent: session.bytes_sent,
        retransmit_rounds: session.rounds,
        acknowledged,
        elapsed: started.elapsed(),
    }
}
