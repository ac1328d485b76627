//! One endpoint of a data channel: sends files and receives them.
//!
//! Both directions share the same transport. Inbound frames are routed by
//! kind: ACK and NACK go to the active send, ERROR goes to the side its
//! scope names (both when untagged), and everything else drives the
//! receiver state machine.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dropwire_protocol::{ControlFrame, ErrorScope, FileMetadata, Frame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::{ByteSource, FileSource};
use crate::receiver::{self, ReceiverEffect, ReceiverState};
use crate::sender::{SendSession, Sender, SenderReply};
use crate::transport::Transport;
use crate::types::{Direction, SendReport, TransferEvent};
use crate::{TransferConfig, TransferError};

/// Reply route of the send in progress, keyed by a per-peer send id.
type ReplySlot = Mutex<Option<(u64, mpsc::UnboundedSender<SenderReply>)>>;

/// A transfer endpoint bound to one transport.
pub struct Peer {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    /// Reply route of the send in progress, if any.
    active_send: ReplySlot,
    next_send_id: AtomicU64,
    receiver: Mutex<ReceiverState>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl Peer {
    /// Creates a peer. Inbound frames must be fed with [`run`](Self::run)
    /// or [`dispatch`](Self::dispatch).
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Arc<Self>, TransferError> {
        config.validate()?;
        Ok(Arc::new(Self {
            transport,
            config,
            active_send: Mutex::new(None),
            next_send_id: AtomicU64::new(0),
            receiver: Mutex::new(ReceiverState::Idle),
            events,
        }))
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Returns `true` while a send is in progress.
    pub fn is_sending(&self) -> bool {
        lock(&self.active_send).is_some()
    }

    /// Returns `true` while an inbound file is being buffered.
    pub fn is_receiving(&self) -> bool {
        !lock(&self.receiver).is_idle()
    }

    /// Feeds inbound frames until the transport's inbound stream ends.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(raw) = inbound.recv().await {
            self.dispatch(raw);
        }
        self.on_closed();
    }

    /// Handles one raw inbound frame.
    pub fn dispatch(&self, raw: Bytes) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Control(ControlFrame::Ack) => {
                if !self.reply(SenderReply::Ack) {
                    debug!("ACK with no active send");
                }
            }
            Frame::Control(ControlFrame::Nack { missing_chunks }) => {
                if !self.reply(SenderReply::Nack(missing_chunks)) {
                    debug!("NACK with no active send");
                }
            }
            // The author's send is our receive and vice versa.
            Frame::Control(ControlFrame::Error { error, scope }) => {
                if scope != Some(ErrorScope::Send)
                    && !self.reply(SenderReply::Aborted(error.clone()))
                {
                    debug!(reason = %error, "ERROR with no active send");
                }
                if scope != Some(ErrorScope::Receive) {
                    self.advance(Frame::Control(ControlFrame::Error { error, scope }));
                }
            }
            other => self.advance(other),
        }
    }

    /// Sends one file. Only one send may run per peer at a time.
    pub async fn send_file<S: ByteSource>(
        &self,
        source: S,
        metadata: FileMetadata,
        cancel: CancellationToken,
    ) -> Result<SendReport, TransferError> {
        let (id, replies) = {
            let mut slot = lock(&self.active_send);
            if slot.as_ref().is_some_and(|(_, tx)| !tx.is_closed()) {
                return Err(TransferError::SessionBusy);
            }
            let id = self.next_send_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            *slot = Some((id, tx));
            (id, rx)
        };
        let _slot = ActiveSend {
            slot: &self.active_send,
            id,
        };

        let mut session = SendSession::new(source, metadata, self.config.chunk_size, replies)?;
        let sender = Sender::new(Arc::clone(&self.transport), self.config.clone(), cancel)
            .with_events(self.events.clone());
        sender.run(&mut session).await
    }

    /// Opens `path` and sends it under its own file name.
    pub async fn send_path(
        &self,
        path: &Path,
        content_type: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SendReport, TransferError> {
        let source = FileSource::open(path)?;
        let metadata = source.metadata(content_type)?;
        self.send_file(source, metadata, cancel).await
    }

    fn reply(&self, reply: SenderReply) -> bool {
        match lock(&self.active_send).as_ref() {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    fn advance(&self, frame: Frame) {
        let effects = {
            let mut state = lock(&self.receiver);
            let (next, effects) =
                receiver::step(std::mem::take(&mut *state), frame, Instant::now(), &self.config);
            *state = next;
            effects
        };

        for effect in effects {
            match effect {
                ReceiverEffect::Send(frame) => self.send_control(&frame),
                ReceiverEffect::Incoming(metadata) => self.emit(TransferEvent::Incoming(metadata)),
                ReceiverEffect::Progress(snapshot) => self.emit(TransferEvent::Progress {
                    direction: Direction::Receive,
                    snapshot,
                }),
                ReceiverEffect::Delivered(file) => self.emit(TransferEvent::Received(file)),
                ReceiverEffect::Failed(e) => self.emit(TransferEvent::ReceiveFailed(e)),
            }
        }
    }

    fn send_control(&self, frame: &ControlFrame) {
        let result = frame
            .encode()
            .map_err(TransferError::from)
            .and_then(|bytes| self.transport.send(bytes).map_err(TransferError::from));
        if let Err(e) = result {
            warn!(kind = frame.kind(), error = %e, "failed to send control frame");
        }
    }

    fn on_closed(&self) {
        info!("data channel closed");
        // Dropping the reply route fails a pending ack wait.
        lock(&self.active_send).take();

        let state = std::mem::take(&mut *lock(&self.receiver));
        if let Some(metadata) = state.metadata() {
            warn!(file = %metadata.name, "channel closed mid-transfer, discarding");
            self.emit(TransferEvent::ReceiveFailed(TransferError::ConnectionNotReady));
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

/// Clears the reply slot when a send ends, however it ends, unless a
/// later send already owns it.
struct ActiveSend<'a> {
    slot: &'a ReplySlot,
    id: u64,
}

impl Drop for ActiveSend<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|(id, _)| *id == self.id) {
            slot.take();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Write;

    use dropwire_protocol::ChunkHeader;

    use super::*;
    use crate::chunked::MemorySource;
    use crate::transport::MemoryTransport;
    use crate::types::ReceivedFile;

    struct Node {
        peer: Arc<Peer>,
        transport: Arc<MemoryTransport>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
    }

    fn node(
        transport: Arc<MemoryTransport>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        config: &TransferConfig,
    ) -> Node {
        let (tx, events) = mpsc::unbounded_channel();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let peer = Peer::new(dyn_transport, config.clone(), tx).unwrap();
        tokio::spawn(Arc::clone(&peer).run(inbound));
        Node {
            peer,
            transport,
            events,
        }
    }

    fn connected(config: TransferConfig) -> (Node, Node) {
        let ((a, a_rx), (b, b_rx)) = MemoryTransport::pair();
        (node(a, a_rx, &config), node(b, b_rx, &config))
    }

    fn small_chunks() -> TransferConfig {
        TransferConfig {
            chunk_size: 10,
            ..Default::default()
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn metadata(name: &str, size: usize) -> FileMetadata {
        FileMetadata {
            name: name.into(),
            size: size as u64,
            content_type: "application/octet-stream".into(),
            last_modified: 0,
        }
    }

    async fn next_received(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> ReceivedFile {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Received(file) => return file,
                TransferEvent::ReceiveFailed(e) => panic!("receive failed: {e}"),
                _ => {}
            }
        }
        panic!("event stream ended");
    }

    async fn next_failure(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferError {
        while let Some(event) = events.recv().await {
            if let TransferEvent::ReceiveFailed(e) = event {
                return e;
            }
        }
        panic!("event stream ended");
    }

    /// Drops chunk frames whose index is in `indices`; each at most once
    /// unless `always` is set.
    fn lose_chunks(transport: &MemoryTransport, indices: &'static [u32], always: bool) {
        let mut seen = HashSet::new();
        transport.drop_when(move |raw| match Frame::decode(raw.clone()) {
            Ok(Frame::Chunk { header, .. }) if indices.contains(&header.index) => {
                always || seen.insert(header.index)
            }
            _ => false,
        });
    }

    #[tokio::test]
    async fn round_trip_with_default_chunks() {
        let (a, mut b) = connected(TransferConfig::default());
        let data = patterned(150_000);

        let report = a
            .peer
            .send_file(
                MemorySource::new(data.clone()),
                metadata("photo.jpg", data.len()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.acknowledged);
        assert_eq!(report.total_chunks, 3);
        assert_eq!(report.retransmit_rounds, 0);

        match b.events.recv().await {
            Some(TransferEvent::Incoming(m)) => assert_eq!(m.name, "photo.jpg"),
            other => panic!("expected Incoming, got {other:?}"),
        }
        let file = next_received(&mut b.events).await;
        assert_eq!(file.data, Bytes::from(data));
        assert!(!a.peer.is_sending());
        assert!(!b.peer.is_receiving());
    }

    #[tokio::test]
    async fn lost_chunks_are_recovered_in_one_round() {
        let (a, mut b) = connected(small_chunks());
        lose_chunks(&a.transport, &[3, 7], false);
        let data = patterned(100);

        let report = a
            .peer
            .send_file(
                MemorySource::new(data.clone()),
                metadata("a.bin", 100),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.acknowledged);
        assert_eq!(report.retransmit_rounds, 1);
        assert_eq!(next_received(&mut b.events).await.data, Bytes::from(data));
    }

    #[tokio::test]
    async fn persistent_loss_fails_after_five_rounds() {
        let (a, b) = connected(small_chunks());
        lose_chunks(&a.transport, &[2], true);

        let result = a
            .peer
            .send_file(
                MemorySource::new(patterned(50)),
                metadata("a.bin", 50),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(TransferError::IncompleteTransfer { rounds: 5, missing: 1 })
        ));
        assert!(b.peer.is_receiving());
    }

    #[tokio::test]
    async fn empty_file_round_trip() {
        let (a, mut b) = connected(TransferConfig::default());
        let report = a
            .peer
            .send_file(
                MemorySource::new(Vec::new()),
                metadata("empty.txt", 0),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.acknowledged);
        assert_eq!(report.total_chunks, 0);
        assert!(next_received(&mut b.events).await.data.is_empty());
    }

    #[tokio::test]
    async fn both_directions_at_once() {
        let (mut a, mut b) = connected(small_chunks());
        let to_b = patterned(95);
        let to_a: Vec<u8> = patterned(64).into_iter().rev().collect();

        let (ab, ba) = tokio::join!(
            a.peer.send_file(
                MemorySource::new(to_b.clone()),
                metadata("to-b.bin", to_b.len()),
                CancellationToken::new(),
            ),
            b.peer.send_file(
                MemorySource::new(to_a.clone()),
                metadata("to-a.bin", to_a.len()),
                CancellationToken::new(),
            ),
        );
        assert!(ab.unwrap().acknowledged);
        assert!(ba.unwrap().acknowledged);

        assert_eq!(next_received(&mut b.events).await.data, Bytes::from(to_b));
        assert_eq!(next_received(&mut a.events).await.data, Bytes::from(to_a));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_one_direction_leaves_the_other_running() {
        let (a, b) = connected(small_chunks());

        // A's COMPLETE is lost, so A sits in its ack wait.
        let complete_lost = Arc::new(tokio::sync::Notify::new());
        let lost = Arc::clone(&complete_lost);
        a.transport.drop_when(move |raw| {
            let is_complete = matches!(
                Frame::decode(raw.clone()),
                Ok(Frame::Control(ControlFrame::Complete))
            );
            if is_complete {
                lost.notify_one();
            }
            is_complete
        });
        // B's own send is held in the gate.
        b.transport.set_buffered_amount(20 * 1024 * 1024);

        let a_send = tokio::spawn({
            let peer = Arc::clone(&a.peer);
            async move {
                peer.send_file(
                    MemorySource::new(patterned(30)),
                    metadata("to-b.bin", 30),
                    CancellationToken::new(),
                )
                .await
            }
        });
        let b_cancel = CancellationToken::new();
        let b_send = tokio::spawn({
            let peer = Arc::clone(&b.peer);
            let cancel = b_cancel.clone();
            async move {
                peer.send_file(MemorySource::new(patterned(30)), metadata("to-a.bin", 30), cancel)
                    .await
            }
        });

        complete_lost.notified().await;
        b_cancel.cancel();
        assert!(matches!(
            b_send.await.unwrap(),
            Err(TransferError::Cancelled)
        ));

        // B's ERROR names its own send; A's send runs on into its ack timeout.
        let report = a_send.await.unwrap().unwrap();
        assert!(!report.acknowledged);
    }

    #[tokio::test]
    async fn receive_abort_leaves_inbound_transfer_alone() {
        let (mut a, b) = connected(TransferConfig::default());
        let frames = [
            ControlFrame::Metadata {
                metadata: metadata("kept.txt", 3),
            }
            .encode()
            .unwrap(),
            ControlFrame::error(ErrorScope::Receive, "rejected your file")
                .encode()
                .unwrap(),
            dropwire_protocol::encode_chunk(
                ChunkHeader {
                    index: 0,
                    total_chunks: 1,
                },
                b"abc",
            )
            .unwrap(),
            ControlFrame::Complete.encode().unwrap(),
        ];
        for frame in frames {
            b.transport.send(frame).unwrap();
        }

        assert_eq!(&next_received(&mut a.events).await.data[..], b"abc");
    }

    #[test]
    fn finished_send_leaves_a_newer_route_in_place() {
        let slot: ReplySlot = Mutex::new(None);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        *lock(&slot) = Some((1, old_tx));
        let stale = ActiveSend {
            slot: &slot,
            id: 1,
        };

        // The channel closed and a new send took the slot before the old
        // one unwound.
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        *lock(&slot) = Some((2, new_tx));
        drop(stale);
        assert_eq!(lock(&slot).as_ref().map(|(id, _)| *id), Some(2));

        drop(ActiveSend {
            slot: &slot,
            id: 2,
        });
        assert!(lock(&slot).is_none());
    }

    #[tokio::test]
    async fn second_send_is_rejected_while_active() {
        let (a, _b) = connected(TransferConfig::default());
        // Hold the first send in the gate.
        a.transport.set_buffered_amount(20 * 1024 * 1024);

        let cancel = CancellationToken::new();
        let first = tokio::spawn({
            let peer = Arc::clone(&a.peer);
            let cancel = cancel.clone();
            async move {
                peer.send_file(MemorySource::new(patterned(10)), metadata("one", 10), cancel)
                    .await
            }
        });
        while !a.peer.is_sending() {
            tokio::task::yield_now().await;
        }

        let second = a
            .peer
            .send_file(
                MemorySource::new(patterned(10)),
                metadata("two", 10),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(second, Err(TransferError::SessionBusy)));

        cancel.cancel();
        assert!(matches!(
            first.await.unwrap(),
            Err(TransferError::Cancelled)
        ));
        assert!(!a.peer.is_sending());
    }

    #[tokio::test]
    async fn cancelling_mid_stream_aborts_receiver() {
        let (a, mut b) = connected(small_chunks());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        a.transport.drop_when(move |raw| {
            if let Ok(Frame::Chunk {
                header: ChunkHeader { index: 5, .. },
                ..
            }) = Frame::decode(raw.clone())
            {
                trigger.cancel();
            }
            false
        });

        let result = a
            .peer
            .send_file(MemorySource::new(patterned(100)), metadata("a.bin", 100), cancel)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));

        match next_failure(&mut b.events).await {
            TransferError::RemoteAborted(reason) => assert_eq!(reason, "cancelled"),
            other => panic!("expected RemoteAborted, got {other:?}"),
        }
        assert!(!b.peer.is_receiving());
    }

    #[tokio::test]
    async fn close_mid_receive_reports_failure() {
        let (a, mut b) = connected(TransferConfig::default());
        let announce = ControlFrame::Metadata {
            metadata: metadata("partial.bin", 1_000),
        };
        a.transport.send(announce.encode().unwrap()).unwrap();

        assert!(matches!(
            b.events.recv().await,
            Some(TransferEvent::Incoming(_))
        ));
        a.transport.close();

        assert!(matches!(
            next_failure(&mut b.events).await,
            TransferError::ConnectionNotReady
        ));
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let (a, mut b) = connected(small_chunks());
        a.transport.send(Bytes::from_static(b"not json")).unwrap();
        a.transport.send(Bytes::new()).unwrap();

        a.peer
            .send_file(
                MemorySource::new(patterned(25)),
                metadata("a.bin", 25),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(next_received(&mut b.events).await.data.len(), 25);
    }

    #[tokio::test]
    async fn progress_reaches_exactly_one_hundred_on_both_sides() {
        let (mut a, mut b) = connected(small_chunks());
        a.peer
            .send_file(
                MemorySource::new(patterned(200)),
                metadata("a.bin", 200),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        next_received(&mut b.events).await;

        let mut sent = Vec::new();
        while let Ok(event) = a.events.try_recv() {
            if let TransferEvent::Progress { direction, snapshot } = event {
                assert_eq!(direction, Direction::Send);
                sent.push(snapshot.percentage);
            }
        }
        assert!(sent.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sent.last().copied(), Some(100.0));

        // The final receive-side update precedes delivery.
        let (c, mut d) = connected(small_chunks());
        c.peer
            .send_file(
                MemorySource::new(patterned(30)),
                metadata("b.bin", 30),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let mut received = Vec::new();
        while let Some(event) = d.events.recv().await {
            match event {
                TransferEvent::Progress { snapshot, .. } => received.push(snapshot.percentage),
                TransferEvent::Received(_) => break,
                _ => {}
            }
        }
        assert!(received.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(received.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn send_path_uses_file_name() {
        let (a, mut b) = connected(TransferConfig::default());
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello over the wire")
            .unwrap();

        a.peer
            .send_path(&path, Some("text/plain"), CancellationToken::new())
            .await
            .unwrap();

        let file = next_received(&mut b.events).await;
        assert_eq!(file.metadata.name, "notes.txt");
        assert_eq!(file.metadata.content_type, "text/plain");
        assert_eq!(&file.data[..], b"hello over the wire");
    }
}
