//! [`Transport`] over an authenticated byte stream.
//!
//! `send` only enqueues. A writer task drains the queue into the socket and
//! keeps the buffered counter current; a reader task turns incoming
//! length-prefixed frames into the inbound channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dropwire_transfer::{Transport, TransportError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::TCP_BUFFER_SIZE;
use crate::wire::{MAX_FRAME_LEN, read_frame, write_frame};

/// How long a closing writer keeps flushing frames already queued.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected transport and its inbound frames.
pub type Channel = (Arc<TcpTransport>, mpsc::UnboundedReceiver<Bytes>);

struct Shared {
    open: AtomicBool,
    buffered: AtomicU64,
    low_threshold: AtomicU64,
    low: Arc<Notify>,
    cancel: CancellationToken,
}

impl Shared {
    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("data channel transport closed");
        }
        self.cancel.cancel();
        self.low.notify_waiters();
    }

    fn written(&self, len: u64) {
        let before = self.buffered.fetch_sub(len, Ordering::SeqCst);
        let now = before.saturating_sub(len);
        if now <= self.low_threshold.load(Ordering::SeqCst) {
            self.low.notify_waiters();
        }
    }
}

/// Frame transport over a TCP stream (or any split byte stream).
pub struct TcpTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Wraps an already-authenticated TCP stream.
    pub fn from_stream(stream: TcpStream) -> Channel {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer)
    }

    /// Starts the reader and writer tasks over the two stream halves.
    pub fn spawn<R, W>(reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            buffered: AtomicU64::new(0),
            low_threshold: AtomicU64::new(0),
            low: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            BufWriter::with_capacity(TCP_BUFFER_SIZE, writer),
            out_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(read_loop(
            BufReader::with_capacity(TCP_BUFFER_SIZE, reader),
            in_tx,
            Arc::clone(&shared),
        ));

        let transport = Arc::new(Self {
            outbound: out_tx,
            shared,
        });
        (transport, in_rx)
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::Send(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
                frame.len()
            )));
        }
        let len = frame.len() as u64;
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        self.outbound.send(frame).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.shared.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        Arc::clone(&self.shared.low)
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.shared.mark_closed();
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: BufWriter<W>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        if let Err(e) = write_batch(&mut writer, frame, &mut frames, &shared).await {
            warn!(error = %e, "data channel write failed");
            shared.mark_closed();
            return;
        }
    }

    // Frames queued before close still go out, e.g. a final ERROR.
    let flush = async {
        while let Ok(frame) = frames.try_recv() {
            write_batch(&mut writer, frame, &mut frames, &shared).await?;
        }
        writer.shutdown().await?;
        Ok::<_, crate::DataChannelError>(())
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => trace!("data channel writer shut down"),
        Ok(Err(e)) => debug!(error = %e, "error flushing data channel on close"),
        Err(_) => debug!("timed out flushing data channel on close"),
    }
    shared.mark_closed();
}

/// Writes `first` plus whatever else is already queued, then flushes.
async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    first: Bytes,
    frames: &mut mpsc::UnboundedReceiver<Bytes>,
    shared: &Shared,
) -> Result<(), crate::DataChannelError> {
    let mut next = Some(first);
    while let Some(frame) = next {
        write_frame(writer, &frame).await?;
        shared.written(frame.len() as u64);
        next = frames.try_recv().ok();
    }
    writer.flush().await?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    inbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = read_frame(&mut reader) => result,
        };

        match result {
            Ok(Some(frame)) => {
                trace!(len = frame.len(), "frame received");
                if inbound.send(frame).is_err() {
                    debug!("inbound consumer gone");
                    break;
                }
            }
            Ok(None) => {
                debug!("remote closed the data channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "data channel read failed");
                break;
            }
        }
    }
    shared.mark_closed();
}
