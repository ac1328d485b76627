//! Boundary to the message transport a transfer runs on.
//!
//! The transport is ordered and message-oriented with no flow control of
//! its own. `send` only enqueues; callers watch `buffered_amount` and the
//! low-buffer [`Notify`] to pace themselves. Inbound frames are handed out
//! as an `mpsc::UnboundedReceiver<Bytes>` when the transport is built.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

/// Errors returned by [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Ordered message transport with a visible send queue.
pub trait Transport: Send + Sync {
    /// Enqueues one frame. Never blocks.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Bytes accepted by `send` but not yet written out.
    fn buffered_amount(&self) -> u64;

    /// Sets the level at or below which [`buffered_amount_low`] fires.
    ///
    /// [`buffered_amount_low`]: Transport::buffered_amount_low
    fn set_buffered_amount_low_threshold(&self, threshold: u64);

    /// Notified whenever the queue drains to the low threshold or the
    /// transport closes.
    fn buffered_amount_low(&self) -> Arc<Notify>;

    fn is_open(&self) -> bool;

    /// Closes both directions. Inbound delivery ends for the remote side.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

type DropFilter = Box<dyn FnMut(&Bytes) -> bool + Send>;

struct Link {
    open: AtomicBool,
    /// Inbound senders indexed by side.
    inbound: Mutex<[Option<mpsc::UnboundedSender<Bytes>>; 2]>,
    /// Low-buffer notifies of both ends, woken on close.
    notifies: [Arc<Notify>; 2],
}

/// In-process transport pair that delivers frames instantly.
///
/// The buffered counter is whatever the owner sets with
/// [`set_buffered_amount`](Self::set_buffered_amount), which makes it
/// possible to hold a sender above its ceiling. A drop filter can discard
/// chosen frames to simulate silent loss.
pub struct MemoryTransport {
    link: Arc<Link>,
    side: usize,
    buffered: AtomicU64,
    low_threshold: AtomicU64,
    low: Arc<Notify>,
    drop_filter: Mutex<Option<DropFilter>>,
}

/// One end of a [`MemoryTransport::pair`] plus its inbound stream.
pub type MemoryEnd = (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Bytes>);

impl MemoryTransport {
    /// Creates two connected ends.
    pub fn pair() -> (MemoryEnd, MemoryEnd) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let notifies = [Arc::new(Notify::new()), Arc::new(Notify::new())];
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            inbound: Mutex::new([Some(a_tx), Some(b_tx)]),
            notifies: notifies.clone(),
        });

        let [a_low, b_low] = notifies;
        let a = Arc::new(Self::end(Arc::clone(&link), 0, a_low));
        let b = Arc::new(Self::end(link, 1, b_low));
        ((a, a_rx), (b, b_rx))
    }

    fn end(link: Arc<Link>, side: usize, low: Arc<Notify>) -> Self {
        Self {
            link,
            side,
            buffered: AtomicU64::new(0),
            low_threshold: AtomicU64::new(0),
            low,
            drop_filter: Mutex::new(None),
        }
    }

    /// Overrides the buffered counter, waking waiters if it is now low.
    pub fn set_buffered_amount(&self, amount: u64) {
        self.buffered.store(amount, Ordering::SeqCst);
        if amount <= self.low_threshold.load(Ordering::SeqCst) {
            self.low.notify_waiters();
        }
    }

    /// Silently discards outgoing frames for which `filter` returns `true`.
    pub fn drop_when<F>(&self, filter: F)
    where
        F: FnMut(&Bytes) -> bool + Send + 'static,
    {
        *self
            .drop_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    /// Removes any drop filter.
    pub fn clear_drop_filter(&self) {
        *self
            .drop_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn low_threshold(&self) -> u64 {
        self.low_threshold.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        if let Some(filter) = self
            .drop_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            && filter(&frame)
        {
            trace!(len = frame.len(), "memory transport dropped frame");
            return Ok(());
        }

        let inbound = self.link.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        match &inbound[1 - self.side] {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        Arc::clone(&self.low)
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.link.open.store(false, Ordering::SeqCst);
        let mut inbound = self.link.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        inbound[0] = None;
        inbound[1] = None;
        drop(inbound);
        for notify in &self.link.notifies {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_in_order() {
        let ((a, _a_rx), (_b, mut b_rx)) = MemoryTransport::pair();
        a.send(Bytes::from_static(b"one")).unwrap();
        a.send(Bytes::from_static(b"two")).unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn drop_filter_discards_matching_frames() {
        let ((a, _a_rx), (_b, mut b_rx)) = MemoryTransport::pair();
        a.drop_when(|f| f.starts_with(b"x"));

        a.send(Bytes::from_static(b"xdrop")).unwrap();
        a.send(Bytes::from_static(b"keep")).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"keep"));

        a.clear_drop_filter();
        a.send(Bytes::from_static(b"xnow")).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"xnow"));
    }

    #[tokio::test]
    async fn close_ends_both_inbound_streams() {
        let ((a, mut a_rx), (b, mut b_rx)) = MemoryTransport::pair();
        b.close();

        assert!(!a.is_open());
        assert!(matches!(
            a.send(Bytes::from_static(b"late")),
            Err(TransportError::Closed)
        ));
        assert!(a_rx.recv().await.is_none());
        assert!(b_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn lowering_buffer_notifies_waiters() {
        let ((a, _a_rx), _b) = MemoryTransport::pair();
        a.set_buffered_amount_low_threshold(100);
        a.set_buffered_amount(1_000);

        let low = a.buffered_amount_low();
        let notified = low.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        a.set_buffered_amount(50);
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("waiter should be woken");
        assert_eq!(a.buffered_amount(), 50);
    }
}
