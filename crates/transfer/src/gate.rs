//! Send-side flow control for a transport without any of its own.
//!
//! A frame is only handed to [`Transport::send`] if it keeps the queue
//! under the ceiling. Otherwise the gate waits for the queue to drain to
//! the drain target, woken by whichever comes first: the transport's
//! low-buffer notification, a fallback poll, cancellation, or the overall
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{Transport, TransportError};
use crate::{TransferConfig, TransferError};

/// Wraps a transport's `send` with the safe-buffer discipline.
pub struct BackpressureGate {
    transport: Arc<dyn Transport>,
    ceiling: u64,
    drain_target: u64,
    poll_interval: Duration,
    max_wait: Duration,
}

impl BackpressureGate {
    /// Creates a gate and points the transport's low-buffer threshold at
    /// the drain target.
    pub fn new(transport: Arc<dyn Transport>, config: &TransferConfig) -> Self {
        transport.set_buffered_amount_low_threshold(config.drain_target);
        Self {
            transport,
            ceiling: config.buffer_ceiling,
            drain_target: config.drain_target,
            poll_interval: config.gate_poll_interval,
            max_wait: config.gate_timeout,
        }
    }

    /// Sends `frame`, first waiting for room if it would push the queue
    /// past the ceiling.
    pub async fn submit(
        &self,
        frame: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if !self.transport.is_open() {
            return Err(TransferError::ConnectionNotReady);
        }

        let len = frame.len() as u64;
        let buffered = self.transport.buffered_amount();
        if buffered.saturating_add(len) > self.ceiling {
            trace!(buffered, len, ceiling = self.ceiling, "send queue full, waiting");
            self.wait_for_drain(cancel).await?;
        }

        self.transport.send(frame).map_err(|e| match e {
            TransportError::Closed => TransferError::ConnectionNotReady,
            other => TransferError::Transport(other),
        })
    }

    async fn wait_for_drain(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let started = Instant::now();
        let deadline = started + self.max_wait;
        let low = self.transport.buffered_amount_low();

        loop {
            // Register before checking so a notification between the check
            // and the select is not lost.
            let notified = low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.transport.is_open() {
                return Err(TransferError::ConnectionNotReady);
            }

            let buffered = self.transport.buffered_amount();
            if buffered <= self.drain_target {
                debug!(
                    buffered,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "send queue drained"
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    buffered,
                    drain_target = self.drain_target,
                    "send queue did not drain in time"
                );
                return Err(TransferError::BackpressureTimeout(self.max_wait));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}
