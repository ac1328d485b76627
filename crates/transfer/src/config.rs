//! Tunables for a transfer session.
//!
//! Every field has a default, so a config file only needs to name the
//! values it overrides. Durations are written as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Timing and sizing knobs shared by the sender, receiver and gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per chunk frame.
    pub chunk_size: usize,

    /// Hard ceiling on the transport's buffered bytes.
    pub buffer_ceiling: u64,
    /// Level a blocked gate waits for before sending again.
    pub drain_target: u64,
    /// Fallback poll while the gate waits for a low-buffer notification.
    #[serde(with = "millis")]
    pub gate_poll_interval: Duration,
    /// Longest a single gate wait may last.
    #[serde(with = "millis")]
    pub gate_timeout: Duration,

    /// Buffered level that counts as flushed before COMPLETE is sent.
    pub flush_target: u64,
    #[serde(with = "millis")]
    pub flush_poll_interval: Duration,
    /// After this long the sender sends COMPLETE anyway.
    #[serde(with = "millis")]
    pub flush_timeout: Duration,

    /// How long the sender waits for ACK or NACK after COMPLETE.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    pub max_retransmit_rounds: u32,

    /// Minimum spacing between progress updates.
    #[serde(with = "millis")]
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_ceiling: 16 * 1024 * 1024,
            drain_target: 8 * 1024 * 1024,
            gate_poll_interval: Duration::from_millis(50),
            gate_timeout: Duration::from_secs(60),
            flush_target: 64 * 1024,
            flush_poll_interval: Duration::from_millis(100),
            flush_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            max_retransmit_rounds: 5,
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl TransferConfig {
    /// Rejects combinations that would deadlock or never make progress.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.chunk_size as u64 > self.buffer_ceiling {
            return Err(TransferError::InvalidConfig(format!(
                "chunk_size ({}) exceeds buffer_ceiling ({})",
                self.chunk_size, self.buffer_ceiling
            )));
        }
        if self.drain_target >= self.buffer_ceiling {
            return Err(TransferError::InvalidConfig(format!(
                "drain_target ({}) must be below buffer_ceiling ({})",
                self.drain_target, self.buffer_ceiling
            )));
        }
        if self.flush_target >= self.buffer_ceiling {
            return Err(TransferError::InvalidConfig(format!(
                "flush_target ({}) must be below buffer_ceiling ({})",
                self.flush_target, self.buffer_ceiling
            )));
        }
        if self.gate_poll_interval.is_zero() || self.flush_poll_interval.is_zero() {
            return Err(TransferError::InvalidConfig(
                "poll intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
