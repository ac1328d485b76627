use std::time::Duration;

use tokio::time::Instant;

use crate::types::ProgressSnapshot;

/// Default spacing between progress notifications.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Computes transfer statistics from raw counters. Pure; call at any cadence.
pub fn compute_progress(
    chunks_processed: u32,
    total_chunks: u32,
    elapsed_secs: f64,
    bytes_transferred: u64,
    total_bytes: u64,
) -> ProgressSnapshot {
    let bytes = bytes_transferred.min(total_bytes);

    let percentage = if total_chunks == 0 {
        100.0
    } else {
        (chunks_processed as f64 / total_chunks as f64 * 100.0).clamp(0.0, 100.0)
    };

    let speed = if elapsed_secs > 0.0 {
        bytes as f64 / elapsed_secs
    } else {
        0.0
    };

    let eta = if speed > 0.0 {
        (total_bytes - bytes) as f64 / speed
    } else {
        0.0
    };

    ProgressSnapshot {
        chunks_transferred: chunks_processed,
        total_chunks,
        bytes_transferred: bytes,
        total_bytes,
        percentage,
        speed,
        eta,
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Lets an update through at most once per interval.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` (and records `now`) if an update may be emitted.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

/// Per-session progress bookkeeping: start time, totals and throttle.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    total_chunks: u32,
    total_bytes: u64,
    throttle: ProgressThrottle,
}

impl ProgressTracker {
    pub fn new(total_chunks: u32, total_bytes: u64, interval: Duration, now: Instant) -> Self {
        Self {
            started: now,
            total_chunks,
            total_bytes,
            throttle: ProgressThrottle::new(interval),
        }
    }

    pub fn set_total_chunks(&mut self, total_chunks: u32) {
        self.total_chunks = total_chunks;
    }

    /// Unthrottled snapshot.
    pub fn snapshot(&self, chunks: u32, bytes: u64, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        compute_progress(chunks, self.total_chunks, elapsed, bytes, self.total_bytes)
    }

    /// Snapshot, or `None` if the previous one was too recent.
    pub fn throttled(&mut self, chunks: u32, bytes: u64, now: Instant) -> Option<ProgressSnapshot> {
        self.throttle
            .ready(now)
            .then(|| self.snapshot(chunks, bytes, now))
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn scaled(value: f64, units: &[&str]) -> String {
    if value <= 0.0 {
        return format!("0 {}", units[0]);
    }
    let exp = (value.ln() / 1024f64.ln()).floor().clamp(0.0, (units.len() - 1) as f64);
    format!("{:.2} {}", value / 1024f64.powi(exp as i32), units[exp as usize])
}

/// `1536` → `"1.50 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    scaled(bytes as f64, &["B", "KB", "MB", "GB", "TB"])
}

/// `2_097_152.0` → `"2.00 MB/s"`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    scaled(bytes_per_sec, &["B/s", "KB/s", "MB/s", "GB/s"])
}

/// Human-readable remaining time: `"1h 2m 3s"`, `"4m 5s"`, `"6s"`.
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "calculating...".into();
    }
    if seconds == 0.0 {
        return "complete".into();
    }

    let total = seconds as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Clamps to `[0, 100]` and prints one decimal.
pub fn format_percentage(value: f64) -> String {
    format!("{:.1}%", value.clamp(0.0, 100.0))
}
