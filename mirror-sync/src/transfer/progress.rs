//! Byte-level progress tracking for a transfer phase.
//!
//! Transfer tasks only touch [`PhaseProgress`] through atomic increments; the
//! reporter samples it periodically to derive speed and completion estimates.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time view of a running phase
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Total bytes to transfer
    pub total_bytes: u64,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Files finished, successfully or not
    pub files_processed: usize,

    /// Files that failed
    pub files_failed: usize,

    /// Total number of files
    pub total_files: usize,
}

/// Shared counters updated by transfer tasks.
#[derive(Debug)]
pub struct PhaseProgress {
    total_bytes: u64,
    total_files: usize,
    transferred: AtomicU64,
    processed: AtomicUsize,
    failed: AtomicUsize,
}

impl PhaseProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            total_files,
            transferred: AtomicU64::new(0),
            processed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn snapshot(&self) -> TransferProgress {
        let transferred_bytes = self.transferred_bytes();
        let percent_complete = if self.total_bytes > 0 {
            ((transferred_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_files == 0 {
            100.0
        } else {
            0.0
        };

        TransferProgress {
            total_bytes: self.total_bytes,
            transferred_bytes,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete,
            files_processed: self.processed.load(Ordering::Relaxed),
            files_failed: self.failed.load(Ordering::Relaxed),
            total_files: self.total_files,
        }
    }
}

/// Derives speed and ETA from successive samples of a [`PhaseProgress`].
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
        }
    }

    /// Take a sample and fill in instantaneous speed and ETA.
    pub fn sample(&mut self, progress: &PhaseProgress) -> TransferProgress {
        let mut snapshot = progress.snapshot();
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = snapshot.transferred_bytes.saturating_sub(self.last_bytes);
            snapshot.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        if snapshot.bytes_per_second > 0 {
            let remaining = snapshot.total_bytes.saturating_sub(snapshot.transferred_bytes);
            snapshot.eta_seconds = remaining / snapshot.bytes_per_second;
        }

        self.last_update_time = now;
        self.last_bytes = snapshot.transferred_bytes;
        snapshot
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self, progress: &PhaseProgress) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (progress.transferred_bytes() as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
