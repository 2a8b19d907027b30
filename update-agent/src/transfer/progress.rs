//! Byte-level progress tracking for archive downloads.

use std::time::{Duration, Instant};
use tracing::info;

/// Progress information for a download
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes expected (from Content-Length, if any)
    pub total_bytes: Option<u64>,

    /// Bytes received so far
    pub transferred_bytes: u64,

    /// Average speed in bytes/second
    pub bytes_per_second: u64,
}

impl TransferProgress {
    /// Percentage complete, when the total is known
    pub fn percent_complete(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.transferred_bytes as f64 / total as f64) * 100.0),
        }
    }
}

/// Tracks a download and logs progress at most once per interval
pub struct ProgressTracker {
    label: String,
    start_time: Instant,
    last_log: Instant,
    log_interval: Duration,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            start_time: now,
            last_log: now,
            log_interval: Duration::from_secs(2),
            progress: TransferProgress {
                total_bytes,
                transferred_bytes: 0,
                bytes_per_second: 0,
            },
        }
    }

    /// Record `chunk` more bytes
    pub fn advance(&mut self, chunk: u64) -> &TransferProgress {
        self.progress.transferred_bytes += chunk;

        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.progress.bytes_per_second = (self.progress.transferred_bytes as f64 / elapsed) as u64;
        }

        if self.last_log.elapsed() >= self.log_interval {
            self.log();
            self.last_log = Instant::now();
        }

        &self.progress
    }

    /// Log the final line of a completed transfer
    pub fn finish(&self) {
        info!(
            "{}: {} in {:.1}s ({})",
            self.label,
            format_bytes(self.progress.transferred_bytes),
            self.start_time.elapsed().as_secs_f64(),
            format_speed(self.progress.bytes_per_second)
        );
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    fn log(&self) {
        match self.progress.percent_complete() {
            Some(percent) => info!(
                "{}: {:.0}% ({} / {}, {})",
                self.label,
                percent,
                format_bytes(self.progress.transferred_bytes),
                format_bytes(self.progress.total_bytes.unwrap_or(0)),
                format_speed(self.progress.bytes_per_second)
            ),
            None => info!(
                "{}: {} ({})",
                self.label,
                format_bytes(self.progress.transferred_bytes),
                format_speed(self.progress.bytes_per_second)
            ),
        }
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
