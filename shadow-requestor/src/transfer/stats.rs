//! Transfer statistics for components and whole runs.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Counters for one transfer (a component, or a whole run when merged)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Whole files copied
    pub files: usize,

    /// Partial files copied (byte ranges only)
    pub partial_files: usize,

    /// Files staged for replacement at next boot
    pub staged_files: usize,

    /// Files skipped (excluded or handled elsewhere)
    pub skipped_files: usize,

    /// Bytes written
    pub bytes: u64,
}

impl TransferStats {
    pub fn record_file(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn record_partial(&mut self, bytes: u64) {
        self.partial_files += 1;
        self.bytes += bytes;
    }

    pub fn record_staged(&mut self, bytes: u64) {
        self.staged_files += 1;
        self.bytes += bytes;
    }

    pub fn record_skipped(&mut self) {
        self.skipped_files += 1;
    }

    /// Files written by any means
    pub fn total_files(&self) -> usize {
        self.files + self.partial_files + self.staged_files
    }

    pub fn merge(&mut self, other: &TransferStats) {
        self.files += other.files;
        self.partial_files += other.partial_files;
        self.staged_files += other.staged_files;
        self.skipped_files += other.skipped_files;
        self.bytes += other.bytes;
    }
}

/// Wall-clock timing for a run
pub struct TransferTimer {
    start_time: Instant,
}

impl TransferTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self, bytes: u64) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64 / elapsed) as u64
        } else {
            0
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
