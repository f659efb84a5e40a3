//! Transfer statistics
//!
//! Byte counters and human-readable formatting for bandwidth reports.

use std::time::{Duration, Instant};

/// Byte counter for one upload or download
#[derive(Debug, Clone)]
pub struct TransferStats {
    started: Instant,
    bytes: u64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::start()
    }
}

impl TransferStats {
    /// Start counting now
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            bytes: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average bandwidth in bytes per second
    pub fn bandwidth(&self) -> f64 {
        bandwidth(self.bytes, self.elapsed())
    }

    /// `"12.3 MB/s"`
    pub fn bandwidth_repr(&self) -> String {
        format!("{}/s", format_bytes(self.bandwidth() as u64))
    }
}

fn bandwidth(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return bytes as f64;
    }
    bytes as f64 / secs
}

/// Format a byte count with decimal units (`"512 B"`, `"12.3 MB"`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes <= 1000 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size > 1000.0 && unit_index < UNITS.len() - 1 {
        size /= 1000.0;
        unit_index += 1;
    }
    format!("{:.1} {}", size, UNITS[unit_index])
}

/// Format a duration as `h:mm:ss`
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}
