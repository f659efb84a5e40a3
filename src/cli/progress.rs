//! Progress display module
//!
//! Handles displaying upload progress in the CLI.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::transfer::{format_bytes, format_duration};

const BAR_WIDTH: usize = 40;

/// Carriage-return progress line for transfers
pub struct ProgressDisplay {
    start_time: Instant,
    /// Last time a line was printed, `None` before the first one
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
    /// Size of the transfer in bytes, if known
    total: Option<u64>,
}

impl ProgressDisplay {
    pub fn new(quiet: bool, total: Option<u64>) -> Self {
        Self::with_interval(quiet, total, Duration::from_millis(500))
    }

    /// Create a progress display with custom update interval
    pub fn with_interval(quiet: bool, total: Option<u64>, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
            total,
        }
    }

    /// Update the progress line with a fraction between 0 and 1
    ///
    /// Updates closer than the interval are dropped, except the final one.
    pub fn update(&mut self, fraction: f64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let due = self.last_update.map_or(true, |t| t.elapsed() >= self.update_interval);
        if !due && fraction < 1.0 {
            return Ok(());
        }
        self.last_update = Some(Instant::now());

        let line = render_line(fraction, self.total, self.start_time.elapsed());
        let mut stdout = io::stdout();
        write!(stdout, "\r\x1b[2K{}", line)?;
        stdout.flush()
    }

    /// Callback suitable for the transfer progress hooks
    ///
    /// Terminal write errors are ignored so they never abort a transfer.
    pub fn callback(&mut self) -> impl FnMut(f64) + Send + '_ {
        move |fraction| {
            let _ = self.update(fraction);
        }
    }

    /// End the progress line
    pub fn finish(&mut self) -> io::Result<()> {
        if self.quiet || self.last_update.is_none() {
            return Ok(());
        }
        println!();
        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

/// Format one progress line: bar, percentage, bytes sent and elapsed time
pub fn render_line(fraction: f64, total: Option<u64>, elapsed: Duration) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    let bar = "=".repeat(filled) + &" ".repeat(BAR_WIDTH - filled);

    let mut line = format!("[{}] {:5.1}%", bar, fraction * 100.0);
    if let Some(total) = total {
        let sent = (fraction * total as f64) as u64;
        line.push_str(&format!(" | {} / {}", format_bytes(sent), format_bytes(total)));
    }
    line.push_str(&format!(" | {}", format_duration(elapsed)));
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_line() {
        let line = render_line(0.5, Some(10_000_000), Duration::from_secs(65));
        assert!(line.starts_with(&format!("[{}{}]", "=".repeat(20), " ".repeat(20))));
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("5.0 MB / 10.0 MB"));
        assert!(line.ends_with("0:01:05"));
    }

    #[test]
    fn test_render_line_clamps() {
        let line = render_line(1.7, None, Duration::ZERO);
        assert!(line.contains(&"=".repeat(BAR_WIDTH)));
        assert!(line.contains("100.0%"));
        assert!(!line.contains(" / "));
    }

    #[test]
    fn test_quiet_display_prints_nothing() {
        let mut display = ProgressDisplay::new(true, None);
        assert!(display.is_quiet());
        display.update(0.5).unwrap();
        display.finish().unwrap();
        assert!(display.last_update.is_none());
    }
}
