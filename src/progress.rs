//! Progress reporting for the re-encryption simulator
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::reencrypt::CoordinatorProgress;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays re-encryption status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &CoordinatorProgress, elapsed: Duration) {
        let rate = if elapsed.as_secs_f64() > 0.0 {
            progress.files_reencrypted as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let msg = format!(
            "Zones: {}/{} | Re-encrypted: {} | Failures: {} | Rate: {:.0}/s | Queued: {} | Pending: {}",
            progress.active_zones,
            progress.zones,
            format_number(progress.files_reencrypted),
            progress.num_failures,
            rate,
            progress.queued_batches,
            progress.outstanding_tasks,
        );

        self.bar.set_message(msg);
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Print the run header
pub fn print_header(zone_path: &str, key_version: &str, threads: usize, batch_size: usize) {
    eprintln!("{}", style("ez-rewrap").bold());
    eprintln!("Zone:       {}", style(zone_path).cyan());
    eprintln!("Target key: {}", style(key_version).cyan());
    eprintln!("Threads:    {}", threads);
    eprintln!("Batch size: {}", batch_size);
    eprintln!();
}

/// Print the final summary
pub fn print_summary(
    state: &str,
    files_reencrypted: u64,
    num_failures: u64,
    elapsed: Duration,
) {
    let rate = if elapsed.as_secs_f64() > 0.0 {
        files_reencrypted as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    eprintln!();
    eprintln!("{}", style("Re-encryption finished").bold());
    eprintln!("State:         {}", style(state).cyan());
    eprintln!("Re-encrypted:  {}", format_number(files_reencrypted));
    eprintln!("Failures:      {}", format_number(num_failures));
    eprintln!("Elapsed:       {}", format_elapsed(elapsed));
    eprintln!("Rate:          {:.0} files/s", rate);
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Format a duration as h/m/s
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
