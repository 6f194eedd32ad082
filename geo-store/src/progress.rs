//! Lightweight progress reporting for the ingestion pipeline.
//!
//! Use `NoopProgress` for headless runs (default) and `IndicatifProgress`
//! for CLI/TTY.

use indicatif::{ProgressBar, ProgressStyle};

/// Minimal progress interface driven once per committed chunk.
pub trait Progress: Send + Sync {
    /// Advance by `records` and show a short message.
    fn chunk(&self, _records: u64, _msg: &str) {}
    /// Finish the UI.
    fn finish(&self, _msg: &str) {}
}

/// No-op reporter for servers/headless runs.
#[derive(Default, Clone, Copy)]
pub struct NoopProgress;
impl Progress for NoopProgress {}

/// Indicatif spinner counting uploaded records (source length is unknown).
pub struct IndicatifProgress {
    pb: ProgressBar,
}

impl IndicatifProgress {
    pub fn spinner() -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {pos} records {msg}") {
            pb.set_style(style.tick_chars("-\\|/ "));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { pb }
    }
}

impl Progress for IndicatifProgress {
    fn chunk(&self, records: u64, msg: &str) {
        self.pb.inc(records);
        self.pb.set_message(msg.to_string());
    }
    fn finish(&self, msg: &str) {
        self.pb.finish_with_message(msg.to_string());
    }
}
