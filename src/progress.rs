use indicatif::{ProgressBar, ProgressStyle};

/// Bytes copied between two progress updates.
pub const PROGRESS_STEP: u64 = 1024 * 1024;

/// Copy progress on stderr. Stdout carries the diff stream, so nothing here
/// ever writes to it.
pub struct Progress {
    bar: ProgressBar,
    pending: u64,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed_precise}] {bytes} copied"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        Progress { bar, pending: 0 }
    }

    pub fn hidden() -> Self {
        Progress::new(false)
    }

    pub fn inc(&mut self, bytes: u64) {
        self.pending += bytes;
        if self.pending >= PROGRESS_STEP {
            self.bar.inc(self.pending);
            self.pending = 0;
        }
    }

    /// Total reported to the bar so far.
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&mut self) {
        self.bar.inc(self.pending);
        self.pending = 0;
        self.bar.finish_at_current_pos();
    }
}
