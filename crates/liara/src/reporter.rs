//! # Output sink
//!
//! Deployment stages report their progress through the [`Reporter`] trait
//! instead of touching the console directly.

use std::{cell::RefCell, time::Duration};

use byte_unit::Byte;
use indicatif::ProgressBar;

/// Receiver of user-facing deployment progress.
pub(crate) trait Reporter {
    /// Start a new named phase.
    fn phase(&self, message: &str);

    /// Report transferred bytes of the current phase.
    fn progress(&self, transferred: u64, total: u64);

    /// Print a permanent line of output.
    fn println(&self, line: &str);

    /// Finish reporting with a final message.
    fn finish(&self, message: &str);
}

/// Format a byte count using binary units.
pub(crate) fn human_size(bytes: u64) -> String {
    Byte::from_bytes(bytes.into())
        .get_appropriate_unit(true)
        .to_string()
}

/// Console reporter backed by an [`indicatif`] spinner.
pub(crate) struct ConsoleReporter {
    /// Spinner displayed while the deployment is in progress.
    progress: ProgressBar,

    /// Message of the current phase.
    phase: RefCell<String>,
}

impl ConsoleReporter {
    /// Create a new spinner and start drawing it.
    pub(crate) fn new() -> Self {
        let progress = ProgressBar::new_spinner();
        progress.enable_steady_tick(Duration::from_millis(150));

        Self {
            progress,
            phase: RefCell::default(),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn phase(&self, message: &str) {
        *self.phase.borrow_mut() = message.to_string();
        self.progress.set_message(message.to_string());
    }

    fn progress(&self, transferred: u64, total: u64) {
        let percent = (transferred * 100).checked_div(total).unwrap_or(100);

        self.progress.set_message(format!(
            "{} {} / {} ({percent}%)",
            self.phase.borrow(),
            human_size(transferred),
            human_size(total),
        ));
    }

    fn println(&self, line: &str) {
        self.progress.suspend(|| println!("{line}"));
    }

    fn finish(&self, message: &str) {
        self.progress.finish_with_message(message.to_string());
    }
}

impl Drop for ConsoleReporter {
    fn drop(&mut self) {
        if !self.progress.is_finished() {
            self.progress.finish_and_clear();
        }
    }
}
