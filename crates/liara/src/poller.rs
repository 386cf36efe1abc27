use std::time::Duration;

/// Fixed-delay polling timer.
///
/// The first tick completes immediately, every following tick waits for the full interval.
pub(crate) struct Poller {
    /// Delay between ticks.
    interval: Duration,

    /// Whether the first tick already happened.
    armed: bool,
}

impl Poller {
    /// Create a new poller.
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            armed: false,
        }
    }

    /// Wait for the next tick.
    pub(crate) async fn tick(&mut self) {
        if self.armed {
            tokio::time::sleep(self.interval).await;
        }

        self.armed = true;
    }
}
