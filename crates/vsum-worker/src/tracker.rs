//! Log suppression for loops that keep hitting the same failure.

use tracing::{info, warn};

/// Counts consecutive failures of a repeating operation and tells the caller
/// whether the next one is still worth logging.
#[derive(Debug)]
pub struct FailureTracker {
    name: &'static str,
    consecutive_failures: u32,
    max_logged_failures: u32,
}

impl FailureTracker {
    pub fn new(name: &'static str, max_logged_failures: u32) -> Self {
        Self {
            name,
            consecutive_failures: 0,
            max_logged_failures,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.max_logged_failures {
            info!(
                operation = self.name,
                failures = self.consecutive_failures,
                "Recovered after repeated failures"
            );
        }
        self.consecutive_failures = 0;
    }

    /// Returns true if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == self.max_logged_failures + 1 {
            warn!(
                operation = self.name,
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
        }
        self.consecutive_failures <= self.max_logged_failures
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_after_limit_and_resets_on_success() {
        let mut tracker = FailureTracker::new("poll", 2);

        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert_eq!(tracker.failure_count(), 4);

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }
}
