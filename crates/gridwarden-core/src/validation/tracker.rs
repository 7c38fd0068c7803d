//! Repeated-error ceiling
//!
//! Stops a task that keeps producing the same validation failure instead of
//! letting it loop until a budget runs out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counts validation failures across a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorTracker {
    max_identical: u32,
    max_consecutive: u32,
    seen: HashMap<String, u32>,
    consecutive: u32,
}

impl Default for ValidationErrorTracker {
    fn default() -> Self {
        Self::new(2, 3)
    }
}

impl ValidationErrorTracker {
    /// Tracker failing on the `max_identical`-th identical message or the
    /// `max_consecutive`-th failure in a row
    pub fn new(max_identical: u32, max_consecutive: u32) -> Self {
        Self {
            max_identical: max_identical.max(1),
            max_consecutive: max_consecutive.max(1),
            seen: HashMap::new(),
            consecutive: 0,
        }
    }

    /// Record a failing validation; returns the reason when the ceiling is hit
    pub fn record_failure(&mut self, message: &str) -> Option<String> {
        self.consecutive += 1;
        let count = self.seen.entry(message.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.max_identical {
            return Some(format!(
                "the same validation error occurred {} times: {}",
                count, message
            ));
        }
        if self.consecutive >= self.max_consecutive {
            return Some(format!(
                "{} consecutive validation failures, last: {}",
                self.consecutive, message
            ));
        }
        None
    }

    /// Record a passing validation
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Failures in a row so far
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_message_twice_trips() {
        let mut tracker = ValidationErrorTracker::default();
        assert!(tracker.record_failure("A1 is text").is_none());
        tracker.record_success();
        let reason = tracker.record_failure("A1 is text").unwrap();
        assert!(reason.contains("2 times"));
    }

    #[test]
    fn three_distinct_failures_in_a_row_trip() {
        let mut tracker = ValidationErrorTracker::default();
        assert!(tracker.record_failure("one").is_none());
        assert!(tracker.record_failure("two").is_none());
        assert!(tracker.record_failure("three").unwrap().contains("3 consecutive"));
    }

    #[test]
    fn success_resets_the_streak() {
        let mut tracker = ValidationErrorTracker::default();
        tracker.record_failure("one");
        tracker.record_failure("two");
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        assert!(tracker.record_failure("three").is_none());
    }
}
