//! Consecutive beacon-miss accounting.

use std::sync::atomic::{AtomicU32, Ordering};

/// What a recorded miss means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Misses so far; expected under channel contention, report only.
    BelowThreshold(u32),
    /// The run just reached the threshold; escalate to recovery.
    ThresholdCrossed(u32),
    /// Still stuck past the threshold; recovery has already been requested.
    AboveThreshold(u32),
}

/// Counts consecutive trigger periods where the previous beacon never left
/// the queue. A clean transmission clears the run.
#[derive(Debug)]
pub struct MissCounter {
    count: AtomicU32,
    threshold: u32,
}

impl MissCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Records one missed period. `ThresholdCrossed` is returned exactly
    /// once per run, on the miss that reaches the threshold.
    pub fn record(&self) -> MissOutcome {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n < self.threshold {
            MissOutcome::BelowThreshold(n)
        } else if n == self.threshold {
            MissOutcome::ThresholdCrossed(n)
        } else {
            MissOutcome::AboveThreshold(n)
        }
    }

    /// Ends the run after a clean transmission, returning its length if any
    /// periods were missed.
    pub fn clear(&self) -> Option<u32> {
        let prev = self.count.swap(0, Ordering::Relaxed);
        (prev != 0).then_some(prev)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_fires_once() {
        let counter = MissCounter::new(3);
        assert_eq!(counter.record(), MissOutcome::BelowThreshold(1));
        assert_eq!(counter.record(), MissOutcome::BelowThreshold(2));
        assert_eq!(counter.record(), MissOutcome::ThresholdCrossed(3));
        assert_eq!(counter.record(), MissOutcome::AboveThreshold(4));
        assert_eq!(counter.record(), MissOutcome::AboveThreshold(5));
    }

    #[test]
    fn test_clear_reports_run_length() {
        let counter = MissCounter::new(3);
        assert_eq!(counter.clear(), None);
        counter.record();
        counter.record();
        assert_eq!(counter.clear(), Some(2));
        assert_eq!(counter.count(), 0);
        // a fresh run can cross the threshold again
        counter.record();
        counter.record();
        assert_eq!(counter.record(), MissOutcome::ThresholdCrossed(3));
    }
}
