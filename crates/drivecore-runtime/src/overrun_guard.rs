//! [`OverrunGuard`] – repeated hard-deadline overrun detector.
//!
//! A single slow cycle is tolerated: the pipeline already degrades by reusing
//! the previous avoidance and route outputs. A cycle that runs past the
//! *hard* deadline several times in a row is a fatal condition and must hand
//! control to the human driver.
//!
//! # Algorithm
//!
//! The guard keeps a rolling window of the last `threshold` cycles, each
//! marked as overrun or not. [`OverrunGuard::record`] returns `true` once
//! the window is full and every entry is an overrun.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use drivecore_runtime::overrun_guard::OverrunGuard;
//!
//! let mut guard = OverrunGuard::new(Duration::from_millis(250), 3);
//! let slow = Duration::from_millis(300);
//!
//! assert!(!guard.record(slow));
//! assert!(!guard.record(slow));
//! assert!(guard.record(slow)); // third consecutive overrun → hard fault
//!
//! guard.reset();
//! assert!(!guard.record(slow));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use drivecore_types::PipelineConfig;

// ─────────────────────────────────────────────────────────────────────────────
// OverrunGuard
// ─────────────────────────────────────────────────────────────────────────────

pub struct OverrunGuard {
    hard_deadline: Duration,
    /// Consecutive overruns that constitute a hard fault.
    threshold: usize,
    history: VecDeque<bool>,
}

impl OverrunGuard {
    /// `threshold` values below 1 are treated as 1.
    pub fn new(hard_deadline: Duration, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            hard_deadline,
            threshold,
            history: VecDeque::with_capacity(threshold),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.hard_deadline_ms),
            config.max_consecutive_overruns,
        )
    }

    /// Record the wall-clock duration of one cycle.
    ///
    /// Returns `true` when the last `threshold` cycles all ran past the hard
    /// deadline.
    pub fn record(&mut self, elapsed: Duration) -> bool {
        self.history.push_back(elapsed > self.hard_deadline);
        while self.history.len() > self.threshold {
            self.history.pop_front();
        }
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.history.len() >= self.threshold && self.history.iter().all(|o| *o)
    }

    /// Overruns at the end of the window without an on-time cycle between.
    pub fn consecutive(&self) -> usize {
        self.history.iter().rev().take_while(|o| **o).count()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_millis(250);

    fn slow() -> Duration {
        Duration::from_millis(260)
    }

    fn on_time() -> Duration {
        Duration::from_millis(40)
    }

    #[test]
    fn on_time_cycles_never_trip() {
        let mut guard = OverrunGuard::new(DEADLINE, 3);
        for _ in 0..10 {
            assert!(!guard.record(on_time()));
        }
        assert_eq!(guard.consecutive(), 0);
    }

    #[test]
    fn trips_at_threshold() {
        let mut guard = OverrunGuard::new(DEADLINE, 3);
        assert!(!guard.record(slow()));
        assert!(!guard.record(slow()));
        assert!(guard.record(slow()));
        assert_eq!(guard.consecutive(), 3);
    }

    #[test]
    fn exactly_at_deadline_is_not_an_overrun() {
        let mut guard = OverrunGuard::new(DEADLINE, 1);
        assert!(!guard.record(DEADLINE));
    }

    #[test]
    fn on_time_cycle_breaks_streak() {
        let mut guard = OverrunGuard::new(DEADLINE, 3);
        guard.record(slow());
        guard.record(slow());
        guard.record(on_time());
        assert!(!guard.is_tripped());
        assert_eq!(guard.consecutive(), 0);
        guard.record(slow());
        guard.record(slow());
        assert!(guard.record(slow()));
    }

    #[test]
    fn reset_clears_history() {
        let mut guard = OverrunGuard::new(DEADLINE, 2);
        guard.record(slow());
        assert!(guard.record(slow()));
        guard.reset();
        assert!(!guard.record(slow()));
    }

    #[test]
    fn zero_threshold_behaves_as_one() {
        let mut guard = OverrunGuard::new(DEADLINE, 0);
        assert!(guard.record(slow()));
    }

    #[test]
    fn from_config_uses_hard_deadline() {
        let config = PipelineConfig::default();
        let mut guard = OverrunGuard::from_config(&config);
        let just_over = Duration::from_millis(config.hard_deadline_ms + 1);
        let tripped = (0..config.max_consecutive_overruns)
            .map(|_| guard.record(just_over))
            .last();
        assert_eq!(tripped, Some(true));
    }
}
