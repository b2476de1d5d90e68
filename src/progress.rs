//! Progress counters and the unknown-work sentinel.
//!
//! # Invariants
//! - `UNKNOWN_WORK` (`-1`) marks an indeterminate counter.
//! - Whenever both counters are non-negative, `0 <= work_done <= total_work`.
//!   Violations are clamped, not rejected: a unit reporting past its total is
//!   pinned to the total, never allowed to overflow it.

use serde::Serialize;

/// Sentinel for "amount of work is unknown" (indeterminate progress).
pub const UNKNOWN_WORK: i64 = -1;

/// A point-in-time progress reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub work_done: i64,
    pub total_work: i64,
}

impl Progress {
    /// The initial, indeterminate reading.
    pub fn indeterminate() -> Self {
        Self {
            work_done: UNKNOWN_WORK,
            total_work: UNKNOWN_WORK,
        }
    }

    /// Build a reading from raw counters, normalizing and clamping.
    ///
    /// Any negative counter is normalized to `UNKNOWN_WORK`. When both
    /// counters are known, `work_done` is clamped into `[0, total_work]`.
    pub fn clamped(work_done: i64, total_work: i64) -> Self {
        let total_work = if total_work < 0 { UNKNOWN_WORK } else { total_work };
        let work_done = if work_done < 0 {
            UNKNOWN_WORK
        } else if total_work >= 0 {
            work_done.min(total_work)
        } else {
            work_done
        };
        Self {
            work_done,
            total_work,
        }
    }

    /// Whether either counter is unknown.
    pub fn is_indeterminate(&self) -> bool {
        self.work_done < 0 || self.total_work < 0
    }

    /// Completed fraction in `[0.0, 1.0]`, or `None` while indeterminate or
    /// before any total is known.
    pub fn fraction(&self) -> Option<f64> {
        if self.is_indeterminate() || self.total_work == 0 {
            return None;
        }
        Some(self.work_done as f64 / self.total_work as f64)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::indeterminate()
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_indeterminate() {
            write!(f, "?")
        } else {
            write!(f, "{} / {}", self.work_done, self.total_work)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reading_is_indeterminate() {
        let p = Progress::default();
        assert!(p.is_indeterminate());
        assert_eq!(p.work_done, UNKNOWN_WORK);
        assert_eq!(p.total_work, UNKNOWN_WORK);
        assert_eq!(p.fraction(), None);
    }

    #[test]
    fn test_overshoot_is_clamped_to_total() {
        let p = Progress::clamped(150, 100);
        assert_eq!(p.work_done, 100);
        assert_eq!(p.total_work, 100);
    }

    #[test]
    fn test_negative_counters_normalize_to_unknown() {
        let p = Progress::clamped(-7, 100);
        assert_eq!(p.work_done, UNKNOWN_WORK);
        assert_eq!(p.total_work, 100);
        assert!(p.is_indeterminate());

        let p = Progress::clamped(5, -3);
        assert_eq!(p.total_work, UNKNOWN_WORK);
        assert!(p.is_indeterminate());
    }

    #[test]
    fn test_fraction() {
        assert_eq!(Progress::clamped(25, 100).fraction(), Some(0.25));
        assert_eq!(Progress::clamped(0, 0).fraction(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Progress::clamped(3, 10).to_string(), "3 / 10");
        assert_eq!(Progress::indeterminate().to_string(), "?");
    }
}
