//! Exclusion window arithmetic
//!
//! Visibility is derived purely from an entry's insertion time, the list's
//! offset and duration, and "now". All values are millisecond scores so the
//! single-entry check and the store range scans agree on every boundary.

use crate::config::IgnoreListConfig;
use crate::store::ScoreBound;
use crate::utils::duration_score;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExclusionWindow {
    offset: f64,
    duration: f64,
}

impl ExclusionWindow {
    pub fn new(offset: Duration, duration: Duration) -> Self {
        Self {
            offset: duration_score(offset),
            duration: duration_score(duration),
        }
    }

    pub fn for_list(list: &IgnoreListConfig) -> Self {
        Self::new(list.offset(), list.duration())
    }

    pub fn is_hard_ttl(&self) -> bool {
        self.duration == 0.0
    }

    /// Whether an entry inserted at `inserted` hides its player at `now`
    pub fn hides(&self, inserted: f64, now: f64) -> bool {
        let start = inserted + self.offset;
        if now < start {
            return false;
        }
        self.is_hard_ttl() || now < start + self.duration
    }

    /// Insertion-score range of the entries hiding their player at `now`
    pub fn hiding_range(&self, now: f64) -> (ScoreBound, ScoreBound) {
        let max = ScoreBound::Inclusive(now - self.offset);
        let min = if self.is_hard_ttl() {
            ScoreBound::Unbounded
        } else {
            ScoreBound::Exclusive(now - self.offset - self.duration)
        };
        (min, max)
    }

    /// Insertion-score range of entries whose window has fully elapsed.
    /// Hard-TTL entries never elapse.
    pub fn elapsed_range(&self, now: f64) -> Option<(ScoreBound, ScoreBound)> {
        if self.is_hard_ttl() {
            return None;
        }
        Some((
            ScoreBound::Unbounded,
            ScoreBound::Inclusive(now - self.offset - self.duration),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECOND: f64 = 1000.0;

    fn in_range((min, max): (ScoreBound, ScoreBound), score: f64) -> bool {
        min.admits_from_below(score) && max.admits_from_above(score)
    }

    #[test]
    fn test_timed_window_boundaries() {
        let window = ExclusionWindow::new(Duration::ZERO, Duration::from_secs(800));
        let t0 = 1_000.0 * SECOND;

        assert!(window.hides(t0, t0));
        assert!(window.hides(t0, t0 + 799.999 * SECOND));
        assert!(!window.hides(t0, t0 + 800.0 * SECOND));
        assert!(!window.hides(t0, t0 - 1.0));
    }

    #[test]
    fn test_hard_ttl_hides_forever_after_offset() {
        let window = ExclusionWindow::new(Duration::from_secs(800), Duration::ZERO);
        let t0 = 5_000.0 * SECOND;

        assert!(!window.hides(t0, t0));
        assert!(!window.hides(t0, t0 + 799.0 * SECOND));
        assert!(window.hides(t0, t0 + 800.0 * SECOND));
        assert!(window.hides(t0, t0 + 1_000_000.0 * SECOND));
        assert!(window.elapsed_range(t0).is_none());
    }

    #[test]
    fn test_offset_and_duration_combined() {
        let window = ExclusionWindow::new(Duration::from_secs(10), Duration::from_secs(20));
        let t0 = 0.0;

        assert!(!window.hides(t0, 9.0 * SECOND));
        assert!(window.hides(t0, 10.0 * SECOND));
        assert!(window.hides(t0, 29.0 * SECOND));
        assert!(!window.hides(t0, 30.0 * SECOND));
    }

    proptest! {
        #[test]
        fn prop_hiding_range_matches_hides(
            t0 in 0i64..10_000_000,
            offset_s in 0u64..2_000,
            duration_s in 0u64..2_000,
            delta in -3_000_000i64..3_000_000,
        ) {
            let window = ExclusionWindow::new(
                Duration::from_secs(offset_s),
                Duration::from_secs(duration_s),
            );
            let inserted = t0 as f64;
            let now = (t0 + delta) as f64;

            prop_assert_eq!(window.hides(inserted, now), in_range(window.hiding_range(now), inserted));
        }

        #[test]
        fn prop_visibility_law(
            t0 in 0i64..10_000_000,
            offset_s in 0u64..2_000,
            duration_s in 0u64..2_000,
            delta in -3_000_000i64..3_000_000,
        ) {
            let window = ExclusionWindow::new(
                Duration::from_secs(offset_s),
                Duration::from_secs(duration_s),
            );
            let now = t0 + delta;
            let start = t0 + offset_s as i64 * 1000;
            let end = start + duration_s as i64 * 1000;

            let expected_hidden = if duration_s == 0 {
                now >= start
            } else {
                now >= start && now < end
            };
            prop_assert_eq!(window.hides(t0 as f64, now as f64), expected_hidden);
        }

        #[test]
        fn prop_elapsed_entries_never_hide(
            t0 in 0i64..10_000_000,
            offset_s in 0u64..2_000,
            duration_s in 1u64..2_000,
            delta in 0i64..5_000_000,
        ) {
            let window = ExclusionWindow::new(
                Duration::from_secs(offset_s),
                Duration::from_secs(duration_s),
            );
            let now = (t0 + delta) as f64;
            let elapsed = window.elapsed_range(now).unwrap();
            if in_range(elapsed, t0 as f64) {
                prop_assert!(!window.hides(t0 as f64, now));
            }
        }
    }
}
