//! Utility functions for the state-storage layer

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a timestamp into the sorted-set score used for time-ordered entries.
///
/// Scores are whole milliseconds so that window boundaries compare exactly.
pub fn timestamp_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Inverse of [`timestamp_score`]
pub fn score_timestamp(score: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(score as i64)
        .single()
        .unwrap_or_else(current_timestamp)
}

/// Millisecond length of a duration as a score delta
pub fn duration_score(duration: Duration) -> f64 {
    duration.as_millis() as f64
}

/// Source of "now" for visibility decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        current_timestamp()
    }
}

/// Clock that only moves when told to, for simulating long windows
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += chrono::Duration::milliseconds(by.as_millis() as i64);
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = at;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(current_timestamp())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Bounded exponential backoff with proportional jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    /// Delay to wait before the next attempt; grows the base delay up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = base.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));

        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = base.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_score_roundtrip_is_millisecond_exact() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(timestamp_score(at), 1_700_000_000_123.0);
        assert_eq!(score_timestamp(timestamp_score(at)), at);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.timestamp_millis_opt(0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(800));
        assert_eq!(clock.now().timestamp(), 800);
    }

    #[test]
    fn test_backoff_grows_to_cap_without_jitter() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2.0,
            0.0,
        );
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, 0.5);
        for _ in 0..50 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
    }
}
