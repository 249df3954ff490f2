//! Ignore list configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Players under evaluation by the evaluator
pub const PROPOSED_LIST: &str = "proposed";
/// Players that received an assignment
pub const DEINDEXED_LIST: &str = "deindexed";
/// Requests that sat unmatched for too long
pub const EXPIRED_LIST: &str = "expired";

/// A named, time-windowed exclusion list
///
/// A player marked at `t0` is hidden from `t0 + offset` on. With a non-zero
/// duration it becomes visible again at `t0 + offset + duration`; with a zero
/// duration it stays hidden for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreListConfig {
    pub name: String,
    pub offset_seconds: u64,
    pub duration_seconds: u64,
    /// Mark every newly submitted request on this list
    #[serde(default)]
    pub mark_on_submit: bool,
}

impl IgnoreListConfig {
    pub fn new(name: impl Into<String>, offset: Duration, duration: Duration) -> Self {
        Self {
            name: name.into(),
            offset_seconds: offset.as_secs(),
            duration_seconds: duration.as_secs(),
            mark_on_submit: false,
        }
    }

    pub fn proposed() -> Self {
        Self::new(PROPOSED_LIST, Duration::ZERO, Duration::from_secs(800))
    }

    pub fn deindexed() -> Self {
        Self::new(DEINDEXED_LIST, Duration::ZERO, Duration::from_secs(800))
    }

    pub fn expired() -> Self {
        Self {
            mark_on_submit: true,
            ..Self::new(EXPIRED_LIST, Duration::from_secs(800), Duration::ZERO)
        }
    }

    /// The stock lists: `proposed`, `deindexed` and `expired`
    pub fn defaults() -> Vec<Self> {
        vec![Self::proposed(), Self::deindexed(), Self::expired()]
    }

    pub fn offset(&self) -> Duration {
        Duration::from_secs(self.offset_seconds)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    /// Zero-duration lists hide permanently once the offset has passed
    pub fn is_hard_ttl(&self) -> bool {
        self.duration_seconds == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lists() {
        let lists = IgnoreListConfig::defaults();
        assert_eq!(lists.len(), 3);

        let expired = &lists[2];
        assert_eq!(expired.name, EXPIRED_LIST);
        assert!(expired.is_hard_ttl());
        assert!(expired.mark_on_submit);
        assert_eq!(expired.offset(), Duration::from_secs(800));

        assert!(!lists[0].is_hard_ttl());
        assert_eq!(lists[0].duration(), Duration::from_secs(800));
    }
}
