//! Consecutive read-failure accounting for the frame source.

use std::time::{Duration, Instant};

use crate::capture::RelayConfig;

/// When to back off and when to reinitialize the device.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Consecutive failures before a reinit is considered.
    pub failure_threshold: u32,
    /// Minimum time between two reinit attempts.
    pub reconnect_interval: Duration,
    /// Backoff added per consecutive failure.
    pub backoff_step: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for ReconnectPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reconnect_interval: config.reconnect_interval(),
            backoff_step: config.backoff_step(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// What the frame source should do after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Consecutive failures including this one.
    pub failures: u32,
    /// How long to sleep before the next cycle.
    pub backoff: Duration,
    /// Whether to release and reopen the device now.
    pub reinit: bool,
}

/// Counts consecutive failures and gates reinit attempts.
///
/// The reconnect interval is measured from the last reinit attempt, whether
/// it succeeded or not; only a successful reopen clears the failure count.
///
/// A failed reinit stamps the timer too. This deliberately departs from
/// resetting it on success only, which would retry the reopen on every
/// failed read once the first attempt failed.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    policy: ReconnectPolicy,
    consecutive: u32,
    last_attempt: Instant,
}

impl FailureTracker {
    /// Starts tracking; `opened_at` counts as the last (re)connection.
    pub fn new(policy: ReconnectPolicy, opened_at: Instant) -> Self {
        Self {
            policy,
            consecutive: 0,
            last_attempt: opened_at,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Records a failed read at `now`.
    pub fn record_failure(&mut self, now: Instant) -> FailureVerdict {
        self.consecutive = self.consecutive.saturating_add(1);

        let reinit = self.consecutive >= self.policy.failure_threshold
            && now.saturating_duration_since(self.last_attempt) >= self.policy.reconnect_interval;
        if reinit {
            self.last_attempt = now;
        }

        FailureVerdict {
            failures: self.consecutive,
            backoff: self.backoff(),
            reinit,
        }
    }

    /// Records a good read.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Records a successful reopen (failure-driven or refresh).
    pub fn reopened(&mut self, now: Instant) {
        self.consecutive = 0;
        self.last_attempt = now;
    }

    fn backoff(&self) -> Duration {
        self.policy
            .backoff_step
            .saturating_mul(self.consecutive)
            .min(self.policy.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            failure_threshold: 5,
            reconnect_interval: Duration::from_secs(10),
            backoff_step: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_reinit_after_threshold_and_interval() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(policy(), start);
        let later = start + Duration::from_secs(11);

        for n in 1..5 {
            let verdict = tracker.record_failure(later);
            assert_eq!(verdict.failures, n);
            assert!(!verdict.reinit);
        }
        assert!(tracker.record_failure(later).reinit);
    }

    #[test]
    fn test_no_reinit_inside_interval() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(policy(), start);

        for _ in 0..20 {
            assert!(!tracker.record_failure(start + Duration::from_secs(3)).reinit);
        }
        assert_eq!(tracker.consecutive_failures(), 20);
    }

    #[test]
    fn test_exactly_one_attempt_per_interval() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(policy(), start);
        let t = start + Duration::from_secs(10);

        let attempts = (0..30)
            .map(|i| tracker.record_failure(t + Duration::from_millis(100 * i)))
            .filter(|v| v.reinit)
            .count();
        assert_eq!(attempts, 1);

        // Failed reinit: count keeps climbing, next attempt one interval later
        assert!(tracker.record_failure(t + Duration::from_secs(20)).reinit);
    }

    #[test]
    fn test_success_resets_count() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(policy(), start);
        tracker.record_failure(start);
        tracker.record_failure(start);
        tracker.record_success();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(
            tracker.record_failure(start).backoff,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_reopen_restarts_interval() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new(policy(), start);
        let reopened_at = start + Duration::from_secs(30);
        tracker.reopened(reopened_at);

        for _ in 0..10 {
            assert!(!tracker.record_failure(reopened_at + Duration::from_secs(5)).reinit);
        }
    }

    proptest! {
        #[test]
        fn backoff_grows_then_caps(failures in 1u32..500) {
            let start = Instant::now();
            let mut tracker = FailureTracker::new(policy(), start);
            let mut last = Duration::ZERO;
            for _ in 0..failures {
                let verdict = tracker.record_failure(start);
                prop_assert!(verdict.backoff >= last);
                prop_assert!(verdict.backoff <= Duration::from_secs(2));
                last = verdict.backoff;
            }
            let expected = Duration::from_millis(100 * u64::from(failures)).min(Duration::from_secs(2));
            prop_assert_eq!(last, expected);
        }
    }
}
