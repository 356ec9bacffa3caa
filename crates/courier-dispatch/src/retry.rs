//! Delivery retry policy.
//!
//! Maps the number of failed attempts recorded on a ledger row to either the
//! wait before the next attempt or a decision to expire the row.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide retry policy for merchant callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Waits between attempts; the last entry repeats.
    pub retry_intervals: Vec<Duration>,
    /// Timeout for a single outbound request.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(8),
            ],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry {
        /// Wait before the next attempt
        delay: Duration,
    },
    /// Expire the row.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Wait after the `retry_count`-th failure (1-based).
    ///
    /// Uses `retry_intervals[min(retry_count - 1, len - 1)]`; an empty
    /// sequence yields zero.
    pub fn interval_for(&self, retry_count: u32) -> Duration {
        let index = retry_count.saturating_sub(1) as usize;
        self.retry_intervals
            .get(index)
            .or_else(|| self.retry_intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decides the follow-up to a failed attempt on a row that had already
    /// used `retries_used` retries before it.
    pub fn decide(&self, retries_used: u32) -> RetryDecision {
        if retries_used >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum retries ({}) reached", self.max_retries),
            };
        }
        RetryDecision::Retry { delay: self.interval_for(retries_used + 1) }
    }

    /// Sum of the waits a row goes through before expiring.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|n| self.interval_for(n)).sum()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_intervals() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval_for(1), Duration::from_secs(1));
        assert_eq!(policy.interval_for(2), Duration::from_secs(5));
        assert_eq!(policy.interval_for(3), Duration::from_secs(8));
    }

    #[test]
    fn last_interval_repeats() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval_for(4), Duration::from_secs(8));
        assert_eq!(policy.interval_for(100), Duration::from_secs(8));
    }

    #[test]
    fn zero_count_uses_first_interval() {
        assert_eq!(RetryPolicy::default().interval_for(0), Duration::from_secs(1));
    }

    #[test]
    fn empty_intervals_retry_immediately() {
        let policy = RetryPolicy { retry_intervals: vec![], ..RetryPolicy::default() };
        assert_eq!(policy.interval_for(2), Duration::ZERO);
    }

    #[test]
    fn decide_gives_up_at_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0), RetryDecision::Retry { delay: Duration::from_secs(1) });
        assert_eq!(policy.decide(1), RetryDecision::Retry { delay: Duration::from_secs(5) });
        assert_eq!(policy.decide(2), RetryDecision::Retry { delay: Duration::from_secs(8) });
        assert!(matches!(policy.decide(3), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn default_total_backoff() {
        assert_eq!(RetryPolicy::default().total_backoff(), Duration::from_secs(14));
    }

    proptest! {
        #[test]
        fn decide_retries_exactly_budget_times(max_retries in 0u32..10) {
            let policy = RetryPolicy { max_retries, ..RetryPolicy::default() };
            let retries = (0..=max_retries + 2)
                .take_while(|used| matches!(policy.decide(*used), RetryDecision::Retry { .. }))
                .count();
            prop_assert_eq!(retries, max_retries as usize);
        }

        #[test]
        fn interval_always_from_sequence(
            intervals in prop::collection::vec(1u64..10_000, 1..8),
            retry_count in 0u32..64,
        ) {
            let policy = RetryPolicy {
                retry_intervals: intervals.iter().copied().map(Duration::from_millis).collect(),
                ..RetryPolicy::default()
            };
            let chosen = policy.interval_for(retry_count);
            prop_assert!(policy.retry_intervals.contains(&chosen));
            if retry_count as usize >= intervals.len() {
                prop_assert_eq!(Some(&chosen), policy.retry_intervals.last());
            }
        }
    }
}
