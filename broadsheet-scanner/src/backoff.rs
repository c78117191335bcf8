use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff: `min(base * 2^(n-1), ceiling)` for the n-th
/// consecutive failure. No jitter, so the sequence is non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Policy for rate limits and transient errors.
    pub const fn short() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(15 * 60))
    }

    /// Policy for confirmed bot challenges, an order of magnitude longer.
    pub const fn challenge() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(3 * 60 * 60))
    }

    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    /// Like [`delay`](Self::delay) but never shorter than a server-supplied hint,
    /// still bounded by the ceiling.
    pub fn delay_with_hint(&self, consecutive_failures: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay(consecutive_failures);
        match hint {
            Some(hint) => computed.max(hint.min(self.ceiling)),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_failures_no_delay() {
        assert_eq!(BackoffPolicy::short().delay(0), Duration::ZERO);
    }

    #[test]
    fn test_doubles_until_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert_eq!(policy.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_challenge_sequence_non_decreasing_and_bounded() {
        let policy = BackoffPolicy::challenge();
        let mut previous = Duration::ZERO;
        for n in 1..=64 {
            let delay = policy.delay(n);
            assert!(delay >= previous, "delay decreased at n={}", n);
            assert!(delay <= policy.ceiling);
            previous = delay;
        }
        assert_eq!(previous, policy.ceiling);
    }

    #[test]
    fn test_challenge_policy_is_longer() {
        assert!(BackoffPolicy::challenge().delay(1) >= BackoffPolicy::short().delay(1) * 10);
    }

    #[test]
    fn test_retry_after_hint_respected_but_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(100));
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(50))),
            Duration::from_secs(50)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(5000))),
            Duration::from_secs(100)
        );
        assert_eq!(policy.delay_with_hint(2, None), Duration::from_secs(10));
    }
}
