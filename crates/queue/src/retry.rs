//! Exponential backoff between task attempts.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the retry backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts, before jitter.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Maximum extra delay as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

impl RetryPolicy {
    /// Deterministic delay after the failed attempt number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt.max(1) {
            if delay >= self.max_delay {
                break;
            }
            delay = next_delay(delay, self);
        }
        delay
    }

    /// [`base_delay`](Self::base_delay) plus up to `jitter` of random extra.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=jitter);
        base + base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(next_delay(Duration::from_secs(5), &policy), Duration::from_secs(10));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            next_delay(Duration::from_secs(200), &policy),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = no_jitter();
        let expected = [5, 10, 20, 40, 80, 160, 300, 300];

        for (i, &expected_secs) in expected.iter().enumerate() {
            let attempt = i as u32 + 1;
            assert_eq!(policy.base_delay(attempt).as_secs(), expected_secs, "attempt {attempt}");
        }
    }

    #[test]
    fn zero_attempt_uses_initial_delay() {
        assert_eq!(no_jitter().base_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay_for(attempt);
                assert!(d >= base);
                assert!(d <= base.mul_f64(1.2) + Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    }
}
