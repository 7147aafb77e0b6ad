use std::time::Duration;

use rand::Rng;

/// Strategy for spacing reconnection attempts with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Cap applied to later retries.
    pub max: Duration,
    /// Growth factor per attempt.
    pub factor: f64,
    /// Jitter ratio (0.0..=1.0) applied symmetrically to the delay.
    pub jitter: f64,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Backoff delay for the given attempt (1-based), jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.with_jitter(self.base_delay(attempt))
    }

    /// Un-jittered delay: `min(max, initial * factor^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let scaled = self.initial.as_millis() as f64 * self.factor.powi(exp as i32);
        let capped = scaled.min(self.max.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Whether the attempt counter has exhausted the policy.
    pub fn max_attempts_reached(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Scale a delay by a random factor in `[1 - jitter, 1 + jitter]`.
    fn with_jitter(&self, delay: Duration) -> Duration {
        let ratio = self.jitter.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - ratio..=1.0 + ratio);
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: Some(5),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = policy.delay_for(1).as_millis();
            assert!((50..=150).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn attempt_limit() {
        let policy = no_jitter();
        assert!(!policy.max_attempts_reached(4));
        assert!(policy.max_attempts_reached(5));
        assert!(policy.max_attempts_reached(6));

        let unbounded = BackoffPolicy {
            max_attempts: None,
            ..no_jitter()
        };
        assert!(!unbounded.max_attempts_reached(u32::MAX));
    }
}
