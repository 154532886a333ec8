use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff between attempts of an aborted transaction.
///
/// There is no attempt limit: the transaction deadline bounds the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_backoff_ms: u64,
    /// Cap on the doubled delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Random spread applied to every delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 10,
            max_backoff_ms: 1000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Fixed delays, handy for deterministic tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.base_backoff_ms = base;
        self.max_backoff_ms = max;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_backoff_ms == 0 {
            return Err("retry.base_backoff_ms must be > 0".to_string());
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err("retry.max_backoff_ms cannot be below retry.base_backoff_ms".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within [0, 1)".to_string());
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Delay schedule of one `run` call
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    step: Duration,
    rng: fastrand::Rng,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            step: Duration::from_millis(policy.base_backoff_ms),
            policy,
            rng: fastrand::Rng::new(),
        }
    }

    /// Undelayed step the next call is based on
    pub fn current_step(&self) -> Duration {
        self.step
    }

    /// Delay before the next attempt.
    ///
    /// Never shorter than the service's `hint`.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let step = self.step;
        let cap = Duration::from_millis(self.policy.max_backoff_ms);
        self.step = self.step.saturating_mul(2).min(cap);

        let spread = self.policy.jitter * (2.0 * self.rng.f64() - 1.0);
        let delay = step.mul_f64((1.0 + spread).max(0.0));

        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_backoff_ms, 10);
        assert_eq!(policy.max_backoff_ms, 1000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().backoff_ms(0, 10).validate().is_err());
        assert!(RetryPolicy::default().backoff_ms(50, 10).validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.jitter = 1.5;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = RetryPolicy::default()
            .backoff_ms(10, 50)
            .without_jitter()
            .backoff();

        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay(None).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = RetryPolicy::default().backoff_ms(100, 100).backoff();
        for _ in 0..100 {
            let delay = backoff.next_delay(None);
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_hint_is_a_floor() {
        let mut backoff = RetryPolicy::default().without_jitter().backoff();
        assert_eq!(
            backoff.next_delay(Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        // Hint shorter than the schedule does not shorten it
        assert_eq!(
            backoff.next_delay(Some(Duration::from_millis(1))),
            Duration::from_millis(20)
        );
    }
}
