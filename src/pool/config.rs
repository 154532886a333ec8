use crate::transaction::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session pool configuration
///
/// Immutable once handed to [`SessionPool::new`](super::SessionPool::new).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Live sessions the maintainer keeps around at all times
    pub min_sessions: usize,

    /// Hard ceiling on concurrently live sessions
    pub max_sessions: usize,

    /// Sessions created per growth burst
    pub inc_step: usize,

    /// Initial share of ReadWritePrepared sessions; adapts to demand afterwards
    pub write_sessions_fraction: f64,

    /// Number of recent acquires the write fraction effectively averages over
    pub demand_window: usize,

    /// Let a writer take an idle read-only session and upgrade it
    pub allow_upgrade: bool,

    /// Ping sessions that saw no activity for this long
    pub keep_alive_interval: Duration,

    /// Destroy sessions above `min_sessions` unused for this long
    pub max_idle: Duration,

    /// Period of the background maintainer
    pub maintenance_interval: Duration,

    /// Longest a caller waits in `acquire` before `PoolExhausted`
    pub acquire_timeout: Duration,

    /// Deadline of a transaction when the caller gives none
    pub transaction_deadline: Duration,

    /// First delay after a failed growth burst
    pub create_backoff_base: Duration,

    /// Cap on the delay between failed growth bursts
    pub create_backoff_max: Duration,

    /// Backoff between aborted transaction attempts
    pub retry: RetryPolicy,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            min_sessions: 25,
            max_sessions: 100,
            inc_step: 25,
            write_sessions_fraction: 0.2,
            demand_window: 100,
            allow_upgrade: true,
            keep_alive_interval: Duration::from_secs(30 * 60),
            max_idle: Duration::from_secs(60 * 60),
            maintenance_interval: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            transaction_deadline: Duration::from_secs(60),
            create_backoff_base: Duration::from_secs(1),
            create_backoff_max: Duration::from_secs(32),
            retry: RetryPolicy::default(),
        }
    }

    /// Parse a configuration document; missing fields keep their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sessionpool::PoolConfig;
    /// let config = PoolConfig::from_json(r#"{ "min_sessions": 2, "max_sessions": 8 }"#).unwrap();
    /// assert_eq!(config.max_sessions, 8);
    /// assert_eq!(config.inc_step, 25);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid pool configuration: {}", e))
    }

    pub fn min_sessions(mut self, min: usize) -> Self {
        self.min_sessions = min;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn inc_step(mut self, step: usize) -> Self {
        self.inc_step = step;
        self
    }

    pub fn write_sessions_fraction(mut self, fraction: f64) -> Self {
        self.write_sessions_fraction = fraction;
        self
    }

    pub fn demand_window(mut self, window: usize) -> Self {
        self.demand_window = window;
        self
    }

    pub fn allow_upgrade(mut self, allow: bool) -> Self {
        self.allow_upgrade = allow;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn transaction_deadline(mut self, deadline: Duration) -> Self {
        self.transaction_deadline = deadline;
        self
    }

    pub fn create_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.create_backoff_base = base;
        self.create_backoff_max = max;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Delay before the next growth attempt after `failures` consecutive failures
    pub(crate) fn create_backoff_after(&self, failures: u32) -> Duration {
        let base = self.create_backoff_base;
        let cap = self.create_backoff_max.max(base);

        let mut backoff = base;
        for _ in 1..failures {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be > 0".to_string());
        }

        if self.min_sessions > self.max_sessions {
            return Err("min_sessions cannot exceed max_sessions".to_string());
        }

        if self.inc_step == 0 {
            return Err("inc_step must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.write_sessions_fraction) {
            return Err("write_sessions_fraction must be within [0, 1]".to_string());
        }

        if self.demand_window == 0 {
            return Err("demand_window must be > 0".to_string());
        }

        if self.maintenance_interval.is_zero() {
            return Err("maintenance_interval must be > 0".to_string());
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be > 0".to_string());
        }

        if self.transaction_deadline.is_zero() {
            return Err("transaction_deadline must be > 0".to_string());
        }

        self.retry.validate()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_sessions, 25);
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.inc_step, 25);
        assert!(config.allow_upgrade);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = PoolConfig::new()
            .min_sessions(0)
            .max_sessions(4)
            .inc_step(2)
            .allow_upgrade(false)
            .acquire_timeout(Duration::from_millis(250));

        assert_eq!(config.min_sessions, 0);
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.inc_step, 2);
        assert!(!config.allow_upgrade);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate() {
        assert!(PoolConfig::new().max_sessions(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .min_sessions(10)
                .max_sessions(5)
                .validate()
                .is_err()
        );
        assert!(PoolConfig::new().inc_step(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .write_sessions_fraction(1.5)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_create_backoff_doubles_until_cap() {
        let config = PoolConfig::new()
            .create_backoff(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(config.create_backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.create_backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.create_backoff_after(3), Duration::from_millis(350));
        assert_eq!(config.create_backoff_after(10), Duration::from_millis(350));
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = PoolConfig::from_json(
            r#"{ "min_sessions": 1, "max_sessions": 3, "allow_upgrade": false }"#,
        )
        .unwrap();

        assert_eq!(config.min_sessions, 1);
        assert_eq!(config.max_sessions, 3);
        assert!(!config.allow_upgrade);
        assert_eq!(config.demand_window, 100);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(PoolConfig::from_json("min_sessions = 1").is_err());
    }
}
