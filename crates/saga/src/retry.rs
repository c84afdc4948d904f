//! Retry configuration with exponential backoff.

use std::time::Duration;

/// Configuration for retrying a step command, a capability call or a publish.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retries forever; used for compensations, which are never abandoned.
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after attempt number `attempt` (1-based):
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Same as [`delay_for`](Self::delay_for), as a timestamp offset.
    pub fn chrono_delay_for(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    /// Returns true once `attempts` attempts have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(500));
        assert_eq!(config.delay_for(1000), Duration::from_millis(500));
    }

    #[test]
    fn exhaustion_counts_attempts() {
        let config = RetryConfig::default();
        assert!(!config.is_exhausted(4));
        assert!(config.is_exhausted(5));
        assert!(!RetryConfig::unbounded(Duration::ZERO, Duration::ZERO).is_exhausted(1_000_000));
    }
}
