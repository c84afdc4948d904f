//! Saga tuning knobs.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Timing and retry settings for the order purchase saga.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Retry budget for forward step commands (reserve, charge).
    pub step_retry: RetryConfig,

    /// Backoff for compensations. Attempts are unbounded.
    pub compensation_retry: RetryConfig,

    /// How long the saga waits in `ReservationPending` before giving up.
    pub reservation_deadline: Duration,

    /// How long the saga waits in `PaymentPending` before giving up.
    pub payment_deadline: Duration,

    /// Compensations running longer than this are escalated for manual review.
    pub compensation_ceiling: Duration,

    /// How many times a transition is re-evaluated after losing a
    /// compare-and-swap race.
    pub conflict_retries: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryConfig::default(),
            compensation_retry: RetryConfig::unbounded(
                Duration::from_secs(5),
                Duration::from_secs(300),
            ),
            reservation_deadline: Duration::from_secs(120),
            payment_deadline: Duration::from_secs(300),
            compensation_ceiling: Duration::from_secs(30 * 60),
            conflict_retries: 3,
        }
    }
}

impl SagaConfig {
    pub(crate) fn reservation_deadline(&self) -> chrono::Duration {
        to_chrono(self.reservation_deadline)
    }

    pub(crate) fn payment_deadline(&self) -> chrono::Duration {
        to_chrono(self.payment_deadline)
    }

    pub(crate) fn compensation_ceiling(&self) -> chrono::Duration {
        to_chrono(self.compensation_ceiling)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
