use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{IdempotencyError, Result};

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    /// False only for the caller that now owns the key and must execute.
    pub already_processed: bool,

    /// The recorded result, if execution under this key has finished.
    pub stored_result: Option<serde_json::Value>,
}

impl CheckOutcome {
    /// The caller claimed the key and must execute.
    pub fn proceed() -> Self {
        Self {
            already_processed: false,
            stored_result: None,
        }
    }

    /// Someone else claimed the key earlier.
    pub fn processed(stored_result: Option<serde_json::Value>) -> Self {
        Self {
            already_processed: true,
            stored_result,
        }
    }

    /// Claimed by another executor that has not recorded a result yet.
    pub fn is_in_flight(&self) -> bool {
        self.already_processed && self.stored_result.is_none()
    }
}

/// Retention settings for idempotency records.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a key is remembered after it was claimed or completed.
    pub ttl: Duration,

    /// How long an unfinished claim blocks other executors before it may be
    /// taken over.
    pub claim_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            claim_timeout: Duration::from_secs(60),
        }
    }
}

impl IdempotencyConfig {
    pub(crate) fn ttl_chrono(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.ttl)
            .map_err(|e| IdempotencyError::InvalidDuration(e.to_string()))
    }

    pub(crate) fn claim_timeout_chrono(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.claim_timeout)
            .map_err(|e| IdempotencyError::InvalidDuration(e.to_string()))
    }
}

/// Deduplicates side-effecting commands by key.
///
/// `check_and_reserve` is linearizable per key: among concurrent callers for
/// the same key exactly one gets `already_processed == false`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `key`, or reports that it was already claimed.
    async fn check_and_reserve(&self, key: &str) -> Result<CheckOutcome>;

    /// Stores the result of executing under `key`.
    async fn record_result(&self, key: &str, result: serde_json::Value) -> Result<()>;

    /// Drops an unfinished claim so the command can be retried.
    async fn release(&self, key: &str) -> Result<()>;

    /// Deletes records whose TTL has elapsed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<T: IdempotencyStore + ?Sized> IdempotencyStore for std::sync::Arc<T> {
    async fn check_and_reserve(&self, key: &str) -> Result<CheckOutcome> {
        (**self).check_and_reserve(key).await
    }

    async fn record_result(&self, key: &str, result: serde_json::Value) -> Result<()> {
        (**self).record_result(key, result).await
    }

    async fn release(&self, key: &str) -> Result<()> {
        (**self).release(key).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        (**self).purge_expired(now).await
    }
}
