use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{CheckOutcome, IdempotencyConfig, IdempotencyStore, Result};

#[derive(Debug, Clone)]
struct Entry {
    result: Option<serde_json::Value>,
    claimed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory idempotency store for tests and single-process deployments.
///
/// A single mutex guards the map, which makes claims linearizable.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    config: IdempotencyConfig,
}

impl InMemoryIdempotencyStore {
    /// Creates a new store with the default 24h TTL.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: IdempotencyConfig) -> Self {
        Self {
            entries: Arc::default(),
            config,
        }
    }

    /// Returns the number of live and expired entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_reserve(&self, key: &str) -> Result<CheckOutcome> {
        let now = Utc::now();
        let ttl = self.config.ttl_chrono()?;
        let claim_timeout = self.config.claim_timeout_chrono()?;
        let mut entries = self.entries.lock().await;

        let outcome = match entries.get(key) {
            Some(entry) if entry.expires_at > now => match &entry.result {
                Some(result) => CheckOutcome::processed(Some(result.clone())),
                None if now - entry.claimed_at < claim_timeout => CheckOutcome::processed(None),
                None => {
                    tracing::warn!(key, "taking over stale idempotency claim");
                    CheckOutcome::proceed()
                }
            },
            _ => CheckOutcome::proceed(),
        };

        if outcome.already_processed {
            metrics::counter!("idempotency_duplicates_total").increment(1);
        } else {
            entries.insert(
                key.to_string(),
                Entry {
                    result: None,
                    claimed_at: now,
                    expires_at: now + ttl,
                },
            );
        }
        Ok(outcome)
    }

    async fn record_result(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let ttl = self.config.ttl_chrono()?;
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            result: None,
            claimed_at: now,
            expires_at: now,
        });
        entry.result = Some(result);
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.result.is_none()) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}
