//! Saga state store: durable saga records plus their transactional outbox.

mod error;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, Version};
use messaging::EventEnvelope;

pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;

use crate::instance::OrderSaga;

/// An envelope waiting in the outbox to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    /// Insertion order; the relay publishes in this order.
    pub id: i64,
    pub saga_id: SagaId,
    pub envelope: EventEnvelope,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Durable storage for saga records.
///
/// Every write stores the saga and the envelopes it produced atomically, so
/// a crash can never lose a command that the saga believes it sent.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new saga. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, saga: &OrderSaga, outbox: Vec<EventEnvelope>) -> Result<()>;

    /// Loads a saga by id.
    async fn load(&self, saga_id: SagaId) -> Result<Option<OrderSaga>>;

    /// Replaces the stored saga if it is still at `expected_version`.
    ///
    /// `saga.version()` must be `expected_version + 1`. A stale expected
    /// version fails with `ConcurrencyConflict` and writes nothing.
    async fn compare_and_swap(
        &self,
        saga: &OrderSaga,
        expected_version: Version,
        outbox: Vec<EventEnvelope>,
    ) -> Result<()>;

    /// Non-terminal sagas whose `next_deadline` is at or before `now`,
    /// earliest first.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderSaga>>;

    /// Unpublished outbox messages whose next attempt is due, oldest first.
    async fn pending_outbox(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<OutboxMessage>>;

    async fn mark_published(&self, id: i64) -> Result<()>;

    /// Records a failed publish and schedules the next attempt.
    async fn record_publish_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
impl<T: SagaStore + ?Sized> SagaStore for std::sync::Arc<T> {
    async fn create(&self, saga: &OrderSaga, outbox: Vec<EventEnvelope>) -> Result<()> {
        (**self).create(saga, outbox).await
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<OrderSaga>> {
        (**self).load(saga_id).await
    }

    async fn compare_and_swap(
        &self,
        saga: &OrderSaga,
        expected_version: Version,
        outbox: Vec<EventEnvelope>,
    ) -> Result<()> {
        (**self).compare_and_swap(saga, expected_version, outbox).await
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderSaga>> {
        (**self).find_due(now, limit).await
    }

    async fn pending_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        (**self).pending_outbox(now, limit).await
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        (**self).mark_published(id).await
    }

    async fn record_publish_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        (**self).record_publish_failure(id, error, retry_at).await
    }
}

/// Rejects writes whose version is not exactly one past the expected one.
pub(crate) fn validate_next_version(saga: &OrderSaga, expected: Version) -> Result<()> {
    if saga.version() != expected.next() {
        return Err(StoreError::InvalidRecord(format!(
            "saga {} carries {}, expected {}",
            saga.saga_id(),
            saga.version(),
            expected.next()
        )));
    }
    Ok(())
}
