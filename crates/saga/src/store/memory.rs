use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, Version};
use messaging::EventEnvelope;
use tokio::sync::RwLock;

use super::{OutboxMessage, Result, SagaStore, StoreError, validate_next_version};
use crate::instance::OrderSaga;

#[derive(Default)]
struct Inner {
    sagas: HashMap<SagaId, OrderSaga>,
    outbox: Vec<(OutboxMessage, bool)>,
    next_outbox_id: i64,
}

impl Inner {
    fn enqueue(&mut self, saga_id: SagaId, envelopes: Vec<EventEnvelope>, now: DateTime<Utc>) {
        for envelope in envelopes {
            self.next_outbox_id += 1;
            let message = OutboxMessage {
                id: self.next_outbox_id,
                saga_id,
                envelope,
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
            };
            self.outbox.push((message, false));
        }
    }

    fn outbox_entry(&mut self, id: i64) -> Option<&mut (OutboxMessage, bool)> {
        self.outbox.iter_mut().find(|(m, _)| m.id == id)
    }
}

/// In-memory saga store for tests and single-process runs.
///
/// One lock guards sagas and outbox together, which gives writes the same
/// all-or-nothing behaviour as the PostgreSQL transaction.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sagas.
    pub async fn saga_count(&self) -> usize {
        self.inner.read().await.sagas.len()
    }

    /// Returns every envelope ever written to the outbox, published or not.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Returns the number of messages still waiting to be published.
    pub async fn unpublished_count(&self) -> usize {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .filter(|(_, published)| !published)
            .count()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: &OrderSaga, outbox: Vec<EventEnvelope>) -> Result<()> {
        validate_next_version(saga, Version::initial())?;
        let mut inner = self.inner.write().await;
        if inner.sagas.contains_key(&saga.saga_id()) {
            return Err(StoreError::AlreadyExists(saga.saga_id()));
        }
        inner.sagas.insert(saga.saga_id(), saga.clone());
        inner.enqueue(saga.saga_id(), outbox, Utc::now());
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<OrderSaga>> {
        Ok(self.inner.read().await.sagas.get(&saga_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        saga: &OrderSaga,
        expected_version: Version,
        outbox: Vec<EventEnvelope>,
    ) -> Result<()> {
        validate_next_version(saga, expected_version)?;
        let saga_id = saga.saga_id();
        let mut inner = self.inner.write().await;

        let current = inner
            .sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::NotFound(saga_id))?;
        if current.version() != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected: expected_version,
                actual: current.version(),
            });
        }
        *current = saga.clone();
        inner.enqueue(saga_id, outbox, Utc::now());
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderSaga>> {
        let inner = self.inner.read().await;
        let mut due: Vec<OrderSaga> = inner
            .sagas
            .values()
            .filter(|s| !s.state().is_terminal())
            .filter(|s| s.next_deadline().is_some_and(|d| d <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_deadline());
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|(m, published)| !published && m.next_attempt_at <= now)
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.outbox_entry(id) {
            entry.1 = true;
        }
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some((message, _)) = inner.outbox_entry(id) {
            message.attempts += 1;
            message.last_error = Some(error.to_string());
            message.next_attempt_at = retry_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::{BuyerId, Currency, ListingId, Money};

    use super::*;
    use crate::orchestrator::Orchestrator;

    fn started() -> crate::orchestrator::Transition {
        let payload = crate::instance::OrderPayload::new(
            BuyerId::new("buyer-1"),
            ListingId::new("listing-1"),
            1,
            Money::from_cents(500),
            Currency::parse("EUR").unwrap(),
        );
        Orchestrator::default()
            .start(SagaId::new(), payload, Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_load() {
        let store = InMemorySagaStore::new();
        let t = started();

        store.create(&t.saga, t.outbox.clone()).await.unwrap();

        let loaded = store.load(t.saga.saga_id()).await.unwrap().unwrap();
        assert_eq!(loaded, t.saga);
        assert_eq!(store.unpublished_count().await, 2);

        let again = store.create(&t.saga, vec![]).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn stale_compare_and_swap_is_rejected() {
        let store = InMemorySagaStore::new();
        let t = started();
        store.create(&t.saga, vec![]).await.unwrap();

        let (_, cancel) = Orchestrator::default().cancel(&t.saga, Utc::now()).unwrap();
        let next = cancel.unwrap();
        store
            .compare_and_swap(&next.saga, t.saga.version(), vec![])
            .await
            .unwrap();

        let stale = store
            .compare_and_swap(&next.saga, t.saga.version(), vec![])
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::InvalidRecord(_)) | Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_swaps_admit_exactly_one() {
        let store = InMemorySagaStore::new();
        let t = started();
        store.create(&t.saga, vec![]).await.unwrap();
        let (_, cancel) = Orchestrator::default().cancel(&t.saga, Utc::now()).unwrap();
        let next = cancel.unwrap().saga;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let next = next.clone();
                let expected = t.saga.version();
                tokio::spawn(async move { store.compare_and_swap(&next, expected, vec![]).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(StoreError::ConcurrencyConflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn outbox_failures_are_rescheduled() {
        let store = InMemorySagaStore::new();
        let t = started();
        store.create(&t.saga, t.outbox.clone()).await.unwrap();
        let now = Utc::now();

        let pending = store.pending_outbox(now, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);

        store.mark_published(pending[0].id).await.unwrap();
        let later = now + chrono::Duration::seconds(30);
        store
            .record_publish_failure(pending[1].id, "bus down", later)
            .await
            .unwrap();

        assert!(store.pending_outbox(now, 10).await.unwrap().is_empty());
        let retry = store.pending_outbox(later, 10).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempts, 1);
        assert_eq!(retry[0].last_error.as_deref(), Some("bus down"));
    }

    #[tokio::test]
    async fn find_due_returns_overdue_sagas_only() {
        let store = InMemorySagaStore::new();
        let t = started();
        store.create(&t.saga, vec![]).await.unwrap();
        let deadline = t.saga.next_deadline().unwrap();

        assert!(
            store
                .find_due(deadline - chrono::Duration::seconds(1), 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.find_due(deadline, 10).await.unwrap().len(), 1);
    }
}
