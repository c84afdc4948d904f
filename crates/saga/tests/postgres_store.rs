//! PostgreSQL integration tests for the saga store.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_store -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{BuyerId, Currency, ListingId, Money, SagaId};
use saga::{
    OrderPayload, Orchestrator, PostgresSagaStore, SagaConfig, SagaCoordinator, SagaState,
    SagaStore, StepName, StepStatus, StoreError, Transition,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool and empty tables for every test.
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_outbox, order_sagas")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn payload() -> OrderPayload {
    OrderPayload::new(
        BuyerId::new("buyer-1"),
        ListingId::new("listing-1"),
        3,
        Money::from_cents(999),
        Currency::parse("GBP").unwrap(),
    )
}

fn started() -> Transition {
    Orchestrator::default()
        .start(SagaId::new(), payload(), Utc::now())
        .unwrap()
}

#[tokio::test]
#[serial]
async fn test_create_and_load_round_trips_document() {
    let store = get_test_store().await;
    let t = started();

    store.create(&t.saga, t.outbox.clone()).await.unwrap();

    let loaded = store.load(t.saga.saga_id()).await.unwrap().unwrap();
    assert_eq!(loaded, t.saga);
    assert!(store.load(SagaId::new()).await.unwrap().is_none());

    let again = store.create(&t.saga, vec![]).await;
    assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
}

#[tokio::test]
#[serial]
async fn test_compare_and_swap_detects_stale_version() {
    let store = get_test_store().await;
    let t = started();
    store.create(&t.saga, vec![]).await.unwrap();

    let (_, cancelled) = Orchestrator::default()
        .cancel(&t.saga, Utc::now())
        .unwrap();
    let next = cancelled.unwrap();
    store
        .compare_and_swap(&next.saga, t.saga.version(), next.outbox.clone())
        .await
        .unwrap();

    let stale = store
        .compare_and_swap(&next.saga, t.saga.version(), vec![])
        .await;
    assert!(matches!(
        stale,
        Err(StoreError::InvalidRecord(_)) | Err(StoreError::ConcurrencyConflict { .. })
    ));

    let loaded = store.load(t.saga.saga_id()).await.unwrap().unwrap();
    assert_eq!(loaded.version(), next.saga.version());
    assert!(loaded.cancel_requested());
}

#[tokio::test]
#[serial]
async fn test_concurrent_swaps_admit_exactly_one() {
    let store = get_test_store().await;
    let t = started();
    store.create(&t.saga, vec![]).await.unwrap();
    let (_, cancelled) = Orchestrator::default()
        .cancel(&t.saga, Utc::now())
        .unwrap();
    let next = cancelled.unwrap().saga;

    let expected = t.saga.version();
    let results = futures_util::future::join_all(
        (0..6).map(|_| store.compare_and_swap(&next, expected, vec![])),
    )
    .await;

    let mut ok = 0;
    for result in results {
        match result {
            Ok(()) => ok += 1,
            Err(StoreError::ConcurrencyConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
#[serial]
async fn test_outbox_is_drained_in_order_and_rescheduled() {
    let store = get_test_store().await;
    let t = started();
    store.create(&t.saga, t.outbox.clone()).await.unwrap();
    let now = Utc::now();

    let pending = store.pending_outbox(now, 10).await.unwrap();
    assert_eq!(pending.len(), t.outbox.len());
    assert_eq!(pending[0].envelope.event_id, t.outbox[0].event_id);
    assert!(pending.windows(2).all(|w| w[0].id < w[1].id));

    store.mark_published(pending[0].id).await.unwrap();
    let later = now + Duration::seconds(30);
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
#[serial]
async fn test_find_due_returns_overdue_sagas_only() {
    let store = get_test_store().await;
    let pending = started();
    store.create(&pending.saga, vec![]).await.unwrap();
    let deadline = pending.saga.next_deadline().unwrap();

    assert!(
        store
            .find_due(deadline - Duration::seconds(1), 10)
            .await
            .unwrap()
            .is_empty()
    );
    let due = store.find_due(deadline, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].saga_id(), pending.saga.saga_id());
}

#[tokio::test]
#[serial]
async fn test_coordinator_runs_on_postgres() {
    let store = get_test_store().await;
    let coordinator = SagaCoordinator::new(store.clone(), SagaConfig::default());

    let saga = coordinator.start_saga(payload()).await.unwrap();
    assert_eq!(saga.state(), SagaState::ReservationPending);

    coordinator.cancel(saga.saga_id()).await.unwrap();
    let report = coordinator
        .sweep(Utc::now() + Duration::seconds(121), 10)
        .await
        .unwrap();
    assert_eq!(report.expired, 1);

    // The unanswered reserve may still land, so its hold is released.
    let saga = coordinator.get_saga(saga.saga_id()).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Compensating);
    assert_eq!(saga.failure().unwrap().reason_code, "cancelled");
    assert_eq!(
        saga.step(StepName::ReleaseInventory).unwrap().status,
        StepStatus::Pending
    );
    assert!(store.find_due(Utc::now(), 10).await.unwrap().is_empty());
}
