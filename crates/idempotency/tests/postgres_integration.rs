//! PostgreSQL integration tests for the idempotency store.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p idempotency --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use idempotency::{IdempotencyConfig, IdempotencyStore, PostgresIdempotencyStore};
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
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_idempotency_keys.sql"
            ))
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

async fn get_test_store(config: IdempotencyConfig) -> PostgresIdempotencyStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE idempotency_keys")
        .execute(&pool)
        .await
        .unwrap();

    PostgresIdempotencyStore::new(pool, config)
}

#[tokio::test]
#[serial]
async fn duplicate_check_returns_recorded_result() {
    let store = get_test_store(IdempotencyConfig::default()).await;
    let result = serde_json::json!({"event_type": "payment.succeeded", "payment_id": "PAY-1"});

    assert!(!store.check_and_reserve("k1").await.unwrap().already_processed);
    store.record_result("k1", result.clone()).await.unwrap();

    let second = store.check_and_reserve("k1").await.unwrap();
    assert!(second.already_processed);
    assert_eq!(second.stored_result, Some(result));
}

#[tokio::test]
#[serial]
async fn in_flight_claim_blocks_until_timeout() {
    let store = get_test_store(IdempotencyConfig {
        ttl: Duration::from_secs(3600),
        claim_timeout: Duration::from_secs(3600),
    })
    .await;

    store.check_and_reserve("k2").await.unwrap();
    assert!(store.check_and_reserve("k2").await.unwrap().is_in_flight());

    let takeover = get_test_store(IdempotencyConfig {
        ttl: Duration::from_secs(3600),
        claim_timeout: Duration::ZERO,
    })
    .await;
    takeover.check_and_reserve("k3").await.unwrap();
    assert!(!takeover.check_and_reserve("k3").await.unwrap().already_processed);
}

#[tokio::test]
#[serial]
async fn concurrent_claims_admit_exactly_one() {
    let store = get_test_store(IdempotencyConfig::default()).await;

    let claims = futures_util::future::join_all(
        (0..10).map(|_| {
            let store = store.clone();
            async move { store.check_and_reserve("race").await.unwrap() }
        }),
    )
    .await;

    let winners = claims.iter().filter(|c| !c.already_processed).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
#[serial]
async fn release_and_purge() {
    let store = get_test_store(IdempotencyConfig::default()).await;

    store.check_and_reserve("open").await.unwrap();
    store.release("open").await.unwrap();
    assert!(!store.check_and_reserve("open").await.unwrap().already_processed);

    store
        .record_result("done", serde_json::json!(true))
        .await
        .unwrap();

    let removed = store
        .purge_expired(Utc::now() + chrono::Duration::days(2))
        .await
        .unwrap();
    assert_eq!(removed, 2);
}
