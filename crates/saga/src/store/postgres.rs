use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, Version};
use messaging::EventEnvelope;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use super::{OutboxMessage, Result, SagaStore, StoreError, validate_next_version};
use crate::instance::OrderSaga;

/// PostgreSQL-backed saga store.
///
/// The saga row and its outbox rows are written in one transaction.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert_outbox(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: SagaId,
        outbox: Vec<EventEnvelope>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for envelope in outbox {
            let document = serde_json::to_value(&envelope)?;
            sqlx::query(
                r#"
                INSERT INTO saga_outbox (saga_id, event_id, event_type, envelope, next_attempt_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(saga_id.as_uuid())
            .bind(envelope.event_id.as_uuid())
            .bind(&envelope.event_type)
            .bind(document)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn row_to_saga(row: &PgRow) -> Result<OrderSaga> {
        let document: serde_json::Value = row.try_get("document")?;
        Ok(serde_json::from_value(document)?)
    }

    fn row_to_outbox(row: &PgRow) -> Result<OutboxMessage> {
        let envelope: serde_json::Value = row.try_get("envelope")?;
        let attempts: i32 = row.try_get("attempts")?;
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            envelope: serde_json::from_value(envelope)?,
            attempts: u32::try_from(attempts).unwrap_or_default(),
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(&self, saga: &OrderSaga, outbox: Vec<EventEnvelope>) -> Result<()> {
        validate_next_version(saga, Version::initial())?;
        let document = serde_json::to_value(saga)?;
        let saga_id = saga.saga_id();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO order_sagas (saga_id, order_id, state, version, document, next_deadline, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(saga.order_id().as_uuid())
        .bind(saga.state().as_str())
        .bind(saga.version().as_i64())
        .bind(document)
        .bind(saga.next_deadline())
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::AlreadyExists(saga_id);
            }
            StoreError::Database(e)
        })?;

        Self::insert_outbox(&mut tx, saga_id, outbox, Utc::now()).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<OrderSaga>> {
        let row = sqlx::query("SELECT document FROM order_sagas WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_saga).transpose()
    }

    async fn compare_and_swap(
        &self,
        saga: &OrderSaga,
        expected_version: Version,
        outbox: Vec<EventEnvelope>,
    ) -> Result<()> {
        validate_next_version(saga, expected_version)?;
        let document = serde_json::to_value(saga)?;
        let saga_id = saga.saga_id();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE order_sagas
            SET state = $2, version = $3, document = $4, next_deadline = $5, updated_at = $6
            WHERE saga_id = $1 AND version = $7
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(saga.state().as_str())
        .bind(saga.version().as_i64())
        .bind(document)
        .bind(saga.next_deadline())
        .bind(saga.updated_at())
        .bind(expected_version.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM order_sagas WHERE saga_id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::ConcurrencyConflict {
                    saga_id,
                    expected: expected_version,
                    actual: Version::new(actual),
                },
                None => StoreError::NotFound(saga_id),
            });
        }

        Self::insert_outbox(&mut tx, saga_id, outbox, Utc::now()).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderSaga>> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM order_sagas
            WHERE next_deadline IS NOT NULL
              AND next_deadline <= $1
              AND state NOT IN ('Completed', 'Failed')
            ORDER BY next_deadline ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn pending_outbox(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, envelope, attempts, next_attempt_at, last_error
            FROM saga_outbox
            WHERE published_at IS NULL AND next_attempt_at <= $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE saga_outbox SET published_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga_outbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
