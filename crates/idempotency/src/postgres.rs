use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{CheckOutcome, IdempotencyConfig, IdempotencyStore, Result};

/// PostgreSQL-backed idempotency store.
///
/// Claims are a single `INSERT … ON CONFLICT DO UPDATE … WHERE` statement, so
/// the row lock taken by the insert decides which concurrent caller wins.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    config: IdempotencyConfig,
}

impl PostgresIdempotencyStore {
    /// Creates a new PostgreSQL idempotency store.
    pub fn new(pool: PgPool, config: IdempotencyConfig) -> Self {
        Self { pool, config }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check_and_reserve(&self, key: &str) -> Result<CheckOutcome> {
        let ttl = self.config.ttl_chrono()?;
        let claim_timeout = self.config.claim_timeout_chrono()?;

        // The row can vanish between the failed claim and the read (purge);
        // a second pass then claims it.
        for _ in 0..2 {
            let now = Utc::now();
            let claimed: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO idempotency_keys (key, result, claimed_at, expires_at)
                VALUES ($1, NULL, $2, $3)
                ON CONFLICT (key) DO UPDATE
                    SET result = NULL,
                        claimed_at = EXCLUDED.claimed_at,
                        expires_at = EXCLUDED.expires_at
                    WHERE idempotency_keys.expires_at <= EXCLUDED.claimed_at
                       OR (idempotency_keys.result IS NULL AND idempotency_keys.claimed_at <= $4)
                RETURNING key
                "#,
            )
            .bind(key)
            .bind(now)
            .bind(now + ttl)
            .bind(now - claim_timeout)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_some() {
                return Ok(CheckOutcome::proceed());
            }

            let existing: Option<Option<serde_json::Value>> =
                sqlx::query_scalar("SELECT result FROM idempotency_keys WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;

            if let Some(result) = existing {
                metrics::counter!("idempotency_duplicates_total").increment(1);
                return Ok(CheckOutcome::processed(result));
            }
        }

        // Still contended after two passes; treat as in flight elsewhere.
        Ok(CheckOutcome::processed(None))
    }

    async fn record_result(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + self.config.ttl_chrono()?;

        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, result, claimed_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
                SET result = EXCLUDED.result, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&result)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND result IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        tracing::debug!(removed = done.rows_affected(), "purged idempotency keys");
        Ok(done.rows_affected())
    }
}
