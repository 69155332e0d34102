use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    IdempotencyRecord, Result, SagaContext, SagaData, SagaId, StoreError, Version,
    state::SagaStatus,
    store::{IdempotencyStore, SagaRepository},
};

/// Runs the database migrations shared by both PostgreSQL stores.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// PostgreSQL-backed saga repository.
///
/// The full context is stored as JSONB; the status, correlation ID and version
/// are mirrored into columns for lookups and the optimistic version check.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    /// Creates a new PostgreSQL saga repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        run_migrations(&self.pool).await
    }

    fn row_to_context(row: PgRow) -> Result<SagaContext> {
        let json: serde_json::Value = row.try_get("context")?;
        let mut context: SagaContext = serde_json::from_value(json)?;
        context.version = Version::new(row.try_get("version")?);
        Ok(context)
    }

    async fn current_version(&self, saga_id: SagaId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM sagas WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaContext>> {
        let row = sqlx::query("SELECT context, version FROM sagas WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_context).transpose()
    }

    async fn save(&self, context: &SagaContext) -> Result<Version> {
        let version = context.version.next();
        let mut stored = context.clone();
        stored.version = version;
        let json = serde_json::to_value(&stored)?;

        let result = if context.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO sagas (saga_id, saga_type, correlation_id, status, version, context, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(context.saga_id.as_uuid())
            .bind(&context.saga_type)
            .bind(context.correlation_id.as_deref())
            .bind(context.status.as_str())
            .bind(version.as_i64())
            .bind(json)
            .bind(context.created_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE sagas
                SET status = $2, correlation_id = $3, version = $4, context = $5, updated_at = NOW()
                WHERE saga_id = $1 AND version = $6
                "#,
            )
            .bind(context.saga_id.as_uuid())
            .bind(context.status.as_str())
            .bind(context.correlation_id.as_deref())
            .bind(version.as_i64())
            .bind(json)
            .bind(context.version.as_i64())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            let actual = self.current_version(context.saga_id).await?;
            tracing::warn!(
                saga_id = %context.saga_id,
                expected = %context.version,
                actual = %actual,
                "Rejected stale saga save"
            );
            return Err(StoreError::ConcurrencyConflict {
                saga_id: context.saga_id,
                expected: context.version,
                actual,
            });
        }

        Ok(version)
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<SagaContext>> {
        let row = sqlx::query(
            r#"
            SELECT context, version FROM sagas
            WHERE correlation_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_context).transpose()
    }

    async fn find_incomplete(&self) -> Result<Vec<SagaContext>> {
        let terminal: Vec<&str> = SagaStatus::terminal().iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(
            r#"
            SELECT context, version FROM sagas
            WHERE status <> ALL($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&terminal)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_context).collect()
    }
}

/// PostgreSQL-backed idempotency store.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
        let result: serde_json::Value = row.try_get("result")?;
        Ok(IdempotencyRecord {
            key: row.try_get("key")?,
            result: serde_json::from_value::<SagaData>(result)?,
            executed_at: row.try_get::<DateTime<Utc>, _>("executed_at")?,
            expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, result, executed_at, expires_at
            FROM idempotency_records
            WHERE key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn set(&self, key: &str, result: SagaData, ttl: Duration) -> Result<()> {
        let record = IdempotencyRecord::new(key, result, ttl);
        let json = serde_json::to_value(&record.result)?;

        sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, result, executed_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET result = EXCLUDED.result,
                executed_at = EXCLUDED.executed_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&record.key)
        .bind(json)
        .bind(record.executed_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_claim(&self, key: &str, result: SagaData, ttl: Duration) -> Result<bool> {
        let record = IdempotencyRecord::new(key, result, ttl);
        let json = serde_json::to_value(&record.result)?;

        // An expired record may be taken over; a live one may not.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, result, executed_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET result = EXCLUDED.result,
                executed_at = EXCLUDED.executed_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.expires_at <= NOW()
            "#,
        )
        .bind(&record.key)
        .bind(json)
        .bind(record.executed_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        tracing::debug!(purged = result.rows_affected(), "Purged expired idempotency records");
        Ok(result.rows_affected())
    }
}
