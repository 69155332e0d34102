use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    IdempotencyRecord, Result, SagaContext, SagaData, SagaId, StoreError, Version,
    store::{IdempotencyStore, SagaRepository},
};

/// In-memory saga repository for tests and single-process deployments.
///
/// Enforces the same optimistic versioning as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    sagas: Arc<RwLock<HashMap<SagaId, SagaContext>>>,
}

impl InMemorySagaRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sagas.
    pub async fn len(&self) -> usize {
        self.sagas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sagas.read().await.is_empty()
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaContext>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn save(&self, context: &SagaContext) -> Result<Version> {
        let mut sagas = self.sagas.write().await;

        let actual = sagas
            .get(&context.saga_id)
            .map(|stored| stored.version)
            .unwrap_or(Version::initial());

        if actual != context.version {
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

        let version = context.version.next();
        let mut stored = context.clone();
        stored.version = version;
        sagas.insert(context.saga_id, stored);
        Ok(version)
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<SagaContext>> {
        Ok(self
            .sagas
            .read()
            .await
            .values()
            .filter(|ctx| ctx.correlation_id.as_deref() == Some(correlation_id))
            .max_by_key(|ctx| ctx.created_at)
            .cloned())
    }

    async fn find_incomplete(&self) -> Result<Vec<SagaContext>> {
        let mut incomplete: Vec<SagaContext> = self
            .sagas
            .read()
            .await
            .values()
            .filter(|ctx| !ctx.status.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by_key(|ctx| ctx.created_at);
        Ok(incomplete)
    }
}

/// In-memory idempotency store with lazy expiry.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Inserts a record as-is. Useful for seeding expired entries in tests.
    pub async fn insert_record(&self, record: IdempotencyRecord) {
        self.records.write().await.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn set(&self, key: &str, result: SagaData, ttl: Duration) -> Result<()> {
        let record = IdempotencyRecord::new(key, result, ttl);
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn try_claim(&self, key: &str, result: SagaData, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        if records.get(key).is_some_and(|record| !record.is_expired(now)) {
            return Ok(false);
        }
        records.insert(key.to_string(), IdempotencyRecord::new(key, result, ttl));
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        let purged = (before - records.len()) as u64;
        tracing::debug!(purged, "Purged expired idempotency records");
        Ok(purged)
    }
}
