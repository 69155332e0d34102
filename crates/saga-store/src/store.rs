use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SagaContext, SagaData, SagaId, Version};

/// Persistence collaborator for saga contexts.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Loads a saga context by ID.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaContext>>;

    /// Persists a context.
    ///
    /// `context.version` must be the version the caller last loaded or saved
    /// ([`Version::initial`] for a context that was never saved). A stale version
    /// fails with `ConcurrencyConflict`, so two writers racing on the same saga
    /// cannot both advance it.
    ///
    /// Returns the new version of the stored context.
    async fn save(&self, context: &SagaContext) -> Result<Version>;

    /// Finds the most recently created saga with the given correlation key.
    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<SagaContext>>;

    /// Lists every saga that has not reached a terminal status, oldest first.
    async fn find_incomplete(&self) -> Result<Vec<SagaContext>>;
}

/// A cached result of a step (or compensation) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: SagaData,
    pub executed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates a record executed now that expires after `ttl`.
    pub fn new(key: impl Into<String>, result: SagaData, ttl: Duration) -> Self {
        let executed_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| executed_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.into(),
            result,
            executed_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Idempotency-store collaborator: results keyed by idempotency key, with a TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the live record for `key`. Expired records are never returned.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Stores `result` under `key`, replacing any previous record.
    async fn set(&self, key: &str, result: SagaData, ttl: Duration) -> Result<()>;

    /// Stores `result` under `key` only if no live record exists.
    ///
    /// Returns true if this call created the record. Concurrent callers racing
    /// on the same key see exactly one `true`.
    async fn try_claim(&self, key: &str, result: SagaData, ttl: Duration) -> Result<bool>;

    /// Evicts the record for `key`. Returns true if one existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Deletes every expired record and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}
