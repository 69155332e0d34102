use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with saga storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The context was saved from a stale version.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga was not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
