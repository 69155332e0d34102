//! Saga error types.
//!
//! Business failures never surface here: they end up in the terminal
//! [`SagaContext`](saga_store::SagaContext). These are the infrastructure
//! failures that leave the orchestrator unable to guarantee saga integrity.

use saga_store::{SagaId, SagaStatus, StoreError};
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Persistence failed; saga state can no longer be trusted.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The saga definition is malformed.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A resume index beyond the step list.
    #[error("Invalid resume index {index} for saga with {steps} steps")]
    InvalidResumeIndex { index: usize, steps: usize },

    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: SagaStatus,
    },
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
