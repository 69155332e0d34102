//! Persistence for saga orchestration.
//!
//! This crate owns the saga data model ([`SagaContext`], [`StepRecord`] and their
//! status enums) and the two storage collaborators the orchestrator depends on:
//! - [`SagaRepository`]: saga contexts with optimistic versioning
//! - [`IdempotencyStore`]: cached step results with a TTL
//!
//! Both have in-memory implementations for tests and PostgreSQL implementations.

pub mod context;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod state;
pub mod store;

pub use common::{SagaData, SagaId};
pub use context::{SagaContext, StepRecord, Version};
pub use error::{Result, StoreError};
pub use memory::{InMemoryIdempotencyStore, InMemorySagaRepository};
pub use postgres::{PostgresIdempotencyStore, PostgresSagaRepository, run_migrations};
pub use state::{SagaStatus, StepStatus};
pub use store::{IdempotencyRecord, IdempotencyStore, SagaRepository};
