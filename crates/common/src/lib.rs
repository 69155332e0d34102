//! Shared types for the saga orchestration engine.

pub mod types;

pub use types::{SagaData, SagaId, merge_data};
