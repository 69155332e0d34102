//! Fault-isolation primitives used by saga steps when calling external dependencies.
//!
//! Calls are layered outermost-first:
//! 1. [`Bulkhead`] bounds concurrent in-flight calls per dependency tier
//! 2. [`CircuitBreaker`] fails fast while a dependency is known to be unhealthy
//! 3. [`RetryExecutor`] retries transient failures with exponential backoff and full jitter
//!
//! Breakers and bulkheads are shared process-wide through a [`ResilienceRegistry`],
//! keyed by dependency name.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod error;
pub mod registry;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats, BulkheadTier, RejectionPolicy};
pub use circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use error::{ClassifiedError, ErrorKind, ResilienceError, Result};
pub use registry::{RegistrySnapshot, ResilienceRegistry};
pub use retry::{RetryBudget, RetryBudgetConfig, RetryExecutor, RetryPolicy};
