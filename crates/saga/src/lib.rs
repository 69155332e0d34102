//! Saga orchestration for multi-step distributed transactions.
//!
//! A saga is an ordered list of steps, each calling an external service and
//! each paired with a compensation. The [`SagaOrchestrator`] runs the steps in
//! order, persisting a [`SagaContext`] after every transition, and on failure
//! runs compensations for completed steps in reverse order.
//!
//! Every external call goes through an [`IdempotentStep`]:
//! 1. look up a cached result under a deterministic idempotency key
//! 2. otherwise call through Bulkhead → CircuitBreaker → RetryExecutor
//! 3. cache the successful result
//!
//! so re-running a step after a crash does not repeat its side effect.
//!
//! [`SagaEventRouter`] offers an event-driven alternative where steps are
//! triggered by incoming events instead of direct calls.

pub mod definition;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod orchestrator;
pub mod order_fulfillment;
pub mod router;
pub mod services;
pub mod step;

pub use definition::{SagaDefinition, SagaDefinitionBuilder};
pub use error::{Result, SagaError};
pub use events::{EventPublisher, InMemoryEventBus, SagaEvent};
pub use orchestrator::{OrchestratorConfig, SagaOrchestrator};
pub use router::{
    DeadLetter, DeadLetterSink, EventHandler, InMemoryDeadLetterSink, RouteOutcome,
    SagaEventRouter, handler_fn,
};
pub use saga_store::{SagaContext, SagaData, SagaId, SagaStatus, StepRecord, StepStatus};
pub use services::FailureMode;
pub use step::{
    FnAction, IdempotentStep, ParallelAction, StepAction, StepDefinition, StepResult, action_fn,
};
