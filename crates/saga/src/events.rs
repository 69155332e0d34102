//! Saga events and the event transport.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience::{ClassifiedError, ErrorKind};
use saga_store::{SagaContext, SagaId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::router::SagaEventRouter;

pub const SAGA_STARTED: &str = "saga.started";
pub const SAGA_STEP_COMPLETED: &str = "saga.step_completed";
pub const SAGA_STEP_FAILED: &str = "saga.step_failed";
pub const SAGA_COMPLETED: &str = "saga.completed";
pub const SAGA_COMPENSATED: &str = "saga.compensated";
pub const SAGA_FAILED: &str = "saga.failed";

/// Published events kept by [`InMemoryEventBus`] before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// An event exchanged between saga participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEvent {
    pub event_id: Uuid,
    pub event_type: String,
    /// The saga this event belongs to, when the sender knows it.
    pub saga_id: Option<SagaId>,
    /// Business key used to find the saga when `saga_id` is absent.
    pub correlation_id: Option<String>,
    /// Routes to compensation handlers instead of forward handlers.
    #[serde(default)]
    pub compensating: bool,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl SagaEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            saga_id: None,
            correlation_id: None,
            compensating: false,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn compensating(mut self) -> Self {
        self.compensating = true;
        self
    }

    /// A lifecycle event describing the saga's current state.
    pub fn lifecycle(event_type: &str, ctx: &SagaContext, step: Option<&str>) -> Self {
        let payload = serde_json::json!({
            "saga_type": ctx.saga_type,
            "status": ctx.status,
            "step": step,
            "error": ctx.error,
            "needs_remediation": ctx.needs_remediation,
        });
        let mut event = Self::new(event_type, payload).for_saga(ctx.saga_id);
        event.correlation_id = ctx.correlation_id.clone();
        event
    }
}

/// Event transport collaborator.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event` on `topic`. Delivery is at-least-once.
    async fn publish(&self, topic: &str, event: SagaEvent) -> Result<(), ClassifiedError>;
}

/// In-process event bus backed by an unbounded tokio channel.
///
/// The most recent published events are also kept in a bounded log for
/// inspection.
#[derive(Clone)]
pub struct InMemoryEventBus {
    sender: mpsc::UnboundedSender<SagaEvent>,
    published: Arc<Mutex<VecDeque<(String, SagaEvent)>>>,
    log_capacity: usize,
}

impl InMemoryEventBus {
    /// Creates a bus and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SagaEvent>) {
        Self::channel_with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Like [`channel`](Self::channel), keeping at most `log_capacity` events in the log.
    pub fn channel_with_log_capacity(
        log_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SagaEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let bus = Self {
            sender,
            published: Arc::new(Mutex::new(VecDeque::new())),
            log_capacity,
        };
        (bus, receiver)
    }

    /// Creates a bus whose events are delivered to `router` by a background task.
    pub fn with_router(router: Arc<SagaEventRouter>) -> (Self, JoinHandle<()>) {
        let (bus, receiver) = Self::channel();
        (bus, spawn_delivery(receiver, router))
    }

    /// The logged events, oldest first, as `(topic, event)` pairs.
    pub fn published(&self) -> Vec<(String, SagaEvent)> {
        self.published.lock().iter().cloned().collect()
    }

    pub fn published_types(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|(_, event)| event.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, topic: &str, event: SagaEvent) -> Result<(), ClassifiedError> {
        if self.log_capacity > 0 {
            let mut log = self.published.lock();
            if log.len() == self.log_capacity {
                log.pop_front();
            }
            log.push_back((topic.to_string(), event.clone()));
        }
        self.sender
            .send(event)
            .map_err(|_| ClassifiedError::new(ErrorKind::Unavailable, "event bus is closed"))
    }
}

/// Delivers every received event to `router` until the channel closes.
pub fn spawn_delivery(
    mut receiver: mpsc::UnboundedReceiver<SagaEvent>,
    router: Arc<SagaEventRouter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = router.route(event).await {
                tracing::error!(error = %e, "failed to route saga event");
            }
        }
    })
}
