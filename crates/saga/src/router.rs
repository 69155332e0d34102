//! Choreography mode: route incoming events to registered handlers.
//!
//! Delivery is idempotent per `(saga_id, event_type)`: a delivery claims the
//! ledger key before any handler runs, so overlapping redeliveries dispatch
//! once. Handler failures release the claim and are captured in a dead-letter
//! sink; they are never re-queued automatically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use resilience::ClassifiedError;
use saga_store::{IdempotencyStore, SagaData, SagaId, SagaRepository};
use serde::Serialize;

use crate::error::Result;
use crate::events::SagaEvent;

const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// How long an in-flight claim blocks redeliveries if the router dies mid-dispatch.
const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

/// Handles one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, saga_id: SagaId, event: &SagaEvent) -> std::result::Result<(), ClassifiedError>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(SagaId, SagaEvent) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), ClassifiedError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, saga_id: SagaId, event: &SagaEvent) -> std::result::Result<(), ClassifiedError> {
        (self.f)(saga_id, event.clone()).await
    }
}

/// Wraps an async closure as a named event handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(SagaId, SagaEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ClassifiedError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// An event a handler could not process.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event: SagaEvent,
    /// `None` when the event could not be correlated to a saga at all.
    pub handler: Option<String>,
    pub error: String,
    /// Failed deliveries of this event so far, this one included.
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Where dead letters go.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter);
}

/// Dead-letter sink that keeps letters in memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) {
        self.letters.lock().push(letter);
    }
}

/// What [`SagaEventRouter::route`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Every matching handler succeeded; the event is marked processed.
    Dispatched { handlers: usize },
    /// Already processed for this saga; nothing ran.
    Duplicate,
    /// No handler is registered for the event type.
    Unhandled,
    /// Some handlers failed and were dead-lettered.
    PartiallyFailed { succeeded: usize, failed: usize },
    /// No saga could be found for the event.
    DeadLettered,
}

type HandlerMap = RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>;

/// Failed deliveries per handler for one ledger key.
struct FailureCounts {
    per_handler: HashMap<String, u32>,
    last_failed: Instant,
}

/// Routes events to per-type forward and compensation handlers.
pub struct SagaEventRouter {
    forward: HandlerMap,
    compensation: HandlerMap,
    ledger: Arc<dyn IdempotencyStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    repository: Option<Arc<dyn SagaRepository>>,
    failures: Mutex<HashMap<String, FailureCounts>>,
    ledger_ttl: Duration,
    claim_ttl: Duration,
}

impl SagaEventRouter {
    pub fn new(ledger: Arc<dyn IdempotencyStore>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            forward: RwLock::new(HashMap::new()),
            compensation: RwLock::new(HashMap::new()),
            ledger,
            dead_letters,
            repository: None,
            failures: Mutex::new(HashMap::new()),
            ledger_ttl: DEFAULT_LEDGER_TTL,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    /// Resolves events that carry only a correlation key through `repository`.
    pub fn with_repository(mut self, repository: Arc<dyn SagaRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// How long processed events are remembered. Failure counts for events
    /// that never succeed are forgotten after the same period.
    pub fn with_ledger_ttl(mut self, ttl: Duration) -> Self {
        self.ledger_ttl = ttl;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.forward
            .write()
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    pub fn register_compensation(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.compensation
            .write()
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    /// Dispatches `event` to every matching handler.
    ///
    /// Handler failures are dead-lettered and do not stop the remaining handlers.
    /// Only ledger and repository failures are returned as errors.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.event_id))]
    pub async fn route(&self, event: SagaEvent) -> Result<RouteOutcome> {
        let Some(saga_id) = self.correlate(&event).await? else {
            self.dead_letter(event, None, "event could not be correlated to a saga".into(), 1)
                .await;
            return Ok(RouteOutcome::DeadLettered);
        };

        let key = ledger_key(saga_id, &event);
        let handlers = {
            let map = if event.compensating {
                self.compensation.read()
            } else {
                self.forward.read()
            };
            map.get(&event.event_type).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            tracing::debug!(%saga_id, "no handler registered");
            return Ok(RouteOutcome::Unhandled);
        }

        let mut marker = SagaData::new();
        marker.insert("event_id".into(), serde_json::json!(event.event_id));
        if !self.ledger.try_claim(&key, marker.clone(), self.claim_ttl).await? {
            tracing::debug!(%saga_id, "duplicate event skipped");
            return Ok(RouteOutcome::Duplicate);
        }

        let mut failed = 0;
        for handler in &handlers {
            if let Err(e) = handler.handle(saga_id, &event).await {
                failed += 1;
                let retry_count = self.record_failure(&key, handler.name());
                self.dead_letter(
                    event.clone(),
                    Some(handler.name().to_string()),
                    e.to_string(),
                    retry_count,
                )
                .await;
            }
        }

        if failed > 0 {
            // Release the claim so a redelivery dispatches again
            self.ledger.remove(&key).await?;
            return Ok(RouteOutcome::PartiallyFailed {
                succeeded: handlers.len() - failed,
                failed,
            });
        }

        self.ledger.set(&key, marker, self.ledger_ttl).await?;
        self.failures.lock().remove(&key);
        tracing::info!(%saga_id, handlers = handlers.len(), "event dispatched");
        Ok(RouteOutcome::Dispatched {
            handlers: handlers.len(),
        })
    }

    /// Bumps the failure count for `handler` under `key` and returns it.
    fn record_failure(&self, key: &str, handler: &str) -> u32 {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        failures.retain(|_, counts| now.duration_since(counts.last_failed) < self.ledger_ttl);
        let counts = failures
            .entry(key.to_string())
            .or_insert_with(|| FailureCounts {
                per_handler: HashMap::new(),
                last_failed: now,
            });
        counts.last_failed = now;
        let count = counts.per_handler.entry(handler.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Number of events with failed deliveries still being counted.
    pub fn tracked_failures(&self) -> usize {
        self.failures.lock().len()
    }

    async fn correlate(&self, event: &SagaEvent) -> Result<Option<SagaId>> {
        if let Some(saga_id) = event.saga_id {
            return Ok(Some(saga_id));
        }
        match (&self.repository, &event.correlation_id) {
            (Some(repository), Some(correlation_id)) => Ok(repository
                .find_by_correlation(correlation_id)
                .await?
                .map(|ctx| ctx.saga_id)),
            _ => Ok(None),
        }
    }

    async fn dead_letter(
        &self,
        event: SagaEvent,
        handler: Option<String>,
        error: String,
        retry_count: u32,
    ) {
        metrics::counter!("saga_dead_letters_total", "event_type" => event.event_type.clone())
            .increment(1);
        tracing::warn!(
            event_type = %event.event_type,
            handler = handler.as_deref().unwrap_or("-"),
            retry_count,
            %error,
            "event dead-lettered"
        );
        self.dead_letters
            .record(DeadLetter {
                event,
                handler,
                error,
                retry_count,
                failed_at: Utc::now(),
            })
            .await;
    }
}

fn ledger_key(saga_id: SagaId, event: &SagaEvent) -> String {
    if event.compensating {
        format!("event:comp:{saga_id}:{}", event.event_type)
    } else {
        format!("event:{saga_id}:{}", event.event_type)
    }
}
