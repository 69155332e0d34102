//! Saga orchestrator for driving sagas to a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::merge_data;
use parking_lot::RwLock;
use resilience::ResilienceRegistry;
use saga_store::{
    IdempotencyStore, SagaContext, SagaData, SagaId, SagaRepository, SagaStatus, StepStatus,
};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::{
    EventPublisher, SAGA_COMPENSATED, SAGA_COMPLETED, SAGA_FAILED, SAGA_STARTED,
    SAGA_STEP_COMPLETED, SAGA_STEP_FAILED, SagaEvent,
};
use crate::idempotency::LocalCache;
use crate::step::IdempotentStep;

const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_LOCAL_CACHE_CAPACITY: usize = 1024;

/// Orchestrator settings shared by every registered saga.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// How long step results stay in the idempotency store.
    pub idempotency_ttl: Duration,
    /// Records kept in the in-process cache in front of the store.
    pub local_cache_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            local_cache_capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
        }
    }
}

struct RegisteredSaga {
    definition: SagaDefinition,
    steps: Vec<IdempotentStep>,
}

/// Drives registered saga definitions against persisted [`SagaContext`]s.
///
/// Steps of one saga run strictly in order and the context is saved after every
/// step-status transition. When a step fails, completed steps are compensated in
/// reverse order. Business failures end in a terminal context; only
/// infrastructure failures are returned as errors.
pub struct SagaOrchestrator {
    repository: Arc<dyn SagaRepository>,
    idempotency: Arc<dyn IdempotencyStore>,
    registry: Arc<ResilienceRegistry>,
    config: OrchestratorConfig,
    cache: Arc<LocalCache>,
    sagas: RwLock<HashMap<String, Arc<RegisteredSaga>>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl SagaOrchestrator {
    pub fn new(
        repository: Arc<dyn SagaRepository>,
        idempotency: Arc<dyn IdempotencyStore>,
        registry: Arc<ResilienceRegistry>,
    ) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            repository,
            idempotency,
            registry,
            cache: Arc::new(LocalCache::new(config.local_cache_capacity)),
            config,
            sagas: RwLock::new(HashMap::new()),
            publisher: None,
        }
    }

    /// Replaces the config. Call before registering definitions.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.cache = Arc::new(LocalCache::new(config.local_cache_capacity));
        self.config = config;
        self
    }

    /// Publishes lifecycle events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Registers a definition, replacing any previous one of the same type.
    pub fn register(&self, definition: SagaDefinition) {
        let steps = definition
            .steps()
            .iter()
            .map(|step| {
                IdempotentStep::new(
                    step.clone(),
                    &self.registry,
                    self.idempotency.clone(),
                    self.cache.clone(),
                    self.config.idempotency_ttl,
                )
            })
            .collect();
        let saga_type = definition.saga_type().to_string();
        tracing::info!(saga_type = %saga_type, "saga definition registered");
        self.sagas
            .write()
            .insert(saga_type, Arc::new(RegisteredSaga { definition, steps }));
    }

    pub fn saga_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sagas.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    pub async fn get(&self, saga_id: SagaId) -> Result<Option<SagaContext>> {
        Ok(self.repository.get(saga_id).await?)
    }

    pub async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<SagaContext>> {
        Ok(self.repository.find_by_correlation(correlation_id).await?)
    }

    /// Starts a saga of `saga_type` and runs it to a terminal state.
    #[tracing::instrument(skip(self, data), fields(saga_id))]
    pub async fn execute(
        &self,
        saga_type: &str,
        data: SagaData,
        correlation_id: Option<String>,
    ) -> Result<SagaContext> {
        let saga = self.lookup(saga_type)?;
        metrics::counter!("saga_executions_total", "saga_type" => saga_type.to_string())
            .increment(1);

        let mut ctx = SagaContext::new(saga_type, saga.definition.step_names(), data)
            .with_timeout(saga.definition.timeout());
        ctx.correlation_id = correlation_id;
        tracing::Span::current().record("saga_id", tracing::field::display(ctx.saga_id));

        ctx.transition(SagaStatus::Running);
        ctx.started_at = Some(Utc::now());
        self.persist(&mut ctx).await?;
        tracing::info!("saga started");
        self.publish(SAGA_STARTED, &ctx, None).await;

        self.drive(&saga, &mut ctx).await?;
        Ok(ctx)
    }

    /// Continues a persisted saga.
    ///
    /// Without `from_step`, picks up at `current_step_index` (or wherever the
    /// compensation sweep stopped). With it, re-enters the forward loop at that
    /// index; already-completed steps re-run from the idempotency cache.
    /// A terminal saga is returned unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, saga_id: SagaId, from_step: Option<usize>) -> Result<SagaContext> {
        let mut ctx = self
            .repository
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if ctx.status.is_terminal() {
            tracing::info!(status = %ctx.status, "saga already terminal, nothing to resume");
            return Ok(ctx);
        }

        let saga = self.lookup(&ctx.saga_type)?;

        if let Some(index) = from_step {
            if !matches!(ctx.status, SagaStatus::Pending | SagaStatus::Running) {
                return Err(SagaError::InvalidState {
                    expected: "PENDING or RUNNING".into(),
                    actual: ctx.status,
                });
            }
            if index > ctx.current_step_index {
                return Err(SagaError::InvalidResumeIndex {
                    index,
                    steps: ctx.steps.len(),
                });
            }
            for record in &mut ctx.steps[index..] {
                record.status = StepStatus::Pending;
            }
            ctx.current_step_index = index;
        }

        tracing::info!(status = %ctx.status, step = ctx.current_step_index, "saga resumed");
        self.drive(&saga, &mut ctx).await?;
        Ok(ctx)
    }

    /// Resumes every non-terminal saga in the repository.
    ///
    /// A saga that cannot be resumed is logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn recover_incomplete(&self) -> Result<Vec<SagaContext>> {
        let incomplete = self.repository.find_incomplete().await?;
        tracing::info!(count = incomplete.len(), "recovering incomplete sagas");

        let mut recovered = Vec::with_capacity(incomplete.len());
        for ctx in incomplete {
            match self.resume(ctx.saga_id, None).await {
                Ok(ctx) => recovered.push(ctx),
                Err(e) => {
                    tracing::error!(saga_id = %ctx.saga_id, error = %e, "failed to recover saga")
                }
            }
        }
        Ok(recovered)
    }

    /// Re-runs failed compensations of a saga flagged for remediation.
    #[tracing::instrument(skip(self))]
    pub async fn retry_compensations(&self, saga_id: SagaId) -> Result<SagaContext> {
        let mut ctx = self
            .repository
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        let has_failed_compensation = ctx
            .steps
            .iter()
            .any(|step| step.status == StepStatus::CompensationFailed);
        if ctx.status != SagaStatus::Failed || !ctx.needs_remediation || !has_failed_compensation
        {
            return Err(SagaError::InvalidState {
                expected: "FAILED with a failed compensation".into(),
                actual: ctx.status,
            });
        }

        let saga = self.lookup(&ctx.saga_type)?;
        ctx.needs_remediation = false;
        ctx.completed_at = None;
        self.compensate(&saga, &mut ctx).await?;
        Ok(ctx)
    }

    fn lookup(&self, saga_type: &str) -> Result<Arc<RegisteredSaga>> {
        self.sagas
            .read()
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    async fn drive(&self, saga: &RegisteredSaga, ctx: &mut SagaContext) -> Result<()> {
        let started = Instant::now();
        match ctx.status {
            SagaStatus::Pending => {
                ctx.transition(SagaStatus::Running);
                ctx.started_at.get_or_insert_with(Utc::now);
                self.persist(ctx).await?;
                self.run_forward(saga, ctx).await?;
            }
            SagaStatus::Running => self.run_forward(saga, ctx).await?,
            SagaStatus::TimedOut | SagaStatus::Compensating => self.compensate(saga, ctx).await?,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => {}
        }
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn run_forward(&self, saga: &RegisteredSaga, ctx: &mut SagaContext) -> Result<()> {
        while ctx.current_step_index < saga.steps.len() {
            let index = ctx.current_step_index;
            let step = &saga.steps[index];
            let now = Utc::now();

            if ctx.is_deadline_exceeded(now) {
                tracing::warn!(step = step.name(), "saga deadline exceeded");
                metrics::counter!("saga_timed_out").increment(1);
                ctx.timed_out = true;
                ctx.error = Some(format!("saga timed out before step '{}'", step.name()));
                ctx.transition(SagaStatus::TimedOut);
                self.persist(ctx).await?;
                return self.compensate(saga, ctx).await;
            }

            let timeout = effective_timeout(step.definition().timeout, ctx.remaining(now));
            let key = match &ctx.steps[index].idempotency_key {
                Some(key) => key.clone(),
                None => step.key_for(ctx.saga_id, &ctx.data),
            };
            ctx.steps[index].status = StepStatus::Running;
            ctx.steps[index].idempotency_key = Some(key.clone());
            self.persist(ctx).await?;
            tracing::info!(step = step.name(), ?timeout, "saga step started");

            let result = step.execute_keyed(ctx.saga_id, &ctx.data, key, timeout).await?;
            ctx.steps[index].attempts += result.attempts;

            match result.outcome {
                Ok(output) => {
                    let record = &mut ctx.steps[index];
                    record.status = StepStatus::Completed;
                    record.executed_at = Some(Utc::now());
                    record.result = Some(output.clone());
                    record.error = None;
                    merge_data(&mut ctx.data, output);
                    ctx.current_step_index += 1;
                    self.persist(ctx).await?;
                    tracing::info!(
                        step = step.name(),
                        cached = result.was_cached,
                        attempts = result.attempts,
                        "saga step completed"
                    );
                    self.publish(SAGA_STEP_COMPLETED, ctx, Some(step.name())).await;
                }
                Err(error) => {
                    ctx.steps[index].status = StepStatus::Failed;
                    ctx.steps[index].error = Some(error.to_string());
                    ctx.error = Some(format!("step '{}' failed: {error}", step.name()));
                    ctx.transition(SagaStatus::Compensating);
                    self.persist(ctx).await?;
                    tracing::warn!(step = step.name(), error = %error, "saga step failed, compensating");
                    self.publish(SAGA_STEP_FAILED, ctx, Some(step.name())).await;
                    return self.compensate(saga, ctx).await;
                }
            }
        }

        ctx.transition(SagaStatus::Completed);
        ctx.completed_at = Some(Utc::now());
        self.persist(ctx).await?;
        metrics::counter!("saga_completed").increment(1);
        tracing::info!("saga completed");
        self.publish(SAGA_COMPLETED, ctx, None).await;
        Ok(())
    }

    /// Compensates every step whose effect may still be in place, newest first.
    ///
    /// A failed compensation is recorded and the sweep carries on. Steps up to a
    /// completed pivot are never compensated.
    async fn compensate(&self, saga: &RegisteredSaga, ctx: &mut SagaContext) -> Result<()> {
        if ctx.status != SagaStatus::Compensating {
            ctx.transition(SagaStatus::Compensating);
            self.persist(ctx).await?;
        }

        let floor = match saga.definition.pivot() {
            Some(pivot) if ctx.steps[pivot].status == StepStatus::Completed => pivot + 1,
            _ => 0,
        };

        for index in (floor..ctx.steps.len()).rev() {
            if !ctx.steps[index].status.needs_compensation() {
                continue;
            }
            let step = &saga.steps[index];
            let forward_key = match &ctx.steps[index].idempotency_key {
                Some(key) => key.clone(),
                None => step.key_for(ctx.saga_id, &ctx.data),
            };
            ctx.steps[index].status = StepStatus::Compensating;
            self.persist(ctx).await?;
            tracing::info!(step = step.name(), "compensating step");

            let result = step.compensate(ctx.saga_id, &ctx.data, &forward_key).await?;
            let record = &mut ctx.steps[index];
            match result.outcome {
                Ok(_) => {
                    record.status = StepStatus::Compensated;
                    record.compensated_at = Some(Utc::now());
                }
                Err(error) => {
                    record.status = StepStatus::CompensationFailed;
                    record.error = Some(error.to_string());
                    metrics::counter!("saga_compensation_failures_total", "step" => step.name().to_string())
                        .increment(1);
                    tracing::warn!(step = step.name(), error = %error, "compensation failed");
                }
            }
            self.persist(ctx).await?;
        }

        let pivot_committed = floor > 0;
        let all_compensated = ctx
            .steps
            .iter()
            .all(|s| s.status != StepStatus::CompensationFailed);

        ctx.completed_at = Some(Utc::now());
        if all_compensated && !pivot_committed {
            ctx.transition(SagaStatus::Compensated);
            self.persist(ctx).await?;
            metrics::counter!("saga_compensated").increment(1);
            tracing::info!("saga compensated");
            self.publish(SAGA_COMPENSATED, ctx, None).await;
        } else {
            ctx.needs_remediation = true;
            ctx.transition(SagaStatus::Failed);
            self.persist(ctx).await?;
            metrics::counter!("saga_failed").increment(1);
            tracing::warn!(pivot_committed, "saga failed and needs remediation");
            self.publish(SAGA_FAILED, ctx, None).await;
        }
        Ok(())
    }

    async fn persist(&self, ctx: &mut SagaContext) -> Result<()> {
        ctx.version = self.repository.save(ctx).await?;
        Ok(())
    }

    async fn publish(&self, event_type: &str, ctx: &SagaContext, step: Option<&str>) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let event = SagaEvent::lifecycle(event_type, ctx, step);
        if let Err(e) = publisher.publish(event_type, event).await {
            tracing::warn!(event_type, error = %e, "failed to publish saga event");
        }
    }
}

/// The tighter of the step timeout and the time left before the saga deadline.
fn effective_timeout(step_timeout: Duration, remaining: Option<Duration>) -> Duration {
    match remaining {
        Some(remaining) => step_timeout.min(remaining),
        None => step_timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDefinition, action_fn};
    use resilience::ClassifiedError;
    use saga_store::{InMemoryIdempotencyStore, InMemorySagaRepository};
    use serde_json::json;

    fn ok_step(name: &str, key: &'static str) -> StepDefinition {
        StepDefinition::new(
            name,
            action_fn(move |_, _| async move {
                let mut out = SagaData::new();
                out.insert(key.into(), json!(true));
                Ok(out)
            }),
        )
    }

    fn setup() -> (SagaOrchestrator, InMemorySagaRepository) {
        let repository = InMemorySagaRepository::new();
        let orchestrator = SagaOrchestrator::new(
            Arc::new(repository.clone()),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(ResilienceRegistry::new()),
        );
        (orchestrator, repository)
    }

    #[test]
    fn test_effective_timeout() {
        let step = Duration::from_secs(30);
        assert_eq!(effective_timeout(step, None), step);
        assert_eq!(
            effective_timeout(step, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(effective_timeout(step, Some(Duration::from_secs(60))), step);
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (orchestrator, repository) = setup();
        orchestrator.register(
            SagaDefinition::builder("Simple")
                .step(ok_step("a", "a_done"))
                .step(ok_step("b", "b_done"))
                .build()
                .unwrap(),
        );

        let mut data = SagaData::new();
        data.insert("input".into(), json!(1));
        let ctx = orchestrator
            .execute("Simple", data, Some("corr-1".into()))
            .await
            .unwrap();

        assert_eq!(ctx.status, SagaStatus::Completed);
        assert_eq!(ctx.current_step_index, 2);
        assert!(ctx.completed_at.is_some());
        assert_eq!(ctx.data.get("input"), Some(&json!(1)));
        assert_eq!(ctx.data.get("a_done"), Some(&json!(true)));
        assert_eq!(ctx.data.get("b_done"), Some(&json!(true)));
        assert!(ctx.steps.iter().all(|s| s.status == StepStatus::Completed));

        let stored = repository.get(ctx.saga_id).await.unwrap().unwrap();
        assert_eq!(stored, ctx);
        let found = orchestrator.find_by_correlation("corr-1").await.unwrap().unwrap();
        assert_eq!(found.saga_id, ctx.saga_id);
    }

    #[tokio::test]
    async fn test_unknown_saga_type() {
        let (orchestrator, _) = setup();
        let result = orchestrator.execute("Nope", SagaData::new(), None).await;
        assert!(matches!(result, Err(SagaError::UnknownSagaType(_))));
    }

    #[tokio::test]
    async fn test_first_step_failure_compensates_nothing() {
        let (orchestrator, _) = setup();
        let failing = action_fn(|_, _| async {
            Err::<SagaData, _>(ClassifiedError::permanent("out of stock"))
        });
        orchestrator.register(
            SagaDefinition::builder("Simple")
                .step(StepDefinition::new("a", failing))
                .step(ok_step("b", "b_done"))
                .build()
                .unwrap(),
        );

        let ctx = orchestrator.execute("Simple", SagaData::new(), None).await.unwrap();
        assert_eq!(ctx.status, SagaStatus::Compensated);
        assert_eq!(ctx.steps[0].status, StepStatus::Failed);
        assert_eq!(ctx.steps[1].status, StepStatus::Pending);
        assert!(ctx.error.as_deref().unwrap().contains("out of stock"));
        assert!(!ctx.needs_remediation);
    }

    #[tokio::test]
    async fn test_resume_terminal_is_noop() {
        let (orchestrator, _) = setup();
        orchestrator.register(
            SagaDefinition::builder("Simple")
                .step(ok_step("a", "a_done"))
                .build()
                .unwrap(),
        );
        let ctx = orchestrator.execute("Simple", SagaData::new(), None).await.unwrap();
        let resumed = orchestrator.resume(ctx.saga_id, None).await.unwrap();
        assert_eq!(resumed, ctx);
    }

    #[tokio::test]
    async fn test_resume_unknown_saga() {
        let (orchestrator, _) = setup();
        let result = orchestrator.resume(SagaId::new(), None).await;
        assert!(matches!(result, Err(SagaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_compensations_requires_remediation() {
        let (orchestrator, _) = setup();
        orchestrator.register(
            SagaDefinition::builder("Simple")
                .step(ok_step("a", "a_done"))
                .build()
                .unwrap(),
        );
        let ctx = orchestrator.execute("Simple", SagaData::new(), None).await.unwrap();
        let result = orchestrator.retry_compensations(ctx.saga_id).await;
        assert!(matches!(
            result,
            Err(SagaError::InvalidState { actual: SagaStatus::Completed, .. })
        ));
    }

    #[test]
    fn test_saga_types_sorted() {
        let (orchestrator, _) = setup();
        for name in ["b", "a"] {
            orchestrator.register(
                SagaDefinition::builder(name)
                    .step(ok_step("s", "done"))
                    .build()
                    .unwrap(),
            );
        }
        assert_eq!(orchestrator.saga_types(), vec!["a", "b"]);
    }
}
