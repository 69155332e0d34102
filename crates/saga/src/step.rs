//! Step actions and the idempotent step executor.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::merge_data;
use futures_util::future::try_join_all;
use resilience::{
    Bulkhead, BulkheadTier, CircuitBreaker, ClassifiedError, ResilienceError, ResilienceRegistry,
    RetryExecutor, RetryPolicy,
};
use saga_store::{IdempotencyRecord, IdempotencyStore, SagaData, SagaId};

use crate::idempotency::{LocalCache, compensation_key, idempotency_key};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COMPENSATION_MAX_ATTEMPTS: u32 = 5;

/// Capability to perform one external operation on behalf of a saga.
///
/// Implementations classify their own failures: the `retryable` tag on the
/// returned [`ClassifiedError`] decides whether the call is retried.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn invoke(&self, saga_id: SagaId, data: &SagaData) -> Result<SagaData, ClassifiedError>;
}

/// Adapts an async closure into a [`StepAction`].
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(SagaId, SagaData) -> Fut + Send + Sync,
    Fut: Future<Output = Result<SagaData, ClassifiedError>> + Send,
{
    async fn invoke(&self, saga_id: SagaId, data: &SagaData) -> Result<SagaData, ClassifiedError> {
        (self.0)(saga_id, data.clone()).await
    }
}

/// Wraps an async closure as a shareable step action.
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(SagaId, SagaData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SagaData, ClassifiedError>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Runs several actions concurrently inside one step.
///
/// Fails as soon as any sub-call fails. Outputs are merged in declaration order,
/// so a later action's field wins over an earlier one's.
pub struct ParallelAction {
    actions: Vec<Arc<dyn StepAction>>,
}

impl ParallelAction {
    pub fn new(actions: Vec<Arc<dyn StepAction>>) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl StepAction for ParallelAction {
    async fn invoke(&self, saga_id: SagaId, data: &SagaData) -> Result<SagaData, ClassifiedError> {
        let outputs =
            try_join_all(self.actions.iter().map(|action| action.invoke(saga_id, data))).await?;
        let mut merged = SagaData::new();
        for output in outputs {
            merge_data(&mut merged, output);
        }
        Ok(merged)
    }
}

/// One step of a saga definition.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub action: Arc<dyn StepAction>,
    pub compensation: Option<Arc<dyn StepAction>>,
    pub timeout: Duration,
    /// Cache results under a deterministic key so re-execution makes no new call.
    pub idempotent: bool,
    /// Breaker and bulkhead name. Defaults to the step name.
    pub dependency: String,
    pub tier: BulkheadTier,
    pub retry_policy: RetryPolicy,
    pub compensation_max_attempts: u32,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        let name = name.into();
        Self {
            dependency: name.clone(),
            name,
            action,
            compensation: None,
            timeout: DEFAULT_STEP_TIMEOUT,
            idempotent: true,
            tier: BulkheadTier::default(),
            retry_policy: RetryPolicy::default(),
            compensation_max_attempts: DEFAULT_COMPENSATION_MAX_ATTEMPTS,
        }
    }

    pub fn with_compensation(mut self, compensation: Arc<dyn StepAction>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Routes the step through the breaker and bulkhead of `dependency`.
    pub fn with_dependency(mut self, dependency: impl Into<String>, tier: BulkheadTier) -> Self {
        self.dependency = dependency.into();
        self.tier = tier;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_compensation_max_attempts(mut self, attempts: u32) -> Self {
        self.compensation_max_attempts = attempts.max(1);
        self
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("dependency", &self.dependency)
            .field("tier", &self.tier)
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotent)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

/// Outcome of one step (or compensation) execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub idempotency_key: String,
    /// Served from the idempotency cache; no external call was made.
    pub was_cached: bool,
    /// Real invocations of the action during this execution.
    pub attempts: u32,
    pub duration: Duration,
    pub outcome: Result<SagaData, ResilienceError>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&ResilienceError> {
        self.outcome.as_ref().err()
    }
}

/// A step action wrapped in Bulkhead → CircuitBreaker → RetryExecutor, with a
/// result cache keyed by a deterministic idempotency key.
pub struct IdempotentStep {
    definition: StepDefinition,
    store: Arc<dyn IdempotencyStore>,
    cache: Arc<LocalCache>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Arc<Bulkhead>,
    retry: RetryExecutor,
    compensation_retry: RetryExecutor,
    ttl: Duration,
}

impl IdempotentStep {
    pub fn new(
        definition: StepDefinition,
        registry: &ResilienceRegistry,
        store: Arc<dyn IdempotencyStore>,
        cache: Arc<LocalCache>,
        ttl: Duration,
    ) -> Self {
        let breaker = registry.circuit_breaker(&definition.dependency);
        let bulkhead = registry.bulkhead(&definition.dependency, definition.tier);
        let retry = registry.retry_executor(definition.retry_policy.clone());
        let compensation_retry = registry.retry_executor(
            definition
                .retry_policy
                .clone()
                .with_max_attempts(definition.compensation_max_attempts),
        );
        Self {
            definition,
            store,
            cache,
            breaker,
            bulkhead,
            retry,
            compensation_retry,
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    pub fn has_compensation(&self) -> bool {
        self.definition.compensation.is_some()
    }

    /// The forward idempotency key for this step given the saga's current data.
    pub fn key_for(&self, saga_id: SagaId, data: &SagaData) -> String {
        idempotency_key(saga_id, &self.definition.name, data)
    }

    /// Runs the action, or returns the cached result of an earlier run.
    ///
    /// `timeout` bounds the bulkhead wait plus the call itself. Failures are not
    /// cached, so a later run retries the real operation.
    pub async fn execute(
        &self,
        saga_id: SagaId,
        data: &SagaData,
        timeout: Duration,
    ) -> saga_store::Result<StepResult> {
        let key = self.key_for(saga_id, data);
        self.execute_keyed(saga_id, data, key, timeout).await
    }

    /// Like [`Self::execute`], with a key computed earlier (e.g. before a crash).
    pub async fn execute_keyed(
        &self,
        saga_id: SagaId,
        data: &SagaData,
        key: String,
        timeout: Duration,
    ) -> saga_store::Result<StepResult> {
        let action = self.definition.action.clone();
        self.run(saga_id, data, key, action.as_ref(), &self.retry, timeout)
            .await
    }

    /// Runs the compensation for a forward execution cached under `forward_key`.
    ///
    /// Uses the `comp:` key namespace and the bounded compensation retry policy.
    /// A step without compensation succeeds with an empty output.
    pub async fn compensate(
        &self,
        saga_id: SagaId,
        data: &SagaData,
        forward_key: &str,
    ) -> saga_store::Result<StepResult> {
        let key = compensation_key(forward_key);
        let Some(compensation) = self.definition.compensation.clone() else {
            return Ok(StepResult {
                step_name: self.definition.name.clone(),
                idempotency_key: key,
                was_cached: false,
                attempts: 0,
                duration: Duration::ZERO,
                outcome: Ok(SagaData::new()),
            });
        };
        self.run(
            saga_id,
            data,
            key,
            compensation.as_ref(),
            &self.compensation_retry,
            self.definition.timeout,
        )
        .await
    }

    /// Drops the cached result for `key` locally and remotely.
    pub async fn evict(&self, key: &str) -> saga_store::Result<bool> {
        let local = self.cache.remove(key);
        let remote = self.store.remove(key).await?;
        Ok(local || remote)
    }

    async fn run(
        &self,
        saga_id: SagaId,
        data: &SagaData,
        key: String,
        action: &dyn StepAction,
        retry: &RetryExecutor,
        timeout: Duration,
    ) -> saga_store::Result<StepResult> {
        let started = Instant::now();
        let step_name = self.definition.name.clone();

        if self.definition.idempotent
            && let Some(record) = self.lookup(&key).await?
        {
            metrics::counter!("saga_step_cache_hits_total", "step" => step_name.clone())
                .increment(1);
            tracing::debug!(step = %step_name, %saga_id, "step result served from idempotency cache");
            return Ok(StepResult {
                step_name,
                idempotency_key: key,
                was_cached: true,
                attempts: 0,
                duration: started.elapsed(),
                outcome: Ok(record.result),
            });
        }

        let (outcome, attempts) = self.guarded(action, retry, saga_id, data, timeout).await;

        if self.definition.idempotent
            && let Ok(output) = &outcome
        {
            self.remember(&key, output.clone()).await?;
        }

        Ok(StepResult {
            step_name,
            idempotency_key: key,
            was_cached: false,
            attempts,
            duration: started.elapsed(),
            outcome,
        })
    }

    async fn guarded(
        &self,
        action: &dyn StepAction,
        retry: &RetryExecutor,
        saga_id: SagaId,
        data: &SagaData,
        timeout: Duration,
    ) -> (Result<SagaData, ResilienceError>, u32) {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let breaker = &self.breaker;

        let result = self
            .bulkhead
            .execute(
                move || {
                    breaker.call(move || {
                        retry.execute(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                            action.invoke(saga_id, data)
                        })
                    })
                },
                Some(timeout),
            )
            .await;

        let outcome = match result {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(ResilienceError::BulkheadFull {
                name: self.bulkhead.name().to_string(),
                tier: self.bulkhead.tier(),
            }),
            Err(e) => Err(e),
        };
        (outcome, attempts.load(Ordering::Relaxed))
    }

    async fn lookup(&self, key: &str) -> saga_store::Result<Option<IdempotencyRecord>> {
        if let Some(record) = self.cache.get(key) {
            return Ok(Some(record));
        }
        let record = self.store.get(key).await?;
        if let Some(record) = &record {
            self.cache.insert(record.clone());
        }
        Ok(record)
    }

    async fn remember(&self, key: &str, output: SagaData) -> saga_store::Result<()> {
        self.store.set(key, output.clone(), self.ttl).await?;
        self.cache
            .insert(IdempotencyRecord::new(key, output, self.ttl));
        Ok(())
    }
}
