//! Retry with exponential backoff, full jitter and an optional global retry budget.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{ClassifiedError, ErrorKind, ResilienceError, Result};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;
const DEFAULT_BUDGET_PER_SECOND: f64 = 10.0;
const DEFAULT_MAX_BUDGET: f64 = 100.0;

/// Custom retryability check, consulted in addition to the error's own tag.
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&ClassifiedError) -> bool + Send + Sync>);

impl std::fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, before jitter.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Draw the actual delay uniformly from `[0, computed]`.
    pub jitter: bool,
    /// Error kinds that are always retried.
    pub retry_on: HashSet<ErrorKind>,
    predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            retry_on: HashSet::from([ErrorKind::Connection, ErrorKind::Timeout]),
            predicate: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom attempt count and delays.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Adds a custom predicate, e.g. inspecting a status code.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ClassifiedError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(RetryPredicate(Arc::new(predicate)));
        self
    }

    /// Determine if an error should be retried.
    pub fn should_retry(&self, error: &ClassifiedError) -> bool {
        error.is_retryable()
            || self.retry_on.contains(&error.kind())
            || self.predicate.as_ref().is_some_and(|p| (p.0)(error))
    }

    /// Delay before attempt `attempt` (1-indexed) before jitter is applied.
    ///
    /// `min(base_delay * exponential_base^(attempt-1), max_delay)`; zero for the first attempt.
    pub fn computed_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Actual delay before attempt `attempt`, with full jitter when enabled.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let computed = self.computed_delay(attempt);
        if !self.jitter || computed.is_zero() {
            return computed;
        }
        let secs = rand::thread_rng().gen_range(0.0..=computed.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Token-bucket configuration for the global retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudgetConfig {
    pub budget_per_second: f64,
    pub max_budget: f64,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            budget_per_second: DEFAULT_BUDGET_PER_SECOND,
            max_budget: DEFAULT_MAX_BUDGET,
        }
    }
}

#[derive(Debug)]
struct BudgetState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide ceiling on retry volume, shared by every executor that holds it.
#[derive(Debug)]
pub struct RetryBudget {
    config: RetryBudgetConfig,
    state: Mutex<BudgetState>,
}

impl RetryBudget {
    /// Creates a full bucket.
    pub fn new(config: RetryBudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState {
                tokens: config.max_budget,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(state.last_refill).as_secs_f64() * self.config.budget_per_second;
        state.tokens = (state.tokens + refill).min(self.config.max_budget);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let state = self.state.lock();
        let refill = state.last_refill.elapsed().as_secs_f64() * self.config.budget_per_second;
        (state.tokens + refill).min(self.config.max_budget)
    }
}

/// Runs an async operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    budget: Option<Arc<RetryBudget>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            budget: None,
        }
    }

    /// Draws retries from a shared budget.
    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invokes `op` until it succeeds, fails with a non-retryable error, or runs out of attempts.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ClassifiedError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.policy.should_retry(&error) {
                return Err(ResilienceError::Failed(error));
            }

            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(ResilienceError::MaxRetriesExceeded {
                    attempts: attempt,
                    last_error: error,
                });
            }

            if let Some(budget) = &self.budget
                && !budget.try_acquire()
            {
                tracing::warn!(attempts = attempt, error = %error, "retry budget exhausted");
                return Err(ResilienceError::RetryBudgetExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            attempt += 1;
            let delay = self.policy.delay_before(attempt);
            metrics::counter!("retry_attempts_total").increment(1);
            tracing::debug!(attempt, ?delay, error = %error, "retrying after transient failure");
            tokio::time::sleep(delay).await;
        }
    }
}
