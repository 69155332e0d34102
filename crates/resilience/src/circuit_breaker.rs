//! Circuit breaker guarding calls to one external dependency.
//!
//! State transitions:
//! ```text
//! Closed ──(consecutive failures >= failure_threshold
//!           or slow-call rate >= slow_call_rate_threshold)──► Open
//! Open ──(recovery_timeout elapsed since last failure, checked on next call)──► HalfOpen
//! HalfOpen ──(success_threshold consecutive successes)──► Closed
//! HalfOpen ──(any failure)──► Open
//! ```
//!
//! All state lives behind one mutex; the guarded call itself runs outside the lock.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{ResilienceError, Result};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SLIDING_WINDOW_SIZE: usize = 20;
const DEFAULT_SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);
const DEFAULT_SLOW_CALL_RATE_THRESHOLD: f64 = 0.5;
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Dependency assumed down, calls are rejected.
    Open,
    /// Trial calls test whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Succeeded, but took longer than `slow_call_threshold`.
    Slow,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time after the last failure before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Number of recent outcomes considered for the slow-call rate.
    pub sliding_window_size: usize,
    /// Calls slower than this are classified as slow.
    pub slow_call_threshold: Duration,
    /// Fraction of slow calls in a full window that trips the circuit.
    pub slow_call_rate_threshold: f64,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Time budget for a single guarded call, if any.
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            sliding_window_size: DEFAULT_SLIDING_WINDOW_SIZE,
            slow_call_threshold: DEFAULT_SLOW_CALL_THRESHOLD,
            slow_call_rate_threshold: DEFAULT_SLOW_CALL_RATE_THRESHOLD,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            ..Self::default()
        }
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_sliding_window(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn with_slow_calls(mut self, threshold: Duration, rate: f64) -> Self {
        self.slow_call_threshold = threshold;
        self.slow_call_rate_threshold = rate;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Point-in-time view of a breaker, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window: Vec<CallOutcome>,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window: VecDeque<CallOutcome>,
    last_failure_at: Option<Instant>,
    half_open_in_flight: u32,
    total_calls: u64,
    failed_calls: u64,
    slow_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window: VecDeque::new(),
            last_failure_at: None,
            half_open_in_flight: 0,
            total_calls: 0,
            failed_calls: 0,
            slow_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// Circuit breaker for a single named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Releases a half-open trial slot if the call is dropped before its outcome is recorded.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with custom config.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the lazy Open → HalfOpen check.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Runs `f` through the breaker.
    ///
    /// While open, fails with [`ResilienceError::CircuitOpen`] without invoking `f`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let trial = self.admit()?;
        let mut slot = TrialSlot {
            breaker: self,
            armed: trial,
        };

        let started = Instant::now();
        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(ResilienceError::Timeout { after: limit }),
            },
            None => f().await.map_err(Into::into),
        };
        let slow = started.elapsed() > self.config.slow_call_threshold;

        let outcome = match &result {
            Err(e) if e.is_dependency_failure() => CallOutcome::Failure,
            _ if slow => CallOutcome::Slow,
            _ => CallOutcome::Success,
        };

        slot.armed = false;
        self.record(outcome, trial);
        result
    }

    /// Decides whether a call may proceed. Returns true for a half-open trial call.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let since_failure = inner
                .last_failure_at
                .map(|at| at.elapsed())
                .unwrap_or(self.config.recovery_timeout);
            if since_failure >= self.config.recovery_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                inner.rejected_calls += 1;
                metrics::counter!("circuit_breaker_rejections_total", "name" => self.name.clone())
                    .increment(1);
                return Err(ResilienceError::CircuitOpen {
                    name: self.name.clone(),
                    time_until_recovery: self.config.recovery_timeout - since_failure,
                });
            }
        }

        inner.total_calls += 1;
        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                inner.total_calls -= 1;
                inner.rejected_calls += 1;
                return Err(ResilienceError::CircuitOpen {
                    name: self.name.clone(),
                    time_until_recovery: Duration::ZERO,
                });
            }
            inner.half_open_in_flight += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn record(&self, outcome: CallOutcome, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match outcome {
            CallOutcome::Failure => {
                inner.failed_calls += 1;
                inner.last_failure_at = Some(Instant::now());
            }
            CallOutcome::Slow => inner.slow_calls += 1,
            CallOutcome::Success => {}
        }

        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, outcome);
                if outcome == CallOutcome::Failure {
                    inner.consecutive_failures += 1;
                    inner.consecutive_successes = 0;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open);
                    }
                } else {
                    inner.consecutive_failures = 0;
                    if self.slow_rate_exceeded(&inner) {
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if outcome == CallOutcome::Failure {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Late outcome from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerState, outcome: CallOutcome) {
        inner.window.push_back(outcome);
        while inner.window.len() > self.config.sliding_window_size.max(1) {
            inner.window.pop_front();
        }
    }

    fn slow_rate_exceeded(&self, inner: &BreakerState) -> bool {
        let size = self.config.sliding_window_size.max(1);
        if inner.window.len() < size {
            return false;
        }
        let slow = inner
            .window
            .iter()
            .filter(|o| **o == CallOutcome::Slow)
            .count();
        (slow as f64 / size as f64) >= self.config.slow_call_rate_threshold
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.window.clear();
        if to != CircuitState::HalfOpen {
            inner.half_open_in_flight = 0;
        }
        if to == CircuitState::Open {
            // Slow-call trips have no fresh failure; the cool-down starts now either way.
            inner.last_failure_at = Some(Instant::now());
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "name" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, %from, "circuit opened");
            }
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit state changed"),
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_at = None;
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            window: inner.window.iter().copied().collect(),
            total_calls: inner.total_calls,
            failed_calls: inner.failed_calls,
            slow_calls: inner.slow_calls,
            rejected_calls: inner.rejected_calls,
        }
    }
}
