//! Saga context: the persisted state of one saga execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{SagaStatus, StepStatus};
use crate::{SagaData, SagaId};

/// Version number for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a context that was never saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Progress of one step within one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    /// Real invocations of the step's action, across runs.
    pub attempts: u32,
    pub executed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
    /// Output of the step's action.
    pub result: Option<SagaData>,
    /// Last failure reason, forward or compensating.
    pub error: Option<String>,
    /// Key under which the forward result is cached.
    pub idempotency_key: Option<String>,
}

impl StepRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            attempts: 0,
            executed_at: None,
            compensated_at: None,
            result: None,
            error: None,
            idempotency_key: None,
        }
    }
}

/// The persisted state of a saga execution.
///
/// Created by the orchestrator, mutated only by it, and saved after every
/// step-status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// Business key used to find the saga from the outside (e.g. an order ID).
    pub correlation_id: Option<String>,
    pub data: SagaData,
    pub status: SagaStatus,
    pub steps: Vec<StepRecord>,
    /// Index of the next step to run.
    pub current_step_index: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Absolute deadline, checked before each step.
    pub timeout_at: Option<DateTime<Utc>>,
    pub version: Version,
    /// Saga-level failure reason.
    pub error: Option<String>,
    pub timed_out: bool,
    /// Some effects could not be undone and need out-of-band handling.
    pub needs_remediation: bool,
}

impl SagaContext {
    /// Creates a pending context with one record per step.
    pub fn new<I, S>(saga_type: impl Into<String>, step_names: I, data: SagaData) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            saga_id: SagaId::new(),
            saga_type: saga_type.into(),
            correlation_id: None,
            data,
            status: SagaStatus::Pending,
            steps: step_names.into_iter().map(StepRecord::new).collect(),
            current_step_index: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_at: None,
            version: Version::initial(),
            error: None,
            timed_out: false,
            needs_remediation: false,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the deadline relative to the creation time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| self.created_at.checked_add_signed(d));
        self
    }

    /// Returns true if the saga deadline has passed.
    pub fn is_deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|deadline| now >= deadline)
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.timeout_at
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Names of the steps currently in `Completed` state, in order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Moves to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, next: SagaStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}
