//! Saga and step state machines.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       ├──► Failed
///                       ├──► TimedOut ──┐
///                       └───────────────┴──► Compensating ──┬──► Compensated
///                                                           └──► Failed
/// Failed ──► Compensating   (remediation of failed compensations)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga has been created but not started.
    #[default]
    Pending,

    /// Saga steps are being executed.
    Running,

    /// The saga deadline passed before all steps ran.
    TimedOut,

    /// Completed steps are being compensated in reverse order.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// Every completed step was compensated (terminal state).
    Compensated,

    /// The saga could not complete and was not fully compensated (terminal state).
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true if the saga may move from this state to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Compensating)
                | (TimedOut, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
                | (Failed, Compensating)
        )
    }

    /// All terminal states.
    pub fn terminal() -> [SagaStatus; 3] {
        [
            SagaStatus::Completed,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ]
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Running => "RUNNING",
            SagaStatus::TimedOut => "TIMED_OUT",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a single step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if the step's effect may still be in place and needs undoing.
    pub fn needs_compensation(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Compensating | StepStatus::CompensationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensating => "COMPENSATING",
            StepStatus::Compensated => "COMPENSATED",
            StepStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
