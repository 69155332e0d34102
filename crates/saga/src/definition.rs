//! Saga definitions: an ordered, validated list of steps.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Result, SagaError};
use crate::step::StepDefinition;

const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An ordered list of steps identified by a saga type.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<StepDefinition>,
    timeout: Duration,
    pivot: Option<usize>,
}

impl SagaDefinition {
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            saga_type: saga_type.into(),
            steps: Vec::new(),
            timeout: DEFAULT_SAGA_TIMEOUT,
            pivot: None,
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Overall deadline, measured from saga creation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Index of the pivot step. Once it completes, steps up to and including it
    /// are never compensated.
    pub fn pivot(&self) -> Option<usize> {
        self.pivot
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    saga_type: String,
    steps: Vec<StepDefinition>,
    timeout: Duration,
    pivot: Option<String>,
}

impl SagaDefinitionBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pivot(mut self, step_name: impl Into<String>) -> Self {
        self.pivot = Some(step_name.into());
        self
    }

    /// Validates the definition: at least one step, unique step names, and a
    /// pivot that names one of the steps.
    pub fn build(self) -> Result<SagaDefinition> {
        if self.saga_type.is_empty() {
            return Err(SagaError::InvalidDefinition("saga type is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{}' has no steps",
                self.saga_type
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate step name '{}' in saga '{}'",
                    step.name, self.saga_type
                )));
            }
        }

        let pivot = match &self.pivot {
            Some(name) => Some(
                self.steps
                    .iter()
                    .position(|s| &s.name == name)
                    .ok_or_else(|| {
                        SagaError::InvalidDefinition(format!("pivot step '{name}' not found"))
                    })?,
            ),
            None => None,
        };

        Ok(SagaDefinition {
            saga_type: self.saga_type,
            steps: self.steps,
            timeout: self.timeout,
            pivot,
        })
    }
}
