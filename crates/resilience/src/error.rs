//! Error classification for external calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bulkhead::BulkheadTier;

/// Broad category of a failed external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Could not reach the dependency.
    Connection,
    /// The dependency did not answer in time.
    Timeout,
    /// The dependency asked us to slow down (429-equivalent).
    RateLimited,
    /// The dependency is temporarily unavailable (503-equivalent).
    Unavailable,
    /// The dependency failed internally (5xx-equivalent).
    Server,
    /// The dependency answered and refused the request.
    Business,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Returns true for kinds that are worth retrying by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::Unavailable
                | ErrorKind::Server
        )
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Server => "server",
            ErrorKind::Business => "business",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An external-call error, classified once at the boundary where it was captured.
///
/// The `retryable` tag is what the retry layer consults; it defaults from the kind
/// (or the status code) but can be overridden by the collaborator that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    retryable: bool,
}

impl ClassifiedError {
    /// Creates an error of the given kind, retryable if the kind is transient.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retryable: kind.is_transient(),
        }
    }

    /// Creates a retryable error of the given kind.
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_retryable(true)
    }

    /// Creates a non-retryable business error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    /// Classifies an error from an HTTP-like status code.
    ///
    /// 429, 500, 502, 503 and 504 are retryable; every other code is not.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::Unavailable,
            504 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Business,
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
            retryable: matches!(status, 429 | 500 | 502 | 503 | 504),
        }
    }

    /// Overrides the retryable tag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Errors surfaced by the resilience layers.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The call failed with an error that is not retried.
    #[error("call failed: {0}")]
    Failed(ClassifiedError),

    /// Every permitted attempt failed.
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        last_error: ClassifiedError,
    },

    /// A retry was wanted but the global retry budget had no tokens left.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        attempts: u32,
        last_error: ClassifiedError,
    },

    /// The circuit for the dependency is open.
    #[error("circuit '{name}' is open, retry in {time_until_recovery:?}")]
    CircuitOpen {
        name: String,
        time_until_recovery: Duration,
    },

    /// The bulkhead queue was full.
    #[error("bulkhead '{name}' ({tier}) is full")]
    BulkheadFull { name: String, tier: BulkheadTier },

    /// Waiting for a bulkhead permit took too long.
    #[error("timed out after {timeout:?} waiting for bulkhead '{name}'")]
    BulkheadTimeout { name: String, timeout: Duration },

    /// The call itself exceeded its time budget.
    #[error("call timed out after {after:?}")]
    Timeout { after: Duration },
}

impl ResilienceError {
    /// Returns the underlying classified error, if the call actually ran and failed.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            ResilienceError::Failed(e) => Some(e),
            ResilienceError::MaxRetriesExceeded { last_error, .. }
            | ResilienceError::RetryBudgetExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Returns true if this failure says something about the dependency's health.
    ///
    /// Business refusals mean the dependency answered, so they are not counted
    /// against it.
    pub fn is_dependency_failure(&self) -> bool {
        match self {
            ResilienceError::Failed(e) => e.kind() != ErrorKind::Business,
            ResilienceError::MaxRetriesExceeded { last_error, .. }
            | ResilienceError::RetryBudgetExhausted { last_error, .. } => {
                last_error.kind() != ErrorKind::Business
            }
            ResilienceError::Timeout { .. } => true,
            ResilienceError::CircuitOpen { .. }
            | ResilienceError::BulkheadFull { .. }
            | ResilienceError::BulkheadTimeout { .. } => false,
        }
    }

    /// Returns true if a later attempt at the same operation might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::Failed(e) => e.is_retryable(),
            _ => true,
        }
    }
}

impl From<ClassifiedError> for ResilienceError {
    fn from(err: ClassifiedError) -> Self {
        ResilienceError::Failed(err)
    }
}

/// Convenience type alias for resilience results.
pub type Result<T> = std::result::Result<T, ResilienceError>;
