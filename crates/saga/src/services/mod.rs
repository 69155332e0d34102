//! External service traits and in-memory implementations for saga steps.

pub mod inventory;
pub mod notification;
pub mod payment;
pub mod shipping;

use std::time::Duration;

use resilience::{ClassifiedError, ErrorKind};

pub use inventory::{
    InMemoryInventoryService, InventoryService, ReservationItem, ReservationResult,
};
pub use notification::{InMemoryNotificationService, NotificationResult, NotificationService};
pub use payment::{InMemoryPaymentService, PaymentResult, PaymentService};
pub use shipping::{InMemoryShippingService, ShipmentResult, ShippingService};

/// How an in-memory service answers its next calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    Healthy,
    /// Fail the next `n` calls with a retryable error, then recover.
    FailTransient(u32),
    /// Fail every call with a business error.
    FailPermanent,
}

/// Injected behavior of one operation of an in-memory service.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Behavior {
    mode: FailureMode,
    latency: Duration,
    calls: u32,
}

impl Behavior {
    pub(crate) fn set_mode(&mut self, mode: FailureMode) {
        self.mode = mode;
    }

    pub(crate) fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    pub(crate) fn latency(&self) -> Duration {
        self.latency
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls
    }

    /// Counts the call and decides whether it fails.
    pub(crate) fn admit(&mut self, reason: &str) -> Result<(), ClassifiedError> {
        self.calls += 1;
        match self.mode {
            FailureMode::Healthy => Ok(()),
            FailureMode::FailTransient(0) => {
                self.mode = FailureMode::Healthy;
                Ok(())
            }
            FailureMode::FailTransient(n) => {
                self.mode = if n == 1 {
                    FailureMode::Healthy
                } else {
                    FailureMode::FailTransient(n - 1)
                };
                Err(ClassifiedError::new(
                    ErrorKind::Unavailable,
                    format!("{reason}: service temporarily unavailable"),
                ))
            }
            FailureMode::FailPermanent => Err(ClassifiedError::permanent(reason.to_string())),
        }
    }
}
