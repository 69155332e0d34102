//! Payment collaborator: charges and refunds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use resilience::ClassifiedError;

use super::{Behavior, FailureMode};

/// Result of a successful payment charge.
#[derive(Debug, Clone)]
pub struct PaymentResult {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
}

/// External payment provider called by the payment step.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order.
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, ClassifiedError>;

    /// Refunds a previously made payment.
    async fn refund(&self, payment_id: &str) -> Result<(), ClassifiedError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (String, String, i64)>,
    next_id: u32,
    charge: Behavior,
    refund: Behavior,
}

/// Payment collaborator kept in memory, with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// An empty service that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_charge_failure(&self, mode: FailureMode) {
        self.state.write().charge.set_mode(mode);
    }

    pub fn set_refund_failure(&self, mode: FailureMode) {
        self.state.write().refund.set_mode(mode);
    }

    /// Returns the number of active payments.
    pub fn payment_count(&self) -> usize {
        self.state.read().payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.state.read().payments.contains_key(payment_id)
    }

    pub fn charge_calls(&self) -> u32 {
        self.state.read().charge.calls()
    }

    pub fn refund_calls(&self) -> u32 {
        self.state.read().refund.calls()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, ClassifiedError> {
        let mut state = self.state.write();
        state.charge.admit("Payment declined")?;

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            (order_id.to_string(), customer_id.to_string(), amount_cents),
        );

        Ok(PaymentResult { payment_id })
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ClassifiedError> {
        let mut state = self.state.write();
        state.refund.admit("Refund rejected")?;
        state.payments.remove(payment_id);
        Ok(())
    }
}
