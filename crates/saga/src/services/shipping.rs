//! Shipping collaborator: shipment creation and cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use resilience::ClassifiedError;

use super::{Behavior, FailureMode};

/// Result of a successful shipment creation.
#[derive(Debug, Clone)]
pub struct ShipmentResult {
    /// The tracking number assigned by the shipping service.
    pub tracking_number: String,
}

/// External carrier called by the shipment step.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order.
    async fn create_shipment(
        &self,
        order_id: &str,
        address: &str,
    ) -> Result<ShipmentResult, ClassifiedError>;

    /// Cancels a previously created shipment.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ClassifiedError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, (String, String)>,
    next_id: u32,
    create: Behavior,
    cancel: Behavior,
}

/// Shipping collaborator kept in memory, with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// An empty service that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_failure(&self, mode: FailureMode) {
        self.state.write().create.set_mode(mode);
    }

    pub fn set_cancel_failure(&self, mode: FailureMode) {
        self.state.write().cancel.set_mode(mode);
    }

    /// Returns the number of active shipments.
    pub fn shipment_count(&self) -> usize {
        self.state.read().shipments.len()
    }

    /// Returns true if a shipment exists with the given tracking number.
    pub fn has_shipment(&self, tracking_number: &str) -> bool {
        self.state.read().shipments.contains_key(tracking_number)
    }

    pub fn create_calls(&self) -> u32 {
        self.state.read().create.calls()
    }

    pub fn cancel_calls(&self) -> u32 {
        self.state.read().cancel.calls()
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(
        &self,
        order_id: &str,
        address: &str,
    ) -> Result<ShipmentResult, ClassifiedError> {
        let mut state = self.state.write();
        state.create.admit("Address not serviceable")?;

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:06}", state.next_id);
        state.shipments.insert(
            tracking_number.clone(),
            (order_id.to_string(), address.to_string()),
        );

        Ok(ShipmentResult { tracking_number })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ClassifiedError> {
        let mut state = self.state.write();
        state.cancel.admit("Shipment already dispatched")?;
        state.shipments.remove(tracking_number);
        Ok(())
    }
}
