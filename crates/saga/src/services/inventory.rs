//! Inventory collaborator: stock reservations and their release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use resilience::ClassifiedError;
use serde::{Deserialize, Serialize};

use super::{Behavior, FailureMode};

/// Result of a successful inventory reservation.
#[derive(Debug, Clone)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

/// External inventory system called by the reserve step.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves inventory for the given order items.
    async fn reserve(
        &self,
        order_id: &str,
        items: Vec<ReservationItem>,
    ) -> Result<ReservationResult, ClassifiedError>;

    /// Releases a previously made reservation. Releasing twice is harmless.
    async fn release(&self, reservation_id: &str) -> Result<(), ClassifiedError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (String, Vec<ReservationItem>)>,
    next_id: u32,
    reserve: Behavior,
    release: Behavior,
}

/// Inventory collaborator kept in memory, with injectable failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// An empty service that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reserve_failure(&self, mode: FailureMode) {
        self.state.write().reserve.set_mode(mode);
    }

    pub fn set_release_failure(&self, mode: FailureMode) {
        self.state.write().release.set_mode(mode);
    }

    pub fn set_reserve_latency(&self, latency: Duration) {
        self.state.write().reserve.set_latency(latency);
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.state.read().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state.read().reservations.contains_key(reservation_id)
    }

    /// Calls made to `reserve`, failed ones included.
    pub fn reserve_calls(&self) -> u32 {
        self.state.read().reserve.calls()
    }

    pub fn release_calls(&self) -> u32 {
        self.state.read().release.calls()
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: &str,
        items: Vec<ReservationItem>,
    ) -> Result<ReservationResult, ClassifiedError> {
        let latency = self.state.read().reserve.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write();
        state.reserve.admit("Insufficient stock")?;

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items));

        Ok(ReservationResult { reservation_id })
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ClassifiedError> {
        let mut state = self.state.write();
        state.release.admit("Reservation locked")?;
        state.reservations.remove(reservation_id);
        Ok(())
    }
}
