//! Order fulfillment saga: reserve inventory → process payment → create shipment,
//! optionally followed by a confirmation message.

use std::sync::Arc;
use std::time::Duration;

use resilience::{BulkheadTier, ClassifiedError, RetryPolicy};
use saga_store::{SagaData, SagaId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::services::{
    InventoryService, NotificationService, PaymentService, ReservationItem, ShippingService,
};
use crate::step::{StepAction, StepDefinition, action_fn};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Process payment for the order.
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";

/// Step name: Create shipment for the order.
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

/// Step name: Tell the customer the order is on its way.
pub const STEP_SEND_CONFIRMATION: &str = "send_confirmation";

pub const DEPENDENCY_INVENTORY: &str = "inventory";
pub const DEPENDENCY_PAYMENT: &str = "payment";
pub const DEPENDENCY_SHIPPING: &str = "shipping";
pub const DEPENDENCY_NOTIFICATION: &str = "notification";

/// Input of an order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<ReservationItem>,
    pub amount_cents: i64,
    pub shipping_address: String,
}

impl OrderRequest {
    /// The initial saga data bag for this order.
    pub fn to_saga_data(&self) -> SagaData {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => SagaData::new(),
        }
    }
}

/// Collaborators used by the order fulfillment steps.
#[derive(Clone)]
pub struct OrderServices {
    pub inventory: Arc<dyn InventoryService>,
    pub payment: Arc<dyn PaymentService>,
    pub shipping: Arc<dyn ShippingService>,
    /// Adds the confirmation step when present.
    pub notification: Option<Arc<dyn NotificationService>>,
}

/// Timeouts and retries applied to every order fulfillment step.
#[derive(Debug, Clone)]
pub struct FulfillmentOptions {
    pub saga_timeout: Duration,
    pub step_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for FulfillmentOptions {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(5 * 60),
            step_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Builds the order fulfillment saga definition.
pub fn definition(services: OrderServices, options: &FulfillmentOptions) -> Result<SagaDefinition> {
    let step = |name: &str, action: Arc<dyn StepAction>, dependency: &str, tier: BulkheadTier| {
        StepDefinition::new(name, action)
            .with_dependency(dependency, tier)
            .with_timeout(options.step_timeout)
            .with_retry_policy(options.retry_policy.clone())
    };

    let inventory = services.inventory.clone();
    let reserve = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let inventory = inventory.clone();
        async move {
            let order_id: String = field(&data, "order_id")?;
            let items: Vec<ReservationItem> = field(&data, "items")?;
            let result = inventory.reserve(&order_id, items).await?;
            Ok::<_, ClassifiedError>(output("reservation_id", json!(result.reservation_id)))
        }
    });
    let inventory = services.inventory.clone();
    let release = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let inventory = inventory.clone();
        async move {
            let reservation_id: String = field(&data, "reservation_id")?;
            inventory.release(&reservation_id).await?;
            Ok::<_, ClassifiedError>(output("reservation_released", json!(true)))
        }
    });

    let payment = services.payment.clone();
    let charge = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let payment = payment.clone();
        async move {
            let order_id: String = field(&data, "order_id")?;
            let customer_id: String = field(&data, "customer_id")?;
            let amount_cents: i64 = field(&data, "amount_cents")?;
            let result = payment.charge(&order_id, &customer_id, amount_cents).await?;
            Ok::<_, ClassifiedError>(output("payment_id", json!(result.payment_id)))
        }
    });
    let payment = services.payment.clone();
    let refund = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let payment = payment.clone();
        async move {
            let payment_id: String = field(&data, "payment_id")?;
            payment.refund(&payment_id).await?;
            Ok::<_, ClassifiedError>(output("payment_refunded", json!(true)))
        }
    });

    let shipping = services.shipping.clone();
    let ship = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let shipping = shipping.clone();
        async move {
            let order_id: String = field(&data, "order_id")?;
            let address: String = field(&data, "shipping_address")?;
            let result = shipping.create_shipment(&order_id, &address).await?;
            Ok::<_, ClassifiedError>(output("tracking_number", json!(result.tracking_number)))
        }
    });
    let shipping = services.shipping.clone();
    let cancel = action_fn(move |_saga_id: SagaId, data: SagaData| {
        let shipping = shipping.clone();
        async move {
            let tracking_number: String = field(&data, "tracking_number")?;
            shipping.cancel_shipment(&tracking_number).await?;
            Ok::<_, ClassifiedError>(output("shipment_cancelled", json!(true)))
        }
    });

    let mut builder = SagaDefinition::builder(SAGA_TYPE)
        .timeout(options.saga_timeout)
        .step(
            step(STEP_RESERVE_INVENTORY, reserve, DEPENDENCY_INVENTORY, BulkheadTier::Standard)
                .with_compensation(release),
        )
        .step(
            step(STEP_PROCESS_PAYMENT, charge, DEPENDENCY_PAYMENT, BulkheadTier::Critical)
                .with_compensation(refund),
        )
        .step(
            step(STEP_CREATE_SHIPMENT, ship, DEPENDENCY_SHIPPING, BulkheadTier::Standard)
                .with_compensation(cancel),
        );

    if let Some(notification) = services.notification {
        let confirm = action_fn(move |_saga_id: SagaId, data: SagaData| {
            let notification = notification.clone();
            async move {
                let order_id: String = field(&data, "order_id")?;
                let customer_id: String = field(&data, "customer_id")?;
                let result = notification.send_confirmation(&order_id, &customer_id).await?;
                Ok::<_, ClassifiedError>(output("confirmation_id", json!(result.message_id)))
            }
        });
        builder = builder.step(step(
            STEP_SEND_CONFIRMATION,
            confirm,
            DEPENDENCY_NOTIFICATION,
            BulkheadTier::Optional,
        ));
    }

    builder.build()
}

/// Reads a required field from the saga data. Missing or malformed input is a
/// business error: retrying will not fix it.
fn field<T: DeserializeOwned>(data: &SagaData, key: &str) -> std::result::Result<T, ClassifiedError> {
    let value = data
        .get(key)
        .ok_or_else(|| ClassifiedError::permanent(format!("missing field '{key}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ClassifiedError::permanent(format!("invalid field '{key}': {e}")))
}

fn output(key: &str, value: serde_json::Value) -> SagaData {
    let mut data = SagaData::new();
    data.insert(key.to_string(), value);
    data
}
