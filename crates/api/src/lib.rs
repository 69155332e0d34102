//! HTTP API server for the saga orchestrator.
//!
//! Starts, inspects and resumes order fulfillment sagas, exposes circuit
//! breaker and bulkhead statistics, and serves health and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::ResilienceRegistry;
use saga::order_fulfillment::{self, OrderServices};
use saga::services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InMemoryShippingService,
};
use saga::{SagaError, SagaOrchestrator};
use saga_store::{IdempotencyStore, InMemoryIdempotencyStore, InMemorySagaRepository, SagaRepository};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: SagaOrchestrator,
    pub registry: Arc<ResilienceRegistry>,
    pub services: DemoServices,
}

/// The in-process collaborators behind the order fulfillment saga.
#[derive(Clone, Default)]
pub struct DemoServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
    pub notification: InMemoryNotificationService,
}

impl DemoServices {
    fn order_services(&self) -> OrderServices {
        OrderServices {
            inventory: Arc::new(self.inventory.clone()),
            payment: Arc::new(self.payment.clone()),
            shipping: Arc::new(self.shipping.clone()),
            notification: Some(Arc::new(self.notification.clone())),
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::observability::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::observability::health))
        .route(
            "/sagas/order-fulfillment",
            post(routes::sagas::start_order_fulfillment),
        )
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/sagas/{id}/resume", post(routes::sagas::resume))
        .route(
            "/sagas/{id}/retry-compensations",
            post(routes::sagas::retry_compensations),
        )
        .route("/resilience", get(routes::resilience::snapshot))
        .route("/resilience/reset", post(routes::resilience::reset))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the application state over the given stores.
pub fn create_state(
    config: &Config,
    repository: Arc<dyn SagaRepository>,
    idempotency: Arc<dyn IdempotencyStore>,
) -> Result<Arc<AppState>, SagaError> {
    let registry = Arc::new(config.resilience_registry());
    let orchestrator = SagaOrchestrator::new(repository, idempotency, registry.clone())
        .with_config(config.orchestrator_config());

    let services = DemoServices::default();
    orchestrator.register(order_fulfillment::definition(
        services.order_services(),
        &config.fulfillment_options(),
    )?);

    Ok(Arc::new(AppState {
        orchestrator,
        registry,
        services,
    }))
}

/// Creates application state backed by in-memory stores.
pub fn create_default_state(config: &Config) -> Result<Arc<AppState>, SagaError> {
    create_state(
        config,
        Arc::new(InMemorySagaRepository::new()),
        Arc::new(InMemoryIdempotencyStore::new()),
    )
}
