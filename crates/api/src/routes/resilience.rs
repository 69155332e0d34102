//! Circuit breaker and bulkhead statistics.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use resilience::RegistrySnapshot;

use crate::AppState;

/// GET /resilience: state and counters of every breaker and bulkhead.
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Json<RegistrySnapshot> {
    Json(state.registry.snapshot())
}

/// POST /resilience/reset: closes every circuit breaker.
pub async fn reset(State(state): State<Arc<AppState>>) -> StatusCode {
    state.registry.reset_breakers();
    tracing::info!("circuit breakers reset");
    StatusCode::NO_CONTENT
}
