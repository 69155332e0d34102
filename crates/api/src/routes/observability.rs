//! Health and Prometheus metrics endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::CircuitState;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub saga_types: Vec<String>,
    pub open_circuits: Vec<String>,
}

/// GET /health: reports `degraded` while any circuit is open.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let open_circuits: Vec<String> = state
        .registry
        .snapshot()
        .circuit_breakers
        .into_iter()
        .filter(|cb| cb.state == CircuitState::Open)
        .map(|cb| cb.name)
        .collect();

    Json(HealthResponse {
        status: if open_circuits.is_empty() { "ok" } else { "degraded" },
        saga_types: state.orchestrator.saga_types(),
        open_circuits,
    })
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
