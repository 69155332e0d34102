//! Saga start, inspection and recovery endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use saga::order_fulfillment::{OrderRequest, SAGA_TYPE};
use saga::{SagaContext, SagaData, SagaId, SagaStatus, StepRecord, StepStatus};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartOrderFulfillmentRequest {
    #[serde(flatten)]
    pub order: OrderRequest,
    /// Defaults to the order ID.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeParams {
    pub from_step: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub correlation_id: Option<String>,
    pub status: SagaStatus,
    pub current_step_index: usize,
    pub steps: Vec<StepResponse>,
    pub data: SagaData,
    pub error: Option<String>,
    pub timed_out: bool,
    pub needs_remediation: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl From<&StepRecord> for StepResponse {
    fn from(record: &StepRecord) -> Self {
        Self {
            name: record.name.clone(),
            status: record.status,
            attempts: record.attempts,
            error: record.error.clone(),
            executed_at: record.executed_at,
            compensated_at: record.compensated_at,
        }
    }
}

impl From<SagaContext> for SagaResponse {
    fn from(ctx: SagaContext) -> Self {
        Self {
            saga_id: ctx.saga_id.to_string(),
            steps: ctx.steps.iter().map(StepResponse::from).collect(),
            saga_type: ctx.saga_type,
            correlation_id: ctx.correlation_id,
            status: ctx.status,
            current_step_index: ctx.current_step_index,
            data: ctx.data,
            error: ctx.error,
            timed_out: ctx.timed_out,
            needs_remediation: ctx.needs_remediation,
            version: ctx.version.as_i64(),
            created_at: ctx.created_at,
            completed_at: ctx.completed_at,
        }
    }
}

// -- Handlers --

/// POST /sagas/order-fulfillment: runs an order fulfillment saga to a terminal state.
///
/// A second request with the same correlation ID returns the existing saga.
#[tracing::instrument(skip(state, req))]
pub async fn start_order_fulfillment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartOrderFulfillmentRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError> {
    validate(&req.order)?;
    tracing::info!(order_id = %req.order.order_id, "starting order fulfillment saga");
    let correlation_id = req
        .correlation_id
        .unwrap_or_else(|| req.order.order_id.clone());

    if let Some(existing) = state
        .orchestrator
        .find_by_correlation(&correlation_id)
        .await?
    {
        tracing::info!(saga_id = %existing.saga_id, "saga already exists for correlation id");
        return Ok((StatusCode::OK, Json(existing.into())));
    }

    metrics::counter!("api_sagas_started_total").increment(1);
    let ctx = state
        .orchestrator
        .execute(SAGA_TYPE, req.order.to_saga_data(), Some(correlation_id))
        .await?;

    Ok((StatusCode::CREATED, Json(ctx.into())))
}

/// GET /sagas/{id}: the persisted saga context.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let ctx = state
        .orchestrator
        .get(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(ctx.into()))
}

/// POST /sagas/{id}/resume: continues a stalled saga, optionally from an earlier step.
#[tracing::instrument(skip(state))]
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ResumeParams>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let ctx = state.orchestrator.resume(saga_id, params.from_step).await?;
    Ok(Json(ctx.into()))
}

/// POST /sagas/{id}/retry-compensations: re-runs failed compensations.
#[tracing::instrument(skip(state))]
pub async fn retry_compensations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let ctx = state.orchestrator.retry_compensations(saga_id).await?;
    Ok(Json(ctx.into()))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}

fn validate(order: &OrderRequest) -> Result<(), ApiError> {
    if order.order_id.trim().is_empty() {
        return Err(ApiError::BadRequest("order_id is required".into()));
    }
    if order.items.is_empty() {
        return Err(ApiError::BadRequest("at least one item is required".into()));
    }
    if let Some(item) = order.items.iter().find(|item| item.quantity == 0) {
        return Err(ApiError::BadRequest(format!(
            "quantity for {} must be positive",
            item.sku
        )));
    }
    if order.amount_cents <= 0 {
        return Err(ApiError::BadRequest("amount_cents must be positive".into()));
    }
    Ok(())
}
