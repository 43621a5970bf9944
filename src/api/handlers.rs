// HTTP handlers - a thin projection of engine operations

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;
use tracing::{debug, info};

use super::auth::{ApiAuth, Caller};
use super::types::{
    ApiError, ExecuteQuery, ExecuteRequest, ExecutionsQuery, HealthResponse,
    DEFAULT_EXECUTIONS_LIMIT,
};
use crate::engine::{CircuitEngine, CircuitMetrics};
use crate::models::{CircuitDefinition, CircuitSummary, ExecutionRecord, HistoryFilter, TriggerEvent};
use crate::CircuitError;

/// Shared application state for the API
#[derive(Clone)]
pub struct ApiState {
    pub engine: CircuitEngine,
    pub metrics: Option<CircuitMetrics>,
    pub auth: Arc<ApiAuth>,
}

impl ApiState {
    pub fn new(engine: CircuitEngine) -> Self {
        Self {
            engine,
            metrics: None,
            auth: Arc::new(ApiAuth::open()),
        }
    }
}

/// Register a circuit - POST /circuits
pub async fn create_circuit(
    State(state): State<ApiState>,
    _caller: Caller,
    definition: Result<Json<CircuitDefinition>, JsonRejection>,
) -> Result<(StatusCode, Json<CircuitSummary>), ApiError> {
    let Json(definition) = definition.map_err(ApiError::definition)?;
    debug!(circuit = %definition.name, version = definition.version, "registering circuit");

    let summary = state.engine.register_definition(&definition).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// List registered circuits - GET /circuits
pub async fn list_circuits(
    State(state): State<ApiState>,
    _caller: Caller,
) -> Json<Vec<CircuitSummary>> {
    Json(state.engine.list_circuits().await)
}

/// Run one circuit by name - POST /circuits/:name/execute
pub async fn execute_circuit(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<ExecuteQuery>, QueryRejection>,
    caller: Caller,
    request: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let Query(query) = query.map_err(ApiError::query)?;
    let Json(request) = request.map_err(ApiError::json)?;
    let event = caller.apply(request.into_event());

    let record = state.engine.execute(&name, query.version, event).await?;
    info!(
        circuit = %record.circuit,
        correlation_id = %record.correlation_id,
        status = %record.status,
        "executed circuit"
    );
    Ok(Json(vec![record]))
}

/// Dispatch an event to every matching circuit - POST /events
pub async fn dispatch_event(
    State(state): State<ApiState>,
    caller: Caller,
    event: Result<Json<TriggerEvent>, JsonRejection>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let Json(event) = event.map_err(ApiError::json)?;
    let event = caller.apply(event);

    let records = state.engine.dispatch(event).await;
    debug!(runs = records.len(), "event dispatched");
    Ok(Json(records))
}

/// Filtered history slice - GET /executions
pub async fn list_executions(
    State(state): State<ApiState>,
    _caller: Caller,
    query: Result<Query<ExecutionsQuery>, QueryRejection>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let Query(query) = query.map_err(ApiError::query)?;
    let filter = HistoryFilter {
        circuit_name: query.circuit_name,
        status: query.status,
    };
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTIONS_LIMIT);
    Ok(Json(state.engine.history(limit, &filter).await))
}

/// Health check endpoint - GET /health
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "circuit-script".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        circuits: state.engine.list_circuits().await.len(),
        executions: state.engine.history_len().await,
    })
}

/// Prometheus exposition - GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let metrics = state
        .metrics
        .as_ref()
        .ok_or_else(|| CircuitError::NotFound("metrics are disabled".into()))?;
    let body = metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response())
}

/// Error handler for invalid routes
pub async fn not_found() -> ApiError {
    ApiError(CircuitError::NotFound("no such route".into()))
}
