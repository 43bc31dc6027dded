//! HTTP routes for the agent control surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

use vault_common::Error;
use vault_ledger::{AccountSnapshot, Address};

use crate::breaker::{CircuitBreakerState, CircuitBreakerStats};
use crate::orchestrator::CycleReport;
use crate::records::RebalanceRecord;
use crate::scheduler::SchedulerState;
use crate::AgentState;

// ============================================================================
// Errors
// ============================================================================

/// Service error rendered as a JSON body with the matching status code.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(Error::Storage(format!("{err:#}")))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub agent: Address,
    pub scheduler: SchedulerState,
    pub schedule: String,
    pub next_run: Option<String>,
    pub cycle_running: bool,
    pub breaker: CircuitBreakerState,
    pub breaker_stats: CircuitBreakerStats,
    pub in_flight: usize,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub account: Address,
    pub records: Vec<RebalanceRecord>,
    pub count: usize,
}

// ============================================================================
// Route Handlers
// ============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "vault-agent".to_string(),
    })
}

pub async fn get_status(State(state): State<Arc<AgentState>>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        agent: orchestrator.agent().clone(),
        scheduler: state.scheduler.get_state().await,
        schedule: state.scheduler.expression().to_string(),
        next_run: state.scheduler.next_run().map(|t| t.to_rfc3339()),
        cycle_running: state.scheduler.is_cycle_running(),
        breaker: orchestrator.breaker_state(),
        breaker_stats: orchestrator.breaker_stats(),
        in_flight: orchestrator.leases().in_flight(),
        last_cycle: orchestrator.last_report().await,
    })
}

/// Run a cycle immediately and return its report.
pub async fn run_cycle(State(state): State<Arc<AgentState>>) -> Result<Json<CycleReport>, ApiError> {
    match state.scheduler.run_now().await {
        Some(report) => Ok(Json(report)),
        None => Err(Error::Conflict("a rebalance cycle is already running".into()).into()),
    }
}

pub async fn clear_breaker(
    State(state): State<Arc<AgentState>>,
) -> Result<Json<CircuitBreakerState>, ApiError> {
    state.orchestrator.clear_breaker()?;
    tracing::info!("Circuit breaker cleared via control surface");
    Ok(Json(state.orchestrator.breaker_state()))
}

pub async fn get_records(
    State(state): State<Arc<AgentState>>,
    Path(account): Path<String>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let account = Address::new(account);
    let records = state.orchestrator.records().records_for(&account)?;
    let count = records.len();
    Ok(Json(RecordsResponse {
        account,
        records,
        count,
    }))
}

pub async fn get_mirror(
    State(state): State<Arc<AgentState>>,
    Path(account): Path<String>,
) -> Result<Json<AccountSnapshot>, ApiError> {
    let account = Address::new(account);
    state
        .orchestrator
        .mirror()
        .snapshot(&account)
        .await
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("account {account} is not mirrored")).into())
}

/// Build the control surface router.
pub fn build_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/cycle", post(run_cycle))
        .route("/api/v1/breaker/clear", post(clear_breaker))
        .route("/api/v1/accounts/:account/records", get(get_records))
        .route("/api/v1/accounts/:account/mirror", get(get_mirror))
        .with_state(state)
}
