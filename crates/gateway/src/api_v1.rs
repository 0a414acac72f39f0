//! HTTP API v1 — REST surface of the orchestrator.
//!
//! Endpoints:
//!
//! - `POST /v1/runs`                      — Create a run
//! - `GET  /v1/runs/{id}`                 — Run metadata and config
//! - `POST /v1/runs/{id}/step`            — Process one user message
//! - `POST /v1/runs/{id}/compress`        — Force a compression now
//! - `GET  /v1/runs/{id}/memory`          — STM tail, CWM, LTM, metrics
//! - `GET  /v1/runs/{id}/events`          — Ordered event log
//! - `GET  /v1/runs/{id}/snapshots/latest` — Latest snapshot
//! - `POST /v1/demo`                      — Run a scripted scenario
//!
//! Validation errors map to 400, unknown runs to 404, everything else to 500.

use axum::{
    Router,
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use distillery_agent::scenario::{self, Scenario};
use distillery_agent::{CompressOutcome, MemoryView, Orchestrator, StepOutcome};
use distillery_config::AppConfig;
use distillery_core::error::Error;
use distillery_core::event::Event;
use distillery_core::memory::Snapshot;
use distillery_core::run::{Run, RunConfig, RunId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub orchestrator: Arc<Orchestrator>,
    pub config: AppConfig,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl ApiV1State {
    pub fn new(orchestrator: Arc<Orchestrator>, config: AppConfig) -> Self {
        Self {
            orchestrator,
            config,
            start_time: chrono::Utc::now(),
        }
    }
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/runs", post(create_run_handler))
        .route("/runs/{id}", get(get_run_handler))
        .route("/runs/{id}/step", post(step_handler))
        .route("/runs/{id}/compress", post(compress_handler))
        .route("/runs/{id}/memory", get(memory_handler))
        .route("/runs/{id}/events", get(events_handler))
        .route("/runs/{id}/snapshots/latest", get(latest_snapshot_handler))
        .route("/demo", post(demo_handler))
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.into(),
        }),
    )
}

fn api_error(e: Error) -> ApiError {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::RunNotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            warn!(error = %e, code = e.code(), "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.code(), e.to_string())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "validation_error", e.body_text()))
}

// ── Runs ──────────────────────────────────────────────────────────────────

/// Run config fields supplied by a request.
pub type ConfigOverrides = serde_json::Map<String, serde_json::Value>;

/// Overlay request fields on the configured run defaults.
fn run_config(defaults: &RunConfig, overrides: Option<ConfigOverrides>) -> ApiResult<RunConfig> {
    let Some(overrides) = overrides else {
        return Ok(defaults.clone());
    };
    let mut merged = serde_json::to_value(defaults).map_err(|e| api_error(e.into()))?;
    if let serde_json::Value::Object(fields) = &mut merged {
        fields.extend(overrides);
    }
    serde_json::from_value(merged).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("invalid run config: {e}"),
        )
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub objective: String,
    /// Partial run config; omitted fields fall back to the configured run
    /// defaults.
    #[serde(default)]
    pub config: Option<ConfigOverrides>,
}

async fn create_run_handler(
    State(state): State<SharedApiState>,
    payload: Result<Json<CreateRunRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let request = body(payload)?;
    let config = run_config(&state.config.run_defaults, request.config)?;

    let run = state
        .orchestrator
        .create_run(&request.objective, config)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    state
        .orchestrator
        .get_run(&RunId(id))
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepRequest {
    pub user_message: String,
}

async fn step_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<Json<StepOutcome>> {
    let request = body(payload)?;
    state
        .orchestrator
        .step(&RunId(id), &request.user_message)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn compress_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CompressOutcome>> {
    state
        .orchestrator
        .force_compress(&RunId(id))
        .await
        .map(Json)
        .map_err(api_error)
}

async fn memory_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MemoryView>> {
    state
        .orchestrator
        .get_memory(&RunId(id))
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub run_id: RunId,
    pub events: Vec<Event>,
    pub count: usize,
}

async fn events_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventsResponse>> {
    let run_id = RunId(id);
    let events = state
        .orchestrator
        .get_events(&run_id)
        .await
        .map_err(api_error)?;
    Ok(Json(EventsResponse {
        run_id,
        count: events.len(),
        events,
    }))
}

async fn latest_snapshot_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Snapshot>> {
    state
        .orchestrator
        .get_latest_snapshot(&RunId(id))
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "snapshot_not_found",
                "no snapshot has been taken for this run yet",
            )
        })
}

// ── Demo ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DemoRequest {
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub scenario: Scenario,
    #[serde(default)]
    pub config: Option<ConfigOverrides>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DemoResponse {
    pub run_id: RunId,
    pub scenario: Scenario,
    pub steps: Vec<StepOutcome>,
    pub count: usize,
}

async fn demo_handler(
    State(state): State<SharedApiState>,
    payload: Result<Json<DemoRequest>, JsonRejection>,
) -> ApiResult<Json<DemoResponse>> {
    let request = body(payload)?;
    let objective = request
        .objective
        .unwrap_or_else(|| request.scenario.default_objective().to_string());
    let config = run_config(&state.config.run_defaults, request.config)?;

    let run = state
        .orchestrator
        .create_run(&objective, config)
        .await
        .map_err(api_error)?;
    info!(run_id = %run.id, scenario = request.scenario.as_str(), "Demo run started");

    let steps = scenario::run_scenario(&state.orchestrator, &run.id, request.scenario)
        .await
        .map_err(api_error)?;

    Ok(Json(DemoResponse {
        run_id: run.id,
        scenario: request.scenario,
        count: steps.len(),
        steps,
    }))
}
