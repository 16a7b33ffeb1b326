//! HTTP request handlers
//!
//! Invalid transitions (advance while a fetch is outstanding, cancel outside
//! a block) answer 200 with the outcome body; only refused operations are
//! errors.

use super::{ApiError, ApiResult};
use crate::controller::{AdvanceOutcome, CalibrationOutcome, CancelOutcome, ControllerStatus};
use crate::error::FlowError;
use crate::runner::{TrialHandle, TrialRunner};
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{sse::Event, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use expflow_common::ControllerState;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use tracing::info;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub state: ControllerState,
}

#[derive(Debug, Deserialize)]
pub struct CalibrationCompleteRequest {
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
pub struct GoalRequest {
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct GoalResponse {
    pub target: ControllerState,
}

#[derive(Debug, Serialize)]
pub struct TrialResponse {
    pub trial_number: u32,
    pub block_number: u32,
}

impl From<TrialHandle> for TrialResponse {
    fn from(trial: TrialHandle) -> Self {
        Self {
            trial_number: trial.number,
            block_number: trial.block_number,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    Json(HealthResponse {
        status: "ok".to_string(),
        module: "expflow-ctl".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        state: state.controller.state(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

// ============================================================================
// Flow control
// ============================================================================

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<ControllerStatus>> {
    Ok(Json(state.controller.status().await?))
}

/// POST /advance
pub async fn advance(State(state): State<AppState>) -> ApiResult<Json<AdvanceOutcome>> {
    Ok(Json(state.controller.advance().await?))
}

/// POST /cancel
pub async fn cancel(State(state): State<AppState>) -> ApiResult<Json<CancelOutcome>> {
    Ok(Json(state.controller.cancel().await?))
}

/// POST /calibration/complete
pub async fn calibration_complete(
    State(state): State<AppState>,
    Json(request): Json<CalibrationCompleteRequest>,
) -> ApiResult<Json<CalibrationOutcome>> {
    Ok(Json(
        state
            .controller
            .calibration_complete(request.parameters)
            .await?,
    ))
}

/// POST /goal
///
/// Arms a goal and returns immediately; the resolution is broadcast as a
/// `GoalResolved` event.
pub async fn set_goal(
    State(state): State<AppState>,
    Json(request): Json<GoalRequest>,
) -> ApiResult<(StatusCode, Json<GoalResponse>)> {
    let target: ControllerState = request
        .state
        .parse()
        .map_err(|e: expflow_common::Error| FlowError::InvalidState(e.to_string()))?;

    state.controller.move_to_state(target, move |result| {
        info!(target = %target, ?result, "Operator goal resolved");
    })?;
    Ok((StatusCode::ACCEPTED, Json(GoalResponse { target })))
}

pub fn flow_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/advance", post(advance))
        .route("/cancel", post(cancel))
        .route("/calibration/complete", post(calibration_complete))
        .route("/goal", post(set_goal))
}

// ============================================================================
// In-memory runner
// ============================================================================

/// POST /runner/next-trial
pub async fn next_trial(State(state): State<AppState>) -> ApiResult<Json<TrialResponse>> {
    let trial = state.runner.begin_next_trial().map_err(ApiError::from)?;
    Ok(Json(trial.into()))
}

/// POST /runner/end-trial
pub async fn end_trial(State(state): State<AppState>) -> ApiResult<Json<TrialResponse>> {
    let trial = state.runner.end_current_trial().map_err(ApiError::from)?;
    Ok(Json(trial.into()))
}

pub fn runner_routes() -> Router<AppState> {
    Router::new()
        .route("/runner/next-trial", post(next_trial))
        .route("/runner/end-trial", post(end_trial))
}

// ============================================================================
// Events
// ============================================================================

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    expflow_common::sse::flow_event_stream(&state.event_bus)
}
