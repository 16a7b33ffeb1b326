//! expflow-ctl library interface
//!
//! Experiment flow controller: pulls block configuration from a local list or
//! the experiment server, gates each block behind an optional calibration,
//! and drives a trial runner through sessions, blocks and trials.

pub mod api;
pub mod block;
pub mod bridge;
pub mod calibration;
pub mod controller;
pub mod error;
pub mod fetcher;
pub mod runner;
pub mod source;

pub use crate::api::{ApiError, ApiResult};
pub use crate::block::{BlockConfig, NextBlock, SessionSummary};
pub use crate::controller::{
    AdvanceOutcome, CalibrationOutcome, CancelOutcome, ControllerOptions, ControllerStatus,
    FlowController,
};
pub use crate::error::FlowError;

use axum::Router;
use chrono::{DateTime, Utc};
use expflow_common::events::EventBus;
use runner::InMemoryRunner;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: FlowController,
    /// Runner driven by the operator trial endpoints
    pub runner: InMemoryRunner,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: FlowController, runner: InMemoryRunner) -> Self {
        let event_bus = controller.event_bus().clone();
        Self {
            controller,
            runner,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build the operator API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::flow_routes())
        .merge(api::runner_routes())
        .route("/events", axum::routing::get(api::event_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
