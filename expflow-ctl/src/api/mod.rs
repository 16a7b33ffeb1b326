//! Operator HTTP API
//!
//! REST endpoints for stepping the flow controller by hand, plus an SSE
//! stream of every flow event.

mod error;
pub mod handlers;

pub use error::{ApiError, ApiResult};
pub use handlers::{event_stream, flow_routes, health_routes, runner_routes};
