//! # Experiment Flow Common Library
//!
//! Shared code for the experiment flow controller and its tooling:
//! - Controller state enumeration
//! - Event types (FlowEvent enum) and the broadcast EventBus
//! - TOML configuration loading
//! - SSE helpers
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod events;
pub mod sse;
pub mod state;
pub mod time;

pub use error::{Error, Result};
pub use state::ControllerState;
