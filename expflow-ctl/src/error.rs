//! Error types for the flow controller
//!
//! Invalid transition requests (advance while a fetch is outstanding, cancel
//! outside a running block) are not errors: they come back as outcome values.
//! Only the cases below refuse an operation.

use crate::runner::RunnerError;
use crate::source::SourceError;
use thiserror::Error;

/// Flow controller errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// Session data disagrees with what the controller already holds, or is
    /// missing where the current state requires it
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Session parameters can no longer change
    #[error("Session already started")]
    SessionAlreadyStarted,

    /// The controller task has exited
    #[error("Flow controller stopped")]
    ControllerStopped,

    /// The block configurator produced no trials
    #[error("Block {0} has no trials")]
    EmptyBlock(String),

    /// The block configurator rejected the block config
    #[error("Block configuration failed: {0}")]
    Configure(String),

    #[error("Trial runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Unknown state name in an operator request
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl FlowError {
    /// True for errors that block forward progress until an operator intervenes
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, FlowError::ConsistencyViolation(_))
    }
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, FlowError>;
