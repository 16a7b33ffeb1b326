//! Controller state enumeration
//!
//! Shared between the controller, its HTTP surface and any client that
//! deserializes [`crate::events::FlowEvent`] values.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Experiment flow controller state
///
/// Exactly one state is current at any time. Only the controller moves
/// between states; everything else observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// Initial state, no session has begun
    Uninitialized,
    /// Session began, waiting for the session summary
    AwaitingInitialization,
    /// Waiting for the next block configuration to arrive
    AwaitingBlockConfig,
    /// Block configuration cached, calibration (if any) not yet run
    ReadyForCalibration,
    /// Calibration callback invoked, waiting for its completion signal
    Calibrating,
    /// Calibration done or skipped; the block can begin
    ReadyForBlockBegin,
    /// The runner is executing the block
    BlockBegan,
    /// The block ended normally
    BlockEnded,
    /// The block ended after a cancel request
    BlockCancelled,
    /// The runner ended the session (terminal)
    SessionEnded,
}

impl ControllerState {
    /// All states, in lifecycle order
    pub const ALL: [ControllerState; 10] = [
        ControllerState::Uninitialized,
        ControllerState::AwaitingInitialization,
        ControllerState::AwaitingBlockConfig,
        ControllerState::ReadyForCalibration,
        ControllerState::Calibrating,
        ControllerState::ReadyForBlockBegin,
        ControllerState::BlockBegan,
        ControllerState::BlockEnded,
        ControllerState::BlockCancelled,
        ControllerState::SessionEnded,
    ];

    /// Stable name used in logs, events and the HTTP API
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Uninitialized => "Uninitialized",
            ControllerState::AwaitingInitialization => "AwaitingInitialization",
            ControllerState::AwaitingBlockConfig => "AwaitingBlockConfig",
            ControllerState::ReadyForCalibration => "ReadyForCalibration",
            ControllerState::Calibrating => "Calibrating",
            ControllerState::ReadyForBlockBegin => "ReadyForBlockBegin",
            ControllerState::BlockBegan => "BlockBegan",
            ControllerState::BlockEnded => "BlockEnded",
            ControllerState::BlockCancelled => "BlockCancelled",
            ControllerState::SessionEnded => "SessionEnded",
        }
    }

    /// Whether this is the terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::SessionEnded)
    }

    /// Whether the controller is blocked on an outstanding fetch
    pub fn is_awaiting_fetch(&self) -> bool {
        matches!(
            self,
            ControllerState::AwaitingInitialization | ControllerState::AwaitingBlockConfig
        )
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerState {
    type Err = crate::Error;

    /// Accepts the stable name in any case, with or without underscores
    /// (`BlockBegan`, `block_began`, `BLOCKBEGAN`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        ControllerState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown controller state: {}", s)))
    }
}
