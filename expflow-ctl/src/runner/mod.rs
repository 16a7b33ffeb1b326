//! Trial runner interface
//!
//! The trial runner owns sessions, blocks and trials: numbering, ordering,
//! trial status and the data log. The flow controller only creates blocks and
//! trials through [`TrialRunner`] and listens to lifecycle notifications
//! through [`SessionListener`].
//!
//! Guarantees the controller relies on: exactly one block end per block
//! begin, exactly one trial end per trial begin. Nothing else about
//! cardinality or timing is assumed.

mod memory;

pub use memory::{InMemoryRunner, TrialRow, TrialStatus};

use expflow_common::config::SessionConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Block setting holding the block name
pub const SETTING_BLOCK_NAME: &str = "blockName";
/// Block setting set to true when the block was cancelled
pub const SETTING_CANCELED: &str = "canceled";
/// Block setting holding the calibration name (empty when none)
pub const SETTING_CALIBRATION_NAME: &str = "calibrationName";
/// Block setting holding the parameters reported by the calibration
pub const SETTING_CALIBRATION_PARAMETERS: &str = "calibrationParameters";
/// Session setting holding the participant index from the session summary
pub const SETTING_PARTICIPANT_INDEX: &str = "participant_index";

/// Block settings copied into every trial row of the data log
pub const LOGGED_BLOCK_SETTINGS: [&str; 3] =
    [SETTING_BLOCK_NAME, SETTING_CANCELED, SETTING_CALIBRATION_NAME];

/// Session setting key under which a finished block's settings are stored
pub fn block_session_key(block_number: u32) -> String {
    format!("Block_{}", block_number)
}

/// Trial runner errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("No session in progress")]
    NoSession,

    #[error("Session already in progress")]
    SessionInProgress,

    #[error("Unknown block {0}")]
    UnknownBlock(u32),

    #[error("Block {0} is not running")]
    BlockNotRunning(u32),

    #[error("A trial is already in progress")]
    TrialInProgress,

    #[error("No trial in progress")]
    NoTrialInProgress,

    #[error("No pending trial to begin")]
    NoPendingTrial,
}

/// Reference to a block owned by the runner; numbered from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHandle {
    pub number: u32,
}

/// Reference to a trial owned by the runner
///
/// Trial numbers run from 1 across the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialHandle {
    pub number: u32,
    pub block_number: u32,
}

/// Parameters handed to the runner when a session begins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub study_name: String,
    pub session_number: u32,
    #[serde(default)]
    pub participant_details: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl SessionParams {
    /// Participant index from the participant details, when present
    pub fn participant_index(&self) -> Option<i64> {
        self.participant_details
            .get(SETTING_PARTICIPANT_INDEX)
            .and_then(Value::as_i64)
    }
}

impl From<&SessionConfig> for SessionParams {
    fn from(config: &SessionConfig) -> Self {
        Self {
            study_name: config.study_name.clone(),
            session_number: config.session_number,
            participant_details: config.participant_details.clone(),
            settings: config.settings.clone(),
        }
    }
}

/// Lifecycle notification emitted by the runner
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    SessionBegin(SessionParams),
    BlockBegin(BlockHandle),
    TrialBegin(TrialHandle),
    TrialEnd(TrialHandle),
    BlockEnd(BlockHandle),
    SessionEnd,
}

/// Receiver of runner lifecycle notifications
///
/// Called synchronously from whatever thread drives the runner.
/// Implementations must not block.
pub trait SessionListener: Send + Sync {
    fn on_session_begin(&self, params: &SessionParams);
    fn on_block_begin(&self, block: BlockHandle);
    fn on_trial_begin(&self, trial: TrialHandle);
    fn on_trial_end(&self, trial: TrialHandle);
    fn on_block_end(&self, block: BlockHandle);
    fn on_session_end(&self);
}

/// Controller-to-runner calls
pub trait TrialRunner: Send + Sync {
    /// Start a session; the runner answers with a session-begin notification
    fn begin_session(&self, params: &SessionParams) -> Result<(), RunnerError>;

    /// End the session; the runner answers with a session-end notification
    fn end_session(&self);

    fn create_block(&self) -> Result<BlockHandle, RunnerError>;

    /// Throw away a block that never began, with its trials; returns whether
    /// anything was removed
    fn discard_block(&self, block: BlockHandle) -> bool;

    fn create_trial(&self, block: BlockHandle) -> Result<TrialHandle, RunnerError>;

    /// Begin the next trial not yet run, emitting block begin first when
    /// the trial opens a new block
    fn begin_next_trial(&self) -> Result<TrialHandle, RunnerError>;

    /// End the trial in progress, emitting block end when it was the last
    /// one of its block
    fn end_current_trial(&self) -> Result<TrialHandle, RunnerError>;

    /// Force the end of a block that has begun and has no trial running
    fn end_block(&self, block: BlockHandle) -> Result<(), RunnerError>;

    /// Drop the trials of `block` that have not run yet; returns how many
    fn remove_pending_trials(&self, block: BlockHandle) -> usize;

    fn trial_count(&self, block: BlockHandle) -> usize;

    fn trial_in_progress(&self) -> bool;

    fn set_block_setting(&self, block: BlockHandle, key: &str, value: Value);

    fn block_settings(&self, block: BlockHandle) -> Map<String, Value>;

    fn set_session_setting(&self, key: &str, value: Value);

    /// Copy these block settings into every trial row of the data log
    fn add_settings_to_log(&self, keys: &[&str]);

    fn subscribe(&self, listener: Arc<dyn SessionListener>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_session_key() {
        assert_eq!(block_session_key(3), "Block_3");
    }

    #[test]
    fn test_participant_index_from_details() {
        let mut params = SessionParams::default();
        assert_eq!(params.participant_index(), None);
        params
            .participant_details
            .insert("participant_index".to_string(), json!(9));
        assert_eq!(params.participant_index(), Some(9));
    }
}
