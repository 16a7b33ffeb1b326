//! Experiment flow controller
//!
//! [`FlowController`] is a cloneable handle to a single actor task that owns
//! all controller state. Every operation is a message processed in arrival
//! order on that task, and fetch results and runner notifications go through
//! the same mailbox, so no two transitions ever run concurrently.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --session begin--> AwaitingInitialization --summary--> AwaitingBlockConfig
//! AwaitingBlockConfig --config--> ReadyForCalibration --advance--> Calibrating | ReadyForBlockBegin
//! Calibrating --calibration complete--> ReadyForBlockBegin --advance--> BlockBegan
//! BlockBegan --block end--> BlockEnded | BlockCancelled --advance--> AwaitingBlockConfig
//! any --session end--> SessionEnded
//! ```

mod actor;
mod goal;

pub(crate) use actor::Command;
pub use goal::GoalCallback;

use crate::block::{BlockConfig, SessionSummary};
use crate::bridge::{BlockConfigurator, RunnerBridge, TrialCountConfigurator};
use crate::calibration::CalibrationHandle;
use crate::error::{FlowError, Result};
use crate::runner::{SessionParams, TrialRunner, LOGGED_BLOCK_SETTINGS};
use crate::source::ConfigSource;
use actor::Actor;
use expflow_common::events::{EventBus, FlowEvent, MoveToStateResult};
use expflow_common::ControllerState;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

/// Number of recent status messages kept for the status snapshot
pub const STATUS_HISTORY: usize = 6;

/// Result of [`FlowController::advance`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The controller moved to a new state
    Transitioned {
        from: ControllerState,
        to: ControllerState,
    },
    /// A collaborator was asked to act; the state changes when it answers
    Requested { message: String },
    /// Nothing to do yet: a fetch or a block is in progress
    NotReady { message: String },
    /// Calibration is running
    Waiting { message: String },
}

/// Result of [`FlowController::cancel`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled {
        block_number: u32,
        removed_trials: usize,
    },
    /// Cancel only applies to a running block
    NotApplicable { state: ControllerState },
}

/// Result of [`FlowController::calibration_complete`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CalibrationOutcome {
    Completed { name: Option<String> },
    NotApplicable { state: ControllerState },
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub id: Uuid,
    pub state: ControllerState,
    pub source: &'static str,
    pub participant_index: Option<i64>,
    pub total_block_count: Option<i64>,
    /// Name of the block running in the runner
    pub current_block: Option<String>,
    /// Name of the block config received but not yet started
    pub pending_block: Option<String>,
    pub block_number: Option<u32>,
    pub trial_number: Option<u32>,
    pub calibration: Option<String>,
    pub goal: Option<ControllerState>,
    /// Failed config requests since the last success
    pub retry_count: u64,
    pub last_block_cancelled: bool,
    pub recent_messages: Vec<String>,
}

/// Construction options for [`FlowController::spawn`]
#[derive(Clone)]
pub struct ControllerOptions {
    pub session_params: SessionParams,
    pub configurator: Arc<dyn BlockConfigurator>,
    pub event_bus: EventBus,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            session_params: SessionParams::default(),
            configurator: Arc::new(TrialCountConfigurator::new(1)),
            event_bus: EventBus::default(),
        }
    }
}

impl ControllerOptions {
    pub fn with_session_params(mut self, session_params: SessionParams) -> Self {
        self.session_params = session_params;
        self
    }

    pub fn with_configurator(mut self, configurator: Arc<dyn BlockConfigurator>) -> Self {
        self.configurator = configurator;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }
}

/// Handle to a running flow controller
#[derive(Clone)]
pub struct FlowController {
    mailbox: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ControllerState>,
    event_bus: EventBus,
}

impl FlowController {
    /// Start the controller task
    ///
    /// Subscribes the controller to `runner` notifications and registers the
    /// block settings logged with every trial. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        source: Arc<dyn ConfigSource>,
        runner: Arc<dyn TrialRunner>,
        options: ControllerOptions,
    ) -> Self {
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (calibration_tx, calibration_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ControllerState::Uninitialized);
        let event_bus = options.event_bus.clone();

        runner.subscribe(Arc::new(RunnerBridge::new(mailbox.clone())));
        runner.add_settings_to_log(&LOGGED_BLOCK_SETTINGS);

        let actor = Actor::new(
            source,
            runner,
            options,
            state_tx,
            mailbox.clone(),
            calibration_tx,
        );
        tokio::spawn(actor.run(mailbox_rx, calibration_rx));

        Self {
            mailbox,
            state_rx,
            event_bus,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(make(tx))
            .map_err(|_| FlowError::ControllerStopped)?;
        rx.await.map_err(|_| FlowError::ControllerStopped)
    }

    /// Take the next step of the flow from the current state
    pub async fn advance(&self) -> Result<AdvanceOutcome> {
        self.request(|reply| Command::Advance { reply }).await?
    }

    /// Stop the running block; valid only in `BlockBegan`
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    /// Complete the running calibration with its resulting parameters
    pub async fn calibration_complete(&self, parameters: Value) -> Result<CalibrationOutcome> {
        self.request(|reply| Command::CalibrationComplete { parameters, reply })
            .await
    }

    /// Register the callback run for blocks whose calibration name is `name`
    ///
    /// Returns true if an earlier registration was replaced. The callback
    /// runs on the controller task and must not block; it finishes the
    /// calibration by calling [`CalibrationHandle::complete`], from any
    /// thread and at any later time. There is no timeout.
    pub async fn register_calibration<F>(&self, name: impl Into<String>, callback: F) -> Result<bool>
    where
        F: Fn(&BlockConfig, CalibrationHandle) + Send + Sync + 'static,
    {
        let name = name.into();
        self.request(|reply| Command::RegisterCalibration {
            name,
            callback: Arc::new(callback),
            reply,
        })
        .await
    }

    /// Keep advancing until `target` is reached or the session ends
    ///
    /// Replaces any pending goal; the replaced goal's callback receives
    /// [`MoveToStateResult::Cancelled`].
    pub fn move_to_state(
        &self,
        target: ControllerState,
        callback: impl FnOnce(MoveToStateResult) + Send + 'static,
    ) -> Result<()> {
        self.mailbox
            .send(Command::MoveToState {
                target,
                callback: Box::new(callback),
            })
            .map_err(|_| FlowError::ControllerStopped)
    }

    /// [`Self::move_to_state`] as a future
    pub async fn wait_for_goal(&self, target: ControllerState) -> Result<MoveToStateResult> {
        let (tx, rx) = oneshot::channel();
        self.move_to_state(target, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| FlowError::ControllerStopped)
    }

    /// Replace the parameters the session will begin with
    pub async fn set_session_params(&self, params: SessionParams) -> Result<()> {
        self.request(|reply| Command::SetSessionParams { params, reply })
            .await?
    }

    /// Fetch the session summary again and check it against the cached one
    pub async fn refresh_summary(&self) -> Result<SessionSummary> {
        self.request(|reply| Command::RefreshSummary { reply })
            .await?
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn state(&self) -> ControllerState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ControllerState> {
        self.state_rx.clone()
    }

    /// Wait until the controller is in `target`
    ///
    /// Only the latest state is observed; a state passed through quickly
    /// may be missed.
    pub async fn wait_for_state(&self, target: ControllerState) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        state_rx
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| FlowError::ControllerStopped)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Stop the controller task and abandon any fetch in progress
    pub fn shutdown(&self) {
        let _ = self.mailbox.send(Command::Shutdown);
    }
}
