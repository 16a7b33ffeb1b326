//! Controller task
//!
//! Owns every piece of controller state. Config fetches run as separate
//! tasks and post their results back to the mailbox tagged with a fetch id;
//! a result whose id is no longer the outstanding one is dropped.

use super::goal::{self, GoalCallback, PendingGoal};
use super::{
    AdvanceOutcome, CalibrationOutcome, CancelOutcome, ControllerOptions, ControllerStatus,
    STATUS_HISTORY,
};
use crate::block::{BlockConfig, NextBlock, SessionSummary};
use crate::bridge::{BlockBuilder, BlockConfigurator};
use crate::calibration::{CalibrationFn, CalibrationHandle, CalibrationRegistry, CalibrationSignal};
use crate::error::{FlowError, Result};
use crate::runner::{
    block_session_key, BlockHandle, RunnerEvent, SessionParams, TrialHandle, TrialRunner,
    SETTING_BLOCK_NAME, SETTING_CALIBRATION_NAME, SETTING_CALIBRATION_PARAMETERS,
    SETTING_CANCELED, SETTING_PARTICIPANT_INDEX,
};
use crate::source::{ConfigSource, SourceError};
use expflow_common::events::{EventBus, FlowEvent, MoveToStateResult, StatusLevel};
use expflow_common::time;
use expflow_common::ControllerState;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Controller mailbox message
pub(crate) enum Command {
    Advance {
        reply: oneshot::Sender<Result<AdvanceOutcome>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<CancelOutcome>>,
    },
    CalibrationComplete {
        parameters: Value,
        reply: oneshot::Sender<CalibrationOutcome>,
    },
    RegisterCalibration {
        name: String,
        callback: CalibrationFn,
        reply: oneshot::Sender<bool>,
    },
    MoveToState {
        target: ControllerState,
        callback: GoalCallback,
    },
    SetSessionParams {
        params: SessionParams,
        reply: oneshot::Sender<Result<()>>,
    },
    RefreshSummary {
        reply: oneshot::Sender<Result<SessionSummary>>,
    },
    SummaryRefreshed {
        result: std::result::Result<SessionSummary, SourceError>,
        reply: oneshot::Sender<Result<SessionSummary>>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    Runner(RunnerEvent),
    FetchCompleted {
        fetch_id: u64,
        result: FetchResult,
    },
    Shutdown,
}

/// Which config source operation a fetch performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchKind {
    Summary,
    CurrentConfig,
    NextConfig,
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchKind::Summary => write!(f, "session summary"),
            FetchKind::CurrentConfig => write!(f, "current block config"),
            FetchKind::NextConfig => write!(f, "next block config"),
        }
    }
}

pub(crate) enum FetchResult {
    Summary(std::result::Result<SessionSummary, SourceError>),
    CurrentConfig(std::result::Result<BlockConfig, SourceError>),
    NextConfig(std::result::Result<NextBlock, SourceError>),
}

impl FetchResult {
    async fn fetch(kind: FetchKind, source: &dyn ConfigSource) -> Self {
        match kind {
            FetchKind::Summary => FetchResult::Summary(source.get_summary().await),
            FetchKind::CurrentConfig => FetchResult::CurrentConfig(source.get_current_config().await),
            FetchKind::NextConfig => FetchResult::NextConfig(source.advance_to_next_config().await),
        }
    }
}

pub(crate) struct Actor {
    /// Identifies this controller instance in logs and status snapshots
    id: Uuid,
    state: ControllerState,
    source: Arc<dyn ConfigSource>,
    runner: Arc<dyn TrialRunner>,
    configurator: Arc<dyn BlockConfigurator>,
    calibrations: CalibrationRegistry,
    event_bus: EventBus,
    state_tx: watch::Sender<ControllerState>,
    mailbox: mpsc::UnboundedSender<Command>,
    calibration_tx: mpsc::UnboundedSender<CalibrationSignal>,
    cancel_token: CancellationToken,

    session_params: SessionParams,
    session_begin_requested: bool,
    session_end_requested: bool,
    runner_participant_index: Option<i64>,
    summary: Option<SessionSummary>,

    /// Received but not yet materialized
    block_config: Option<BlockConfig>,
    current_block: Option<BlockHandle>,
    current_block_name: Option<String>,
    current_trial: Option<TrialHandle>,
    cancel_requested: bool,
    last_block_cancelled: bool,

    calibration_generation: u64,
    active_calibration: Option<String>,
    calibration_parameters: Option<Value>,

    fetch_seq: u64,
    in_flight: Option<(u64, FetchKind)>,
    /// Last fetch failed without retrying; advance re-issues it
    failed_fetch: Option<FetchKind>,

    goal: Option<PendingGoal>,
    recent_messages: VecDeque<String>,
}

impl Actor {
    pub(crate) fn new(
        source: Arc<dyn ConfigSource>,
        runner: Arc<dyn TrialRunner>,
        options: ControllerOptions,
        state_tx: watch::Sender<ControllerState>,
        mailbox: mpsc::UnboundedSender<Command>,
        calibration_tx: mpsc::UnboundedSender<CalibrationSignal>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ControllerState::Uninitialized,
            source,
            runner,
            configurator: options.configurator,
            calibrations: CalibrationRegistry::new(),
            event_bus: options.event_bus,
            state_tx,
            mailbox,
            calibration_tx,
            cancel_token: CancellationToken::new(),
            session_params: options.session_params,
            session_begin_requested: false,
            session_end_requested: false,
            runner_participant_index: None,
            summary: None,
            block_config: None,
            current_block: None,
            current_block_name: None,
            current_trial: None,
            cancel_requested: false,
            last_block_cancelled: false,
            calibration_generation: 0,
            active_calibration: None,
            calibration_parameters: None,
            fetch_seq: 0,
            in_flight: None,
            failed_fetch: None,
            goal: None,
            recent_messages: VecDeque::with_capacity(STATUS_HISTORY),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut mailbox_rx: mpsc::UnboundedReceiver<Command>,
        mut calibration_rx: mpsc::UnboundedReceiver<CalibrationSignal>,
    ) {
        info!(id = %self.id, source = self.source.kind(), "Flow controller started");

        loop {
            tokio::select! {
                command = mailbox_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(signal) = calibration_rx.recv() => {
                    self.complete_calibration(Some(signal.generation), signal.parameters);
                }
            }
            self.drive_goal();
        }

        self.cancel_token.cancel();
        self.source.cancel_pending();
        info!(id = %self.id, state = %self.state, "Flow controller stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Advance { reply } => {
                let _ = reply.send(self.advance());
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::CalibrationComplete { parameters, reply } => {
                let _ = reply.send(self.complete_calibration(None, parameters));
            }
            Command::RegisterCalibration {
                name,
                callback,
                reply,
            } => {
                let _ = reply.send(self.calibrations.register(name, callback));
            }
            Command::MoveToState { target, callback } => self.arm_goal(target, callback),
            Command::SetSessionParams { params, reply } => {
                let _ = reply.send(self.set_session_params(params));
            }
            Command::RefreshSummary { reply } => self.refresh_summary(reply),
            Command::SummaryRefreshed { result, reply } => {
                let _ = reply.send(self.check_refreshed_summary(result));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Runner(event) => self.on_runner_event(event),
            Command::FetchCompleted { fetch_id, result } => self.on_fetch_completed(fetch_id, result),
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    fn set_state(&mut self, new_state: ControllerState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        if let Some(pending) = self.goal.as_mut() {
            pending.resume();
        }
        self.state_tx.send_replace(new_state);
        info!(from = %old_state, to = %new_state, "State changed");
        self.event_bus.emit_lossy(FlowEvent::StateChanged {
            old_state,
            new_state,
            timestamp: time::now(),
        });
    }

    /// Log, broadcast and remember an operator-facing status line
    fn status(&mut self, level: StatusLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            StatusLevel::Info => info!(state = %self.state, "{}", message),
            StatusLevel::Warning => warn!(state = %self.state, "{}", message),
            StatusLevel::Error => error!(state = %self.state, "{}", message),
        }

        if self.recent_messages.len() == STATUS_HISTORY {
            self.recent_messages.pop_front();
        }
        self.recent_messages.push_back(message.clone());
        self.event_bus.emit_lossy(FlowEvent::StatusMessage {
            level,
            message,
            timestamp: time::now(),
        });
    }

    fn violation(&mut self, message: impl Into<String>) -> FlowError {
        let message = message.into();
        self.status(StatusLevel::Error, format!("Consistency violation: {}", message));
        FlowError::ConsistencyViolation(message)
    }

    fn not_ready(&mut self, message: impl Into<String>) -> AdvanceOutcome {
        let message = message.into();
        self.status(StatusLevel::Warning, message.clone());
        AdvanceOutcome::NotReady { message }
    }

    fn transitioned(&self, from: ControllerState) -> AdvanceOutcome {
        AdvanceOutcome::Transitioned {
            from,
            to: self.state,
        }
    }

    fn snapshot(&self) -> ControllerStatus {
        ControllerStatus {
            id: self.id,
            state: self.state,
            source: self.source.kind(),
            participant_index: self.summary.map(|s| s.participant_index),
            total_block_count: self.summary.map(|s| s.total_block_count),
            current_block: self.current_block_name.clone(),
            pending_block: self.block_config.as_ref().map(|c| c.name.clone()),
            block_number: self.current_block.map(|b| b.number),
            trial_number: self.current_trial.map(|t| t.number),
            calibration: self.active_calibration.clone(),
            goal: self.goal.as_ref().map(PendingGoal::target),
            retry_count: self.source.retry_count(),
            last_block_cancelled: self.last_block_cancelled,
            recent_messages: self.recent_messages.iter().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn advance(&mut self) -> Result<AdvanceOutcome> {
        let from = self.state;
        match self.state {
            ControllerState::Uninitialized => self.request_session_begin(),
            ControllerState::AwaitingInitialization | ControllerState::AwaitingBlockConfig => {
                Ok(self.retry_failed_fetch())
            }
            ControllerState::ReadyForCalibration => {
                self.start_calibration()?;
                Ok(self.transitioned(from))
            }
            ControllerState::Calibrating => {
                let name = self.active_calibration.clone().unwrap_or_default();
                Ok(AdvanceOutcome::Waiting {
                    message: format!("Waiting for calibration {} to complete", name),
                })
            }
            ControllerState::ReadyForBlockBegin => {
                self.begin_block()?;
                Ok(self.transitioned(from))
            }
            ControllerState::BlockBegan => {
                Ok(self.not_ready("Block in progress; cancel to stop it"))
            }
            ControllerState::BlockEnded => {
                self.request_config(FetchKind::NextConfig)?;
                Ok(self.transitioned(from))
            }
            ControllerState::BlockCancelled => {
                self.request_config(FetchKind::CurrentConfig)?;
                Ok(self.transitioned(from))
            }
            ControllerState::SessionEnded => Ok(self.not_ready("Session has ended")),
        }
    }

    fn request_session_begin(&mut self) -> Result<AdvanceOutcome> {
        if self.session_begin_requested {
            return Ok(self.not_ready("Session begin already requested"));
        }
        self.runner.begin_session(&self.session_params)?;
        self.session_begin_requested = true;

        let message = "Session begin requested".to_string();
        self.status(StatusLevel::Info, message.clone());
        Ok(AdvanceOutcome::Requested { message })
    }

    fn retry_failed_fetch(&mut self) -> AdvanceOutcome {
        match (self.in_flight, self.failed_fetch) {
            (None, Some(kind)) => {
                let message = format!("Requesting {} again", kind);
                self.status(StatusLevel::Info, message.clone());
                self.spawn_fetch(kind);
                AdvanceOutcome::Requested { message }
            }
            (Some((_, kind)), _) => self.not_ready(format!("Waiting for {}", kind)),
            (None, None) => self.not_ready("Waiting for session data"),
        }
    }

    fn require_summary(&mut self) -> Result<SessionSummary> {
        match self.summary {
            Some(summary) => Ok(summary),
            None => Err(self.violation(format!("No session data in state {}", self.state))),
        }
    }

    fn require_block_config(&mut self) -> Result<BlockConfig> {
        if let Some(config) = &self.block_config {
            return Ok(config.clone());
        }
        Err(self.violation(format!("No block config in state {}", self.state)))
    }

    fn start_calibration(&mut self) -> Result<()> {
        self.require_summary()?;
        let config = self.require_block_config()?;

        match config.calibration().map(str::to_string) {
            Some(name) if self.calibrations.contains(&name) => {
                self.calibration_generation += 1;
                let handle = CalibrationHandle::new(
                    name.as_str(),
                    self.calibration_generation,
                    self.calibration_tx.clone(),
                );
                self.active_calibration = Some(name.clone());
                self.set_state(ControllerState::Calibrating);
                self.status(StatusLevel::Info, format!("Calibrating: {}", name));
                self.event_bus.emit_lossy(FlowEvent::CalibrationStarted {
                    name: name.clone(),
                    timestamp: time::now(),
                });
                self.calibrations.invoke(&name, &config, handle);
            }
            Some(name) => {
                self.status(
                    StatusLevel::Warning,
                    format!("Calibration {} is not registered; skipping", name),
                );
                self.set_state(ControllerState::ReadyForBlockBegin);
            }
            None => self.set_state(ControllerState::ReadyForBlockBegin),
        }
        Ok(())
    }

    fn complete_calibration(&mut self, generation: Option<u64>, parameters: Value) -> CalibrationOutcome {
        if self.state != ControllerState::Calibrating {
            self.status(
                StatusLevel::Warning,
                format!("Calibration complete ignored in state {}", self.state),
            );
            return CalibrationOutcome::NotApplicable { state: self.state };
        }
        if generation.is_some_and(|g| g != self.calibration_generation) {
            debug!(?generation, "Stale calibration completion ignored");
            return CalibrationOutcome::NotApplicable { state: self.state };
        }

        let name = self.active_calibration.clone();
        self.calibration_parameters = Some(parameters);
        self.event_bus.emit_lossy(FlowEvent::CalibrationCompleted {
            name: name.clone(),
            timestamp: time::now(),
        });
        self.status(
            StatusLevel::Info,
            format!("Calibration {} complete", name.as_deref().unwrap_or("")),
        );
        self.set_state(ControllerState::ReadyForBlockBegin);
        CalibrationOutcome::Completed { name }
    }

    /// Create the runner block and its trials, then start the first trial
    fn begin_block(&mut self) -> Result<()> {
        self.require_summary()?;
        let config = self.require_block_config()?;
        let runner = self.runner.clone();

        let block = runner.create_block()?;
        runner.set_block_setting(block, SETTING_BLOCK_NAME, json!(config.name));
        runner.set_block_setting(block, SETTING_CANCELED, json!(false));
        runner.set_block_setting(
            block,
            SETTING_CALIBRATION_NAME,
            json!(config.calibration().unwrap_or("")),
        );
        runner.set_block_setting(
            block,
            SETTING_CALIBRATION_PARAMETERS,
            self.calibration_parameters.clone().unwrap_or(Value::Null),
        );

        let configured = {
            let mut builder = BlockBuilder::new(runner.as_ref(), block);
            self.configurator
                .configure(&config, &mut builder, self.last_block_cancelled)
                .and_then(|()| match builder.trial_count() {
                    0 => Err(FlowError::EmptyBlock(config.name.clone())),
                    _ => Ok(()),
                })
        };
        let started = configured.and_then(|()| {
            runner
                .begin_next_trial()
                .map(|_| ())
                .map_err(FlowError::from)
        });
        if let Err(e) = started {
            if !runner.discard_block(block) {
                runner.remove_pending_trials(block);
            }
            self.status(
                StatusLevel::Error,
                format!("Block {} could not start: {}", config.name, e),
            );
            return Err(e);
        }

        self.block_config = None;
        self.current_block = Some(block);
        self.current_block_name = Some(config.name.clone());
        self.cancel_requested = false;
        self.status(
            StatusLevel::Info,
            format!("Block {} ({}) started", block.number, config.name),
        );
        self.set_state(ControllerState::BlockBegan);
        Ok(())
    }

    fn request_config(&mut self, kind: FetchKind) -> Result<()> {
        self.require_summary()?;
        self.set_state(ControllerState::AwaitingBlockConfig);
        self.spawn_fetch(kind);
        Ok(())
    }

    fn cancel(&mut self) -> Result<CancelOutcome> {
        let block = match self.current_block {
            Some(block) if self.state == ControllerState::BlockBegan && !self.cancel_requested => block,
            _ => {
                self.status(
                    StatusLevel::Warning,
                    format!("Nothing to cancel in state {}", self.state),
                );
                return Ok(CancelOutcome::NotApplicable { state: self.state });
            }
        };

        let removed_trials = self.runner.remove_pending_trials(block);
        self.runner
            .set_block_setting(block, SETTING_CANCELED, json!(true));
        if self.runner.trial_in_progress() {
            self.runner.end_current_trial()?;
        } else {
            self.runner.end_block(block)?;
        }
        self.cancel_requested = true;

        self.status(
            StatusLevel::Info,
            format!(
                "Block {} cancelled; {} pending trials removed",
                block.number, removed_trials
            ),
        );
        Ok(CancelOutcome::Cancelled {
            block_number: block.number,
            removed_trials,
        })
    }

    fn set_session_params(&mut self, params: SessionParams) -> Result<()> {
        if self.session_begin_requested || self.state != ControllerState::Uninitialized {
            self.status(
                StatusLevel::Warning,
                "Session parameters cannot change once the session has started",
            );
            return Err(FlowError::SessionAlreadyStarted);
        }
        self.session_params = params;
        Ok(())
    }

    fn refresh_summary(&mut self, reply: oneshot::Sender<Result<SessionSummary>>) {
        if self.summary.is_none() {
            let err = self.violation("No session summary to refresh");
            let _ = reply.send(Err(err));
            return;
        }

        let source = self.source.clone();
        let mailbox = self.mailbox.clone();
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(SourceError::Cancelled),
                result = source.get_summary() => result,
            };
            let _ = mailbox.send(Command::SummaryRefreshed { result, reply });
        });
    }

    fn check_refreshed_summary(
        &mut self,
        result: std::result::Result<SessionSummary, SourceError>,
    ) -> Result<SessionSummary> {
        let summary = result?;
        match self.summary {
            Some(existing) if existing.participant_index == summary.participant_index => {
                debug!(participant_index = existing.participant_index, "Session summary unchanged");
                Ok(existing)
            }
            Some(existing) => Err(self.violation(format!(
                "Participant index changed from {} to {}",
                existing.participant_index, summary.participant_index
            ))),
            None => Err(self.violation("No session summary to compare against")),
        }
    }

    // ------------------------------------------------------------------
    // Goals
    // ------------------------------------------------------------------

    fn arm_goal(&mut self, target: ControllerState, callback: GoalCallback) {
        if let Some(previous) = self.goal.take() {
            previous.resolve(MoveToStateResult::Cancelled, &self.event_bus);
        }
        info!(target = %target, "Goal armed");
        self.goal = Some(PendingGoal::new(target, callback));
    }

    /// Whether an advance in the current state can move the controller on
    fn can_progress(&self) -> bool {
        match self.state {
            // Waiting on the runner's session-begin notification
            ControllerState::Uninitialized => !self.session_begin_requested,
            state => goal::is_actionable(state),
        }
    }

    /// Advance toward the pending goal for as long as the controller can
    ///
    /// A failed advance stalls the goal until the state changes.
    fn drive_goal(&mut self) {
        loop {
            let Some(pending) = self.goal.as_ref() else {
                return;
            };
            if let Some(result) = pending.check(self.state) {
                if let Some(pending) = self.goal.take() {
                    pending.resolve(result, &self.event_bus);
                }
                return;
            }
            if pending.is_stalled_in(self.state) || !self.can_progress() {
                return;
            }

            let before = self.state;
            if let Err(e) = self.advance() {
                warn!(error = %e, state = %self.state, "Goal advancement stalled");
                if let Some(pending) = self.goal.as_mut() {
                    pending.stall(self.state);
                }
                return;
            }
            if self.state == before {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetches
    // ------------------------------------------------------------------

    fn spawn_fetch(&mut self, kind: FetchKind) {
        self.fetch_seq += 1;
        let fetch_id = self.fetch_seq;
        self.in_flight = Some((fetch_id, kind));
        self.failed_fetch = None;
        debug!(fetch_id, kind = %kind, "Fetch started");

        let source = self.source.clone();
        let mailbox = self.mailbox.clone();
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = FetchResult::fetch(kind, source.as_ref()) => result,
            };
            let _ = mailbox.send(Command::FetchCompleted { fetch_id, result });
        });
    }

    fn on_fetch_completed(&mut self, fetch_id: u64, result: FetchResult) {
        let kind = match self.in_flight {
            Some((id, kind)) if id == fetch_id => kind,
            _ => {
                debug!(fetch_id, "Stale fetch result dropped");
                return;
            }
        };
        self.in_flight = None;

        match result {
            FetchResult::Summary(Ok(summary)) => self.on_summary(summary),
            FetchResult::CurrentConfig(Ok(config))
            | FetchResult::NextConfig(Ok(NextBlock::Block(config))) => self.on_block_config(config),
            FetchResult::NextConfig(Ok(NextBlock::EndOfSession))
            | FetchResult::CurrentConfig(Err(SourceError::SessionComplete))
            | FetchResult::NextConfig(Err(SourceError::SessionComplete)) => {
                self.request_session_end()
            }
            FetchResult::Summary(Err(e))
            | FetchResult::CurrentConfig(Err(e))
            | FetchResult::NextConfig(Err(e)) => self.on_fetch_failed(kind, e),
        }
    }

    fn on_fetch_failed(&mut self, kind: FetchKind, err: SourceError) {
        if matches!(err, SourceError::Cancelled) {
            debug!(kind = %kind, "Fetch cancelled");
            return;
        }
        self.failed_fetch = Some(kind);
        self.status(
            StatusLevel::Error,
            format!("Fetching {} failed: {}; advance to retry", kind, err),
        );
    }

    fn on_summary(&mut self, summary: SessionSummary) {
        if self.state != ControllerState::AwaitingInitialization {
            warn!(state = %self.state, "Session summary arrived outside initialization");
            return;
        }

        match self.summary {
            Some(existing) if existing.participant_index != summary.participant_index => {
                let _ = self.violation(format!(
                    "Participant index changed from {} to {}",
                    existing.participant_index, summary.participant_index
                ));
                return;
            }
            Some(_) => {}
            None => {
                self.summary = Some(summary);
                self.runner.set_session_setting(
                    SETTING_PARTICIPANT_INDEX,
                    json!(summary.participant_index),
                );
                self.event_bus.emit_lossy(FlowEvent::SummaryReceived {
                    participant_index: summary.participant_index,
                    total_block_count: summary.total_block_count,
                    timestamp: time::now(),
                });
                self.status(
                    StatusLevel::Info,
                    format!(
                        "Participant {}: {} blocks configured",
                        summary.participant_index, summary.total_block_count
                    ),
                );
            }
        }

        if let Some(runner_index) = self.runner_participant_index {
            if runner_index != summary.participant_index {
                self.status(
                    StatusLevel::Warning,
                    format!(
                        "Runner participant {} differs from session participant {}",
                        runner_index, summary.participant_index
                    ),
                );
            }
        }

        self.set_state(ControllerState::AwaitingBlockConfig);
        self.spawn_fetch(FetchKind::CurrentConfig);
    }

    fn on_block_config(&mut self, config: BlockConfig) {
        if self.state != ControllerState::AwaitingBlockConfig {
            warn!(state = %self.state, name = %config.name, "Block config arrived unexpectedly");
            return;
        }

        self.event_bus.emit_lossy(FlowEvent::BlockReceived {
            name: config.name.clone(),
            calibration_name: config.calibration().map(str::to_string),
            block_id: config.block_id,
            timestamp: time::now(),
        });
        self.status(StatusLevel::Info, format!("Block config received: {}", config));
        self.block_config = Some(config);
        self.set_state(ControllerState::ReadyForCalibration);
    }

    fn request_session_end(&mut self) {
        if self.session_end_requested {
            return;
        }
        self.session_end_requested = true;
        self.status(StatusLevel::Info, "No more blocks; ending session");
        self.runner.end_session();
    }

    // ------------------------------------------------------------------
    // Runner notifications
    // ------------------------------------------------------------------

    fn on_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::SessionBegin(params) => self.on_session_begin(params),
            RunnerEvent::BlockBegin(block) => {
                if self.current_block != Some(block) {
                    warn!(block = block.number, "Runner began a block the controller did not create");
                }
                self.event_bus.emit_lossy(FlowEvent::BlockStarted {
                    block_number: block.number,
                    name: self.current_block_name.clone(),
                    timestamp: time::now(),
                });
            }
            RunnerEvent::TrialBegin(trial) => {
                self.current_trial = Some(trial);
                self.event_bus.emit_lossy(FlowEvent::TrialStarted {
                    trial_number: trial.number,
                    block_number: trial.block_number,
                    timestamp: time::now(),
                });
            }
            RunnerEvent::TrialEnd(trial) => {
                self.current_trial = None;
                self.event_bus.emit_lossy(FlowEvent::TrialFinished {
                    trial_number: trial.number,
                    block_number: trial.block_number,
                    timestamp: time::now(),
                });
            }
            RunnerEvent::BlockEnd(block) => self.on_block_end(block),
            RunnerEvent::SessionEnd => self.on_session_end(),
        }
    }

    fn on_session_begin(&mut self, params: SessionParams) {
        if self.state != ControllerState::Uninitialized {
            warn!(state = %self.state, "Session begin ignored");
            return;
        }
        self.session_begin_requested = true;
        self.runner_participant_index = params.participant_index();
        self.status(
            StatusLevel::Info,
            format!("Session {} of {} started", params.session_number, params.study_name),
        );
        self.set_state(ControllerState::AwaitingInitialization);
        self.spawn_fetch(FetchKind::Summary);
    }

    fn on_block_end(&mut self, block: BlockHandle) {
        if self.state != ControllerState::BlockBegan || self.current_block != Some(block) {
            warn!(block = block.number, state = %self.state, "Block end ignored");
            return;
        }

        let settings = self.runner.block_settings(block);
        let cancelled = settings
            .get(SETTING_CANCELED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.runner
            .set_session_setting(&block_session_key(block.number), Value::Object(settings));

        self.last_block_cancelled = cancelled;
        self.cancel_requested = false;
        self.current_block = None;
        self.current_block_name = None;
        self.current_trial = None;
        self.active_calibration = None;
        self.calibration_parameters = None;

        self.event_bus.emit_lossy(FlowEvent::BlockFinished {
            block_number: block.number,
            cancelled,
            timestamp: time::now(),
        });
        if cancelled {
            self.status(
                StatusLevel::Info,
                format!("Block {} cancelled; advance to repeat it", block.number),
            );
            self.set_state(ControllerState::BlockCancelled);
        } else {
            self.status(StatusLevel::Info, format!("Block {} finished", block.number));
            self.set_state(ControllerState::BlockEnded);
        }
    }

    fn on_session_end(&mut self) {
        if self.state == ControllerState::SessionEnded {
            return;
        }
        self.cancel_token.cancel();
        self.source.cancel_pending();
        self.in_flight = None;
        self.status(StatusLevel::Info, "Session ended");
        self.set_state(ControllerState::SessionEnded);
    }
}
