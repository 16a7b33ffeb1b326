//! In-memory trial runner
//!
//! Sequential block and trial numbering from 1, per-trial status, block and
//! session settings, and a trial log. Used by the binary (driven from the
//! operator API) and by tests.
//!
//! Notifications are delivered synchronously, after the internal lock has
//! been released, so a listener may call back into the runner.

use super::{
    BlockHandle, RunnerError, RunnerEvent, SessionListener, SessionParams, TrialHandle,
    TrialRunner,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Lifecycle status of one trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrialStatus {
    NotDone,
    InProgress,
    Done,
}

/// One row of the trial log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRow {
    pub trial_number: u32,
    pub block_number: u32,
    /// Values of the logged block settings when the trial ended
    pub settings: Map<String, Value>,
}

struct TrialRecord {
    number: u32,
    status: TrialStatus,
}

struct BlockRecord {
    number: u32,
    settings: Map<String, Value>,
    trials: Vec<TrialRecord>,
    begun: bool,
    ended: bool,
}

impl BlockRecord {
    fn has_pending(&self) -> bool {
        self.trials.iter().any(|t| t.status == TrialStatus::NotDone)
    }
}

#[derive(Default)]
struct RunnerState {
    session: Option<SessionParams>,
    blocks: Vec<BlockRecord>,
    trials_created: u32,
    current_trial: Option<TrialHandle>,
    current_block: Option<u32>,
    session_settings: Map<String, Value>,
    logged_settings: Vec<String>,
    log: Vec<TrialRow>,
}

impl RunnerState {
    fn block_mut(&mut self, block: BlockHandle) -> Result<&mut BlockRecord, RunnerError> {
        self.blocks
            .iter_mut()
            .find(|b| b.number == block.number)
            .ok_or(RunnerError::UnknownBlock(block.number))
    }

    fn block(&self, block: BlockHandle) -> Option<&BlockRecord> {
        self.blocks.iter().find(|b| b.number == block.number)
    }

    /// Finish the running trial, queueing its notifications
    fn finish_current_trial(
        &mut self,
        events: &mut Vec<RunnerEvent>,
    ) -> Result<TrialHandle, RunnerError> {
        let trial = self.current_trial.take().ok_or(RunnerError::NoTrialInProgress)?;
        let logged = self.logged_settings.clone();

        let block = self.block_mut(BlockHandle {
            number: trial.block_number,
        })?;
        if let Some(record) = block.trials.iter_mut().find(|t| t.number == trial.number) {
            record.status = TrialStatus::Done;
        }
        let settings = logged
            .iter()
            .filter_map(|key| block.settings.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        let block_finished = !block.has_pending();
        if block_finished {
            block.ended = true;
        }

        self.log.push(TrialRow {
            trial_number: trial.number,
            block_number: trial.block_number,
            settings,
        });
        events.push(RunnerEvent::TrialEnd(trial));
        if block_finished {
            events.push(RunnerEvent::BlockEnd(BlockHandle {
                number: trial.block_number,
            }));
        }
        Ok(trial)
    }
}

/// Trial runner kept entirely in memory
///
/// Cloning shares the same runner.
#[derive(Clone, Default)]
pub struct InMemoryRunner {
    state: Arc<Mutex<RunnerState>>,
    listeners: Arc<Mutex<Vec<Arc<dyn SessionListener>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, events: Vec<RunnerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = lock(&self.listeners).clone();
        for event in events {
            debug!(?event, "Runner notification");
            for listener in &listeners {
                match &event {
                    RunnerEvent::SessionBegin(params) => listener.on_session_begin(params),
                    RunnerEvent::BlockBegin(block) => listener.on_block_begin(*block),
                    RunnerEvent::TrialBegin(trial) => listener.on_trial_begin(*trial),
                    RunnerEvent::TrialEnd(trial) => listener.on_trial_end(*trial),
                    RunnerEvent::BlockEnd(block) => listener.on_block_end(*block),
                    RunnerEvent::SessionEnd => listener.on_session_end(),
                }
            }
        }
    }

    pub fn session_active(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    pub fn block_count(&self) -> usize {
        lock(&self.state).blocks.len()
    }

    pub fn current_trial(&self) -> Option<TrialHandle> {
        lock(&self.state).current_trial
    }

    pub fn trial_status(&self, trial: TrialHandle) -> Option<TrialStatus> {
        let state = lock(&self.state);
        state
            .block(BlockHandle {
                number: trial.block_number,
            })
            .and_then(|b| b.trials.iter().find(|t| t.number == trial.number))
            .map(|t| t.status)
    }

    /// Trials of `block` that have not run yet
    pub fn pending_trials(&self, block: BlockHandle) -> usize {
        let state = lock(&self.state);
        state.block(block).map_or(0, |b| {
            b.trials
                .iter()
                .filter(|t| t.status == TrialStatus::NotDone)
                .count()
        })
    }

    pub fn session_settings(&self) -> Map<String, Value> {
        lock(&self.state).session_settings.clone()
    }

    pub fn logged_settings(&self) -> Vec<String> {
        lock(&self.state).logged_settings.clone()
    }

    pub fn log_rows(&self) -> Vec<TrialRow> {
        lock(&self.state).log.clone()
    }
}

impl TrialRunner for InMemoryRunner {
    fn begin_session(&self, params: &SessionParams) -> Result<(), RunnerError> {
        {
            let mut state = lock(&self.state);
            if state.session.is_some() {
                return Err(RunnerError::SessionInProgress);
            }
            state.session = Some(params.clone());
        }
        self.emit(vec![RunnerEvent::SessionBegin(params.clone())]);
        Ok(())
    }

    fn end_session(&self) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.session.is_none() {
                return;
            }
            if state.current_trial.is_some() {
                // Cannot fail: a trial is in progress
                let _ = state.finish_current_trial(&mut events);
            }
            state.session = None;
        }
        events.push(RunnerEvent::SessionEnd);
        self.emit(events);
    }

    fn create_block(&self) -> Result<BlockHandle, RunnerError> {
        let mut state = lock(&self.state);
        if state.session.is_none() {
            return Err(RunnerError::NoSession);
        }
        let number = state.blocks.len() as u32 + 1;
        state.blocks.push(BlockRecord {
            number,
            settings: Map::new(),
            trials: Vec::new(),
            begun: false,
            ended: false,
        });
        Ok(BlockHandle { number })
    }

    fn discard_block(&self, block: BlockHandle) -> bool {
        let mut state = lock(&self.state);
        // Only the newest block can go, so numbering stays sequential
        match state.blocks.last() {
            Some(last) if last.number == block.number && !last.begun => {}
            _ => return false,
        }
        if let Some(record) = state.blocks.pop() {
            state.trials_created -= record.trials.len() as u32;
            debug!(block = record.number, trials = record.trials.len(), "Block discarded");
        }
        true
    }

    fn create_trial(&self, block: BlockHandle) -> Result<TrialHandle, RunnerError> {
        let mut state = lock(&self.state);
        let number = state.trials_created + 1;
        state.block_mut(block)?.trials.push(TrialRecord {
            number,
            status: TrialStatus::NotDone,
        });
        state.trials_created = number;
        Ok(TrialHandle {
            number,
            block_number: block.number,
        })
    }

    fn begin_next_trial(&self) -> Result<TrialHandle, RunnerError> {
        let mut events = Vec::new();
        let trial = {
            let mut state = lock(&self.state);
            if state.session.is_none() {
                return Err(RunnerError::NoSession);
            }
            if state.current_trial.is_some() {
                return Err(RunnerError::TrialInProgress);
            }

            let current_block = state.current_block;
            let block = state
                .blocks
                .iter_mut()
                .find(|b| !b.ended && b.has_pending())
                .ok_or(RunnerError::NoPendingTrial)?;
            let record = block
                .trials
                .iter_mut()
                .find(|t| t.status == TrialStatus::NotDone)
                .ok_or(RunnerError::NoPendingTrial)?;
            record.status = TrialStatus::InProgress;

            let trial = TrialHandle {
                number: record.number,
                block_number: block.number,
            };
            if !block.begun || current_block != Some(block.number) {
                block.begun = true;
                events.push(RunnerEvent::BlockBegin(BlockHandle {
                    number: block.number,
                }));
            }
            events.push(RunnerEvent::TrialBegin(trial));

            state.current_block = Some(trial.block_number);
            state.current_trial = Some(trial);
            trial
        };
        self.emit(events);
        Ok(trial)
    }

    fn end_current_trial(&self) -> Result<TrialHandle, RunnerError> {
        let mut events = Vec::new();
        let trial = lock(&self.state).finish_current_trial(&mut events)?;
        self.emit(events);
        Ok(trial)
    }

    fn end_block(&self, block: BlockHandle) -> Result<(), RunnerError> {
        {
            let mut state = lock(&self.state);
            if state
                .current_trial
                .is_some_and(|t| t.block_number == block.number)
            {
                return Err(RunnerError::TrialInProgress);
            }
            let record = state.block_mut(block)?;
            if !record.begun || record.ended {
                return Err(RunnerError::BlockNotRunning(block.number));
            }
            record.ended = true;
        }
        self.emit(vec![RunnerEvent::BlockEnd(block)]);
        Ok(())
    }

    fn remove_pending_trials(&self, block: BlockHandle) -> usize {
        let mut state = lock(&self.state);
        match state.block_mut(block) {
            Ok(record) => {
                let before = record.trials.len();
                record.trials.retain(|t| t.status != TrialStatus::NotDone);
                before - record.trials.len()
            }
            Err(_) => 0,
        }
    }

    fn trial_count(&self, block: BlockHandle) -> usize {
        lock(&self.state).block(block).map_or(0, |b| b.trials.len())
    }

    fn trial_in_progress(&self) -> bool {
        lock(&self.state).current_trial.is_some()
    }

    fn set_block_setting(&self, block: BlockHandle, key: &str, value: Value) {
        if let Ok(record) = lock(&self.state).block_mut(block) {
            record.settings.insert(key.to_string(), value);
        }
    }

    fn block_settings(&self, block: BlockHandle) -> Map<String, Value> {
        lock(&self.state)
            .block(block)
            .map(|b| b.settings.clone())
            .unwrap_or_default()
    }

    fn set_session_setting(&self, key: &str, value: Value) {
        lock(&self.state)
            .session_settings
            .insert(key.to_string(), value);
    }

    fn add_settings_to_log(&self, keys: &[&str]) {
        let mut state = lock(&self.state);
        for key in keys {
            if !state.logged_settings.iter().any(|k| k == key) {
                state.logged_settings.push(key.to_string());
            }
        }
    }

    fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        lock(&self.listeners).push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Listener that records every notification
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RunnerEvent>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<RunnerEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl SessionListener for Recorder {
        fn on_session_begin(&self, params: &SessionParams) {
            self.events
                .lock()
                .unwrap()
                .push(RunnerEvent::SessionBegin(params.clone()));
        }
        fn on_block_begin(&self, block: BlockHandle) {
            self.events.lock().unwrap().push(RunnerEvent::BlockBegin(block));
        }
        fn on_trial_begin(&self, trial: TrialHandle) {
            self.events.lock().unwrap().push(RunnerEvent::TrialBegin(trial));
        }
        fn on_trial_end(&self, trial: TrialHandle) {
            self.events.lock().unwrap().push(RunnerEvent::TrialEnd(trial));
        }
        fn on_block_end(&self, block: BlockHandle) {
            self.events.lock().unwrap().push(RunnerEvent::BlockEnd(block));
        }
        fn on_session_end(&self) {
            self.events.lock().unwrap().push(RunnerEvent::SessionEnd);
        }
    }

    fn started() -> (InMemoryRunner, Arc<Recorder>) {
        let runner = InMemoryRunner::new();
        let recorder = Arc::new(Recorder::default());
        runner.subscribe(recorder.clone());
        runner.begin_session(&SessionParams::default()).unwrap();
        recorder.take();
        (runner, recorder)
    }

    #[test]
    fn test_block_requires_session() {
        let runner = InMemoryRunner::new();
        assert_eq!(runner.create_block(), Err(RunnerError::NoSession));
    }

    #[test]
    fn test_second_session_begin_rejected() {
        let (runner, _recorder) = started();
        assert_eq!(
            runner.begin_session(&SessionParams::default()),
            Err(RunnerError::SessionInProgress)
        );
    }

    #[test]
    fn test_trials_run_in_order_with_block_events() {
        let (runner, recorder) = started();
        let block = runner.create_block().unwrap();
        let t1 = runner.create_trial(block).unwrap();
        let t2 = runner.create_trial(block).unwrap();
        assert_eq!((t1.number, t2.number), (1, 2));

        assert_eq!(runner.begin_next_trial().unwrap(), t1);
        assert_eq!(runner.trial_status(t1), Some(TrialStatus::InProgress));
        runner.end_current_trial().unwrap();
        runner.begin_next_trial().unwrap();
        runner.end_current_trial().unwrap();

        assert_eq!(
            recorder.take(),
            vec![
                RunnerEvent::BlockBegin(block),
                RunnerEvent::TrialBegin(t1),
                RunnerEvent::TrialEnd(t1),
                RunnerEvent::TrialBegin(t2),
                RunnerEvent::TrialEnd(t2),
                RunnerEvent::BlockEnd(block),
            ]
        );
        assert_eq!(runner.trial_status(t2), Some(TrialStatus::Done));
        assert_eq!(runner.begin_next_trial(), Err(RunnerError::NoPendingTrial));
    }

    #[test]
    fn test_remove_pending_then_end_trial_ends_block() {
        let (runner, recorder) = started();
        let block = runner.create_block().unwrap();
        for _ in 0..3 {
            runner.create_trial(block).unwrap();
        }
        runner.begin_next_trial().unwrap();

        assert_eq!(runner.remove_pending_trials(block), 2);
        assert_eq!(runner.pending_trials(block), 0);
        runner.end_current_trial().unwrap();

        assert_eq!(recorder.take().last(), Some(&RunnerEvent::BlockEnd(block)));
        assert_eq!(runner.trial_count(block), 1);
    }

    #[test]
    fn test_discard_unstarted_block_reuses_numbers() {
        let (runner, recorder) = started();
        let block = runner.create_block().unwrap();
        runner.create_trial(block).unwrap();

        assert!(runner.discard_block(block));
        assert_eq!(runner.block_count(), 0);
        assert!(recorder.take().is_empty());

        let again = runner.create_block().unwrap();
        assert_eq!(again.number, 1);
        assert_eq!(runner.create_trial(again).unwrap().number, 1);
    }

    #[test]
    fn test_begun_block_is_not_discarded() {
        let (runner, _recorder) = started();
        let block = runner.create_block().unwrap();
        runner.create_trial(block).unwrap();
        runner.begin_next_trial().unwrap();

        assert!(!runner.discard_block(block));
        assert_eq!(runner.block_count(), 1);
    }

    #[test]
    fn test_end_block_between_trials() {
        let (runner, recorder) = started();
        let block = runner.create_block().unwrap();
        runner.create_trial(block).unwrap();
        runner.create_trial(block).unwrap();
        runner.begin_next_trial().unwrap();
        assert_eq!(runner.end_block(block), Err(RunnerError::TrialInProgress));
        runner.end_current_trial().unwrap();
        recorder.take();

        runner.remove_pending_trials(block);
        runner.end_block(block).unwrap();
        assert_eq!(recorder.take(), vec![RunnerEvent::BlockEnd(block)]);
        assert_eq!(
            runner.end_block(block),
            Err(RunnerError::BlockNotRunning(block.number))
        );
    }

    #[test]
    fn test_log_rows_carry_logged_settings() {
        let (runner, _recorder) = started();
        runner.add_settings_to_log(&["blockName", "canceled"]);
        runner.add_settings_to_log(&["blockName"]);
        assert_eq!(runner.logged_settings(), vec!["blockName", "canceled"]);

        let block = runner.create_block().unwrap();
        runner.set_block_setting(block, "blockName", json!("b1"));
        runner.set_block_setting(block, "other", json!(1));
        runner.create_trial(block).unwrap();
        runner.begin_next_trial().unwrap();
        runner.end_current_trial().unwrap();

        let rows = runner.log_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].settings.get("blockName"), Some(&json!("b1")));
        assert!(!rows[0].settings.contains_key("other"));
    }

    #[test]
    fn test_end_session_finishes_running_trial() {
        let (runner, recorder) = started();
        let block = runner.create_block().unwrap();
        let trial = runner.create_trial(block).unwrap();
        runner.begin_next_trial().unwrap();
        recorder.take();

        runner.end_session();
        assert_eq!(
            recorder.take(),
            vec![
                RunnerEvent::TrialEnd(trial),
                RunnerEvent::BlockEnd(block),
                RunnerEvent::SessionEnd,
            ]
        );
        assert!(!runner.session_active());

        // Idempotent once ended
        runner.end_session();
        assert!(recorder.take().is_empty());
    }
}
