//! Goal-directed advancement
//!
//! A pending goal asks the controller to keep advancing until it reaches a
//! target state. At most one goal exists; arming a new one resolves the old
//! one with `Cancelled` first, on the controller task, so both callbacks can
//! never fire for the same transition.

use expflow_common::events::{EventBus, FlowEvent, MoveToStateResult};
use expflow_common::ControllerState;
use tracing::info;

/// Callback fired exactly once when a goal resolves
pub type GoalCallback = Box<dyn FnOnce(MoveToStateResult) + Send>;

pub(crate) struct PendingGoal {
    target: ControllerState,
    callback: GoalCallback,
    /// State in which the last advance toward the target failed
    stalled_in: Option<ControllerState>,
}

impl PendingGoal {
    pub(crate) fn new(target: ControllerState, callback: GoalCallback) -> Self {
        Self {
            target,
            callback,
            stalled_in: None,
        }
    }

    pub(crate) fn target(&self) -> ControllerState {
        self.target
    }

    /// Stop advancing toward the target until the controller leaves `state`
    pub(crate) fn stall(&mut self, state: ControllerState) {
        self.stalled_in = Some(state);
    }

    pub(crate) fn resume(&mut self) {
        self.stalled_in = None;
    }

    pub(crate) fn is_stalled_in(&self, state: ControllerState) -> bool {
        self.stalled_in == Some(state)
    }

    /// Resolution of this goal in `state`, if it resolves there
    pub(crate) fn check(&self, state: ControllerState) -> Option<MoveToStateResult> {
        if state == self.target {
            Some(MoveToStateResult::MovedToTargetState)
        } else if state == ControllerState::SessionEnded {
            Some(MoveToStateResult::SessionEndedInterrupt)
        } else {
            None
        }
    }

    pub(crate) fn resolve(self, result: MoveToStateResult, event_bus: &EventBus) {
        info!(target = %self.target, ?result, "Goal resolved");
        event_bus.emit_lossy(FlowEvent::GoalResolved {
            target: self.target,
            result,
            timestamp: expflow_common::time::now(),
        });
        (self.callback)(result);
    }
}

/// States in which the controller itself can make progress toward a goal
///
/// In every other state progress depends on a fetch, the runner or the
/// calibration callback.
pub(crate) fn is_actionable(state: ControllerState) -> bool {
    matches!(
        state,
        ControllerState::Uninitialized
            | ControllerState::ReadyForCalibration
            | ControllerState::ReadyForBlockBegin
            | ControllerState::BlockEnded
            | ControllerState::BlockCancelled
    )
}
