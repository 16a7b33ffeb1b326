//! Event types for the experiment flow event system
//!
//! Provides the shared event vocabulary and the EventBus used to broadcast it.
//! Events are diagnostic and observational: no subscriber can influence the
//! controller through them.

use crate::state::ControllerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Outcome of a goal-directed advancement request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveToStateResult {
    /// Superseded by a newer goal before it was reached
    Cancelled,
    /// The session ended before the goal was reached
    SessionEndedInterrupt,
    /// The controller reached the requested state
    MovedToTargetState,
}

/// Severity of an operator-facing status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Experiment flow event types
///
/// Broadcast via [`EventBus`] and serialized as-is for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    /// Controller moved between states
    StateChanged {
        old_state: ControllerState,
        new_state: ControllerState,
        timestamp: DateTime<Utc>,
    },

    /// Session summary cached
    SummaryReceived {
        participant_index: i64,
        total_block_count: i64,
        timestamp: DateTime<Utc>,
    },

    /// A block configuration arrived and is cached
    BlockReceived {
        name: String,
        calibration_name: Option<String>,
        block_id: Option<i64>,
        timestamp: DateTime<Utc>,
    },

    /// A registered calibration callback was invoked
    CalibrationStarted {
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// The calibration completion signal was received
    CalibrationCompleted {
        name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Runner reported the start of a block
    BlockStarted {
        block_number: u32,
        name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Runner reported the end of a block
    BlockFinished {
        block_number: u32,
        cancelled: bool,
        timestamp: DateTime<Utc>,
    },

    /// Runner reported the start of a trial
    TrialStarted {
        trial_number: u32,
        block_number: u32,
        timestamp: DateTime<Utc>,
    },

    /// Runner reported the end of a trial
    TrialFinished {
        trial_number: u32,
        block_number: u32,
        timestamp: DateTime<Utc>,
    },

    /// A request to the config service failed and will be retried
    FetchRetry {
        endpoint: String,
        attempt: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A goal-directed advancement resolved
    GoalResolved {
        target: ControllerState,
        result: MoveToStateResult,
        timestamp: DateTime<Utc>,
    },

    /// Human-readable status line for the operator
    StatusMessage {
        level: StatusLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::StateChanged { .. } => "StateChanged",
            FlowEvent::SummaryReceived { .. } => "SummaryReceived",
            FlowEvent::BlockReceived { .. } => "BlockReceived",
            FlowEvent::CalibrationStarted { .. } => "CalibrationStarted",
            FlowEvent::CalibrationCompleted { .. } => "CalibrationCompleted",
            FlowEvent::BlockStarted { .. } => "BlockStarted",
            FlowEvent::BlockFinished { .. } => "BlockFinished",
            FlowEvent::TrialStarted { .. } => "TrialStarted",
            FlowEvent::TrialFinished { .. } => "TrialFinished",
            FlowEvent::FetchRetry { .. } => "FetchRetry",
            FlowEvent::GoalResolved { .. } => "GoalResolved",
            FlowEvent::StatusMessage { .. } => "StatusMessage",
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper around a tokio broadcast channel. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before slow receivers lag
    ///
    /// # Examples
    ///
    /// ```
    /// use expflow_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: FlowEvent,
    ) -> Result<usize, broadcast::error::SendError<FlowEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: FlowEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit(FlowEvent::StateChanged {
            old_state: ControllerState::Uninitialized,
            new_state: ControllerState::AwaitingInitialization,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            FlowEvent::StateChanged { new_state, .. } => {
                assert_eq!(new_state, ControllerState::AwaitingInitialization)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors_but_lossy_does_not() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);

        let event = FlowEvent::StatusMessage {
            level: StatusLevel::Info,
            message: "hello".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FlowEvent::GoalResolved {
            target: ControllerState::BlockBegan,
            result: MoveToStateResult::MovedToTargetState,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "GoalResolved");
        assert_eq!(json["target"], "BlockBegan");
        assert_eq!(json["result"], "MovedToTargetState");
        assert_eq!(event.event_type(), "GoalResolved");
    }
}
