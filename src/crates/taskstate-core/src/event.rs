//! Change and execution notifications.
//!
//! Core mutators and the execution engine publish [`StateMachineEvent`]s on an
//! [`EventBus`]. Observers (editors, monitors, tests) subscribe independently; publishing
//! never depends on a subscriber being present.

use crate::engine::ExecutionStatus;
use crate::outcome::{Outcome, OutcomeId};
use crate::port::PortId;
use crate::state::{StateId, StateType};
use crate::transition::{DataFlowId, TransitionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity of the broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Structural change applied to a single state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    NameChanged { name: String },
    LogicChanged { logic: String },
    OutcomeAdded { outcome_id: OutcomeId },
    OutcomeRemoved { outcome_id: OutcomeId },
    InputPortAdded { port_id: PortId },
    OutputPortAdded { port_id: PortId },
    PortRemoved { port_id: PortId },
    StateAdded { child_id: StateId },
    StateRemoved { child_id: StateId },
    StartStateChanged { start_state_id: Option<StateId> },
    TransitionAdded { transition_id: TransitionId },
    TransitionRemoved { transition_id: TransitionId },
    DataFlowAdded { data_flow_id: DataFlowId },
    DataFlowRemoved { data_flow_id: DataFlowId },
    StateTypeChanged { state_type: StateType },
    RootStateReplaced,
}

/// Notification published by state machines and the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateMachineEvent {
    /// A state of a state machine was modified
    StateChanged {
        state_machine_id: Uuid,
        state_id: StateId,
        change: ChangeKind,
    },

    /// The dirty flag of a state machine flipped
    DirtyFlagChanged { state_machine_id: Uuid, dirty: bool },

    /// The execution engine changed its status
    ExecutionStatusChanged { status: ExecutionStatus },

    /// A state started executing
    StateEntered { state_id: StateId, name: String },

    /// A state finished executing
    StateFinished {
        state_id: StateId,
        name: String,
        outcome: Outcome,
    },
}

/// Broadcast channel for [`StateMachineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateMachineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: StateMachineEvent) {
        // No receivers is the normal case when nobody observes.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateMachineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(StateMachineEvent::ExecutionStatusChanged {
            status: ExecutionStatus::Running,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(StateMachineEvent::StateEntered {
            state_id: "ABCDEF".to_string(),
            name: "Worker".to_string(),
        });

        match rx.recv().await.unwrap() {
            StateMachineEvent::StateEntered { state_id, .. } => assert_eq!(state_id, "ABCDEF"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = StateMachineEvent::StateChanged {
            state_machine_id: Uuid::nil(),
            state_id: "ABCDEF".to_string(),
            change: ChangeKind::OutcomeAdded { outcome_id: 3 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["change"]["kind"], "outcome_added");
    }
}
