//! State machines: a root state plus identity, persistence metadata and the dirty flag.
//!
//! Structural edits go through [`StateMachine::edit`], which rejects edits while the
//! machine runs and returns a [`StateEditor`] bound to one state. Every successful
//! editor call marks the machine dirty and publishes a change event.

use crate::error::{EngineError, Result, ValidationError};
use crate::event::{ChangeKind, EventBus, StateMachineEvent};
use crate::outcome::{Outcome, OutcomeId};
use crate::port::{DataPort, DataType, PortId};
use crate::state::{State, StateId, StateType};
use crate::transition::{DataFlow, DataFlowId, Transition, TransitionId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A named tree of states that can be executed and persisted
#[derive(Debug)]
pub struct StateMachine {
    state_machine_id: Uuid,
    root_state: Arc<State>,
    creation_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    file_system_path: Option<PathBuf>,
    marked_dirty: bool,
    running: Arc<AtomicBool>,
    events: EventBus,
}

impl StateMachine {
    pub fn new(mut root_state: State) -> Self {
        root_state.set_parent_id(None);
        let now = Utc::now();
        Self {
            state_machine_id: Uuid::new_v4(),
            root_state: Arc::new(root_state),
            creation_time: now,
            last_update: now,
            file_system_path: None,
            marked_dirty: false,
            running: Arc::new(AtomicBool::new(false)),
            events: EventBus::default(),
        }
    }

    pub fn with_id(mut self, state_machine_id: Uuid) -> Self {
        self.state_machine_id = state_machine_id;
        self
    }

    pub fn with_timestamps(mut self, creation_time: DateTime<Utc>, last_update: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self.last_update = last_update;
        self
    }

    /// Publish change events on a shared bus instead of a private one
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn state_machine_id(&self) -> Uuid {
        self.state_machine_id
    }

    pub fn root_state(&self) -> &State {
        &self.root_state
    }

    /// Shared snapshot of the root, used by the engine for a run
    pub fn root_snapshot(&self) -> Arc<State> {
        Arc::clone(&self.root_state)
    }

    pub fn get_state(&self, state_id: &str) -> Option<&State> {
        self.root_state.get_state(state_id)
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn file_system_path(&self) -> Option<&Path> {
        self.file_system_path.as_deref()
    }

    pub fn set_file_system_path(&mut self, path: impl Into<PathBuf>) {
        self.file_system_path = Some(path.into());
    }

    pub fn marked_dirty(&self) -> bool {
        self.marked_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.set_dirty(true);
    }

    /// Called after a successful save
    pub fn clear_dirty(&mut self) {
        self.set_dirty(false);
    }

    fn set_dirty(&mut self, dirty: bool) {
        if self.marked_dirty != dirty {
            self.marked_dirty = dirty;
            self.events.publish(StateMachineEvent::DirtyFlagChanged {
                state_machine_id: self.state_machine_id,
                dirty,
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateMachineEvent> {
        self.events.subscribe()
    }

    fn ensure_not_running(&self) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::StateMachineBusy {
                state_machine_id: self.state_machine_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Check the connectivity invariant of the whole tree
    pub fn validate(&self) -> Result<()> {
        self.root_state.validate()
    }

    /// Start editing the state `state_id`
    pub fn edit(&mut self, state_id: &str) -> Result<StateEditor<'_>> {
        self.ensure_not_running()?;
        if self.root_state.get_state(state_id).is_none() {
            return Err(ValidationError::StateNotFound {
                state_id: state_id.to_string(),
            }
            .into());
        }
        Ok(StateEditor {
            machine: self,
            state_id: state_id.to_string(),
        })
    }

    /// Replace a state by a copy of another variant, in place at its parent's slot
    pub fn change_state_type(&mut self, state_id: &str, target: StateType) -> Result<()> {
        self.ensure_not_running()?;
        let state = self
            .root_state
            .get_state(state_id)
            .ok_or_else(|| ValidationError::StateNotFound {
                state_id: state_id.to_string(),
            })?;
        let parent = self.root_state.parent_of(state_id);
        if target == StateType::Decider {
            let other_decider = parent
                .and_then(|p| p.container())
                .and_then(|c| c.decider())
                .filter(|d| d.state_id() != state_id);
            if let Some(other) = other_decider {
                return Err(ValidationError::InvalidStateType {
                    state_id: state_id.to_string(),
                    state_type: target.to_string(),
                    reason: format!("sibling '{}' is already the decider", other.state_id()),
                }
                .into());
            }
        }
        let converted = state.change_state_type(target, parent.map(State::state_type))?;

        let root = Arc::make_mut(&mut self.root_state);
        match root.parent_of_mut(state_id) {
            Some(parent) => parent.replace_child(converted)?,
            None => *root = converted,
        }
        debug!(state_id = %state_id, state_type = %target, "Changed state type");
        self.record_change(state_id, ChangeKind::StateTypeChanged { state_type: target });
        Ok(())
    }

    /// Swap the whole tree
    pub fn replace_root_state(&mut self, mut root_state: State) -> Result<()> {
        self.ensure_not_running()?;
        root_state.set_parent_id(None);
        let state_id = root_state.state_id().to_string();
        self.root_state = Arc::new(root_state);
        self.record_change(&state_id, ChangeKind::RootStateReplaced);
        Ok(())
    }

    fn record_change(&mut self, state_id: &str, change: ChangeKind) {
        self.last_update = Utc::now();
        self.events.publish(StateMachineEvent::StateChanged {
            state_machine_id: self.state_machine_id,
            state_id: state_id.to_string(),
            change,
        });
        self.mark_dirty();
    }
}

/// Mutating handle on one state of a [`StateMachine`]
pub struct StateEditor<'a> {
    machine: &'a mut StateMachine,
    state_id: StateId,
}

impl StateEditor<'_> {
    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    /// Current view of the edited state
    pub fn state(&self) -> Option<&State> {
        self.machine.root_state.get_state(&self.state_id)
    }

    fn apply<T>(&mut self, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let root = Arc::make_mut(&mut self.machine.root_state);
        let state = root
            .get_state_mut(&self.state_id)
            .ok_or_else(|| ValidationError::StateNotFound {
                state_id: self.state_id.clone(),
            })?;
        op(state)
    }

    fn changed(&mut self, change: ChangeKind) {
        self.machine.record_change(&self.state_id, change);
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let applied = name.clone();
        self.apply(|state| {
            state.set_name(applied);
            Ok(())
        })?;
        self.changed(ChangeKind::NameChanged { name });
        Ok(())
    }

    pub fn set_logic_name(&mut self, name: impl Into<String>) -> Result<()> {
        let logic = name.into();
        let applied = logic.clone();
        self.apply(|state| state.set_logic_name(applied))?;
        self.changed(ChangeKind::LogicChanged { logic });
        Ok(())
    }

    pub fn add_outcome(&mut self, name: impl Into<String>, outcome_id: Option<OutcomeId>) -> Result<OutcomeId> {
        let name = name.into();
        let outcome_id = self.apply(|state| state.add_outcome(name, outcome_id))?;
        self.changed(ChangeKind::OutcomeAdded { outcome_id });
        Ok(outcome_id)
    }

    /// Remove an outcome, together with the parent's transitions leaving through it
    pub fn remove_outcome(&mut self, outcome_id: OutcomeId) -> Result<Outcome> {
        let removed = self.apply(|state| state.remove_outcome(outcome_id))?;
        let root = Arc::make_mut(&mut self.machine.root_state);
        if let Some(parent) = root.parent_of_mut(&self.state_id) {
            parent.purge_outcome_references(&self.state_id, outcome_id);
        }
        self.changed(ChangeKind::OutcomeRemoved { outcome_id });
        Ok(removed)
    }

    pub fn add_input_data_port(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        default_value: Option<Value>,
    ) -> Result<PortId> {
        let name = name.into();
        let port_id = self.apply(|state| state.add_input_data_port(name, data_type, default_value))?;
        self.changed(ChangeKind::InputPortAdded { port_id });
        Ok(port_id)
    }

    pub fn add_output_data_port(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        default_value: Option<Value>,
    ) -> Result<PortId> {
        let name = name.into();
        let port_id = self.apply(|state| state.add_output_data_port(name, data_type, default_value))?;
        self.changed(ChangeKind::OutputPortAdded { port_id });
        Ok(port_id)
    }

    /// Remove a port, together with the parent's data flows attached to it
    pub fn remove_data_port(&mut self, port_id: PortId) -> Result<DataPort> {
        let removed = self.apply(|state| state.remove_data_port(port_id))?;
        let root = Arc::make_mut(&mut self.machine.root_state);
        if let Some(parent) = root.parent_of_mut(&self.state_id) {
            parent.purge_port_references(&self.state_id, port_id);
        }
        self.changed(ChangeKind::PortRemoved { port_id });
        Ok(removed)
    }

    pub fn add_state(&mut self, child: State) -> Result<StateId> {
        let child_id = self.apply(|state| state.add_state(child))?;
        self.changed(ChangeKind::StateAdded {
            child_id: child_id.clone(),
        });
        Ok(child_id)
    }

    pub fn remove_state(&mut self, child_id: &str) -> Result<State> {
        let removed = self.apply(|state| state.remove_state(child_id))?;
        self.changed(ChangeKind::StateRemoved {
            child_id: child_id.to_string(),
        });
        Ok(removed)
    }

    pub fn set_start_state(&mut self, start_state_id: Option<&str>) -> Result<()> {
        self.apply(|state| state.set_start_state(start_state_id))?;
        self.changed(ChangeKind::StartStateChanged {
            start_state_id: start_state_id.map(str::to_string),
        });
        Ok(())
    }

    pub fn add_transition(
        &mut self,
        from_state: &str,
        from_outcome: OutcomeId,
        to_state: Option<&str>,
        to_outcome: Option<OutcomeId>,
    ) -> Result<TransitionId> {
        let transition_id =
            self.apply(|state| state.add_transition(from_state, from_outcome, to_state, to_outcome))?;
        self.changed(ChangeKind::TransitionAdded { transition_id });
        Ok(transition_id)
    }

    pub fn remove_transition(&mut self, transition_id: TransitionId) -> Result<Transition> {
        let removed = self.apply(|state| state.remove_transition(transition_id))?;
        self.changed(ChangeKind::TransitionRemoved { transition_id });
        Ok(removed)
    }

    pub fn add_data_flow(
        &mut self,
        from_state: &str,
        from_key: PortId,
        to_state: &str,
        to_key: PortId,
    ) -> Result<DataFlowId> {
        let data_flow_id =
            self.apply(|state| state.add_data_flow(from_state, from_key, to_state, to_key))?;
        self.changed(ChangeKind::DataFlowAdded { data_flow_id });
        Ok(data_flow_id)
    }

    pub fn remove_data_flow(&mut self, data_flow_id: DataFlowId) -> Result<DataFlow> {
        let removed = self.apply(|state| state.remove_data_flow(data_flow_id))?;
        self.changed(ChangeKind::DataFlowRemoved { data_flow_id });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskStateError;

    fn machine() -> StateMachine {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_state(State::execution("Child").with_id("CHILD")).unwrap();
        root.set_start_state(Some("CHILD")).unwrap();
        StateMachine::new(root)
    }

    #[test]
    fn test_edit_marks_dirty_and_notifies() {
        let mut sm = machine();
        let mut rx = sm.subscribe();
        assert!(!sm.marked_dirty());

        let outcome_id = sm.edit("CHILD").unwrap().add_outcome("done", None).unwrap();
        assert_eq!(outcome_id, 1);
        assert!(sm.marked_dirty());

        match rx.try_recv().unwrap() {
            StateMachineEvent::StateChanged { state_id, change, .. } => {
                assert_eq!(state_id, "CHILD");
                assert_eq!(change, ChangeKind::OutcomeAdded { outcome_id: 1 });
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            StateMachineEvent::DirtyFlagChanged { dirty: true, .. }
        ));
    }

    #[test]
    fn test_failed_edit_changes_nothing() {
        let mut sm = machine();
        let err = sm
            .edit("CHILD")
            .unwrap()
            .add_outcome("dup", Some(0))
            .unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::DuplicateOutcome { .. })
        ));
        assert!(!sm.marked_dirty());
    }

    #[test]
    fn test_removing_outcome_removes_parent_transition() {
        let mut sm = machine();
        sm.edit("CHILD").unwrap().add_outcome("done", Some(5)).unwrap();
        sm.edit("ROOT")
            .unwrap()
            .add_transition("CHILD", 5, None, Some(0))
            .unwrap();

        sm.edit("CHILD").unwrap().remove_outcome(5).unwrap();
        let root = sm.root_state().container().unwrap();
        assert!(root.transitions().is_empty());
    }

    #[test]
    fn test_running_machine_rejects_edits() {
        let mut sm = machine();
        sm.running_flag().store(true, Ordering::SeqCst);

        let err = sm.edit("ROOT").err().unwrap();
        assert!(matches!(err, TaskStateError::Engine(EngineError::StateMachineBusy { .. })));
        assert!(sm.change_state_type("CHILD", StateType::Hierarchy).is_err());
    }

    #[test]
    fn test_edit_unknown_state() {
        let mut sm = machine();
        assert!(sm.edit("NOPE").is_err());
    }

    #[test]
    fn test_change_state_type_replaces_in_parent() {
        let mut sm = machine();
        sm.change_state_type("CHILD", StateType::BarrierConcurrency)
            .unwrap();
        let child = sm.get_state("CHILD").unwrap();
        assert_eq!(child.state_type(), StateType::BarrierConcurrency);
        assert_eq!(child.parent_id(), Some("ROOT"));
        assert!(sm.marked_dirty());

        sm.change_state_type("ROOT", StateType::PreemptiveConcurrency)
            .unwrap();
        assert_eq!(sm.root_state().state_type(), StateType::PreemptiveConcurrency);
        assert!(sm.root_state().is_root_state());
    }

    #[test]
    fn test_clear_dirty() {
        let mut sm = machine();
        sm.edit("ROOT").unwrap().set_name("Renamed").unwrap();
        assert_eq!(sm.root_state().name(), "Renamed");
        sm.clear_dirty();
        assert!(!sm.marked_dirty());
    }
}
