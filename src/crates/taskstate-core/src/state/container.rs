//! Children, transitions and data flows of composite states.

use super::{validate_state_id, State, StateId, StateKind, StateType};
use crate::config::BarrierDefaultOutcome;
use crate::error::{Result, ValidationError};
use crate::outcome::OutcomeId;
use crate::port::{DataPort, PortDirection, PortId};
use crate::transition::{DataFlow, DataFlowId, Transition, TransitionId, TransitionTarget};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Children and wiring of a composite state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub(crate) states: BTreeMap<StateId, Arc<State>>,
    pub(crate) start_state_id: Option<StateId>,
    pub(crate) transitions: BTreeMap<TransitionId, Transition>,
    pub(crate) data_flows: BTreeMap<DataFlowId, DataFlow>,
}

impl Container {
    pub fn states(&self) -> &BTreeMap<StateId, Arc<State>> {
        &self.states
    }

    pub fn state(&self, state_id: &str) -> Option<&Arc<State>> {
        self.states.get(state_id)
    }

    pub fn start_state_id(&self) -> Option<&str> {
        self.start_state_id.as_deref()
    }

    pub fn transitions(&self) -> &BTreeMap<TransitionId, Transition> {
        &self.transitions
    }

    pub fn data_flows(&self) -> &BTreeMap<DataFlowId, DataFlow> {
        &self.data_flows
    }

    /// The transition leaving `state_id` through `outcome_id`, if any
    pub fn transition_from(&self, state_id: &str, outcome_id: OutcomeId) -> Option<&Transition> {
        self.transitions
            .values()
            .find(|t| t.from_state == state_id && t.from_outcome == outcome_id)
    }

    /// The decider child of a barrier state
    pub fn decider(&self) -> Option<&Arc<State>> {
        self.states
            .values()
            .find(|s| s.state_type() == StateType::Decider)
    }

    fn next_transition_id(&self) -> TransitionId {
        self.transitions.keys().next_back().map_or(0, |max| max + 1)
    }

    fn next_data_flow_id(&self) -> DataFlowId {
        self.data_flows.keys().next_back().map_or(0, |max| max + 1)
    }

    /// Drop all transitions and data flows touching `state_id`
    pub(crate) fn detach(&mut self, state_id: &str) {
        self.transitions
            .retain(|_, t| t.from_state != state_id && t.to_state.as_deref() != Some(state_id));
        self.data_flows
            .retain(|_, df| df.from_state != state_id && df.to_state != state_id);
        if self.start_state_id.as_deref() == Some(state_id) {
            self.start_state_id = None;
        }
    }
}

impl State {
    fn not_a_container(&self) -> ValidationError {
        ValidationError::NotAContainer {
            state_id: self.state_id.clone(),
        }
    }

    fn require_container(&self) -> Result<&Container> {
        self.container().ok_or_else(|| self.not_a_container().into())
    }

    fn invalid_transition(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidTransition {
            state_id: self.state_id.clone(),
            reason: reason.into(),
        }
    }

    fn invalid_data_flow(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidDataFlow {
            state_id: self.state_id.clone(),
            reason: reason.into(),
        }
    }

    // ---- children ----

    /// Add a child state, returning its id
    pub fn add_state(&mut self, mut child: State) -> Result<StateId> {
        let container = self.require_container()?;
        let child_id = child.state_id.clone();
        validate_state_id(&child_id)?;
        if child_id == self.state_id || container.states.contains_key(&child_id) {
            return Err(ValidationError::DuplicateStateId {
                parent_id: self.state_id.clone(),
                state_id: child_id,
            }
            .into());
        }
        if child.state_type() == StateType::Decider {
            if self.state_type() != StateType::BarrierConcurrency {
                return Err(ValidationError::InvalidStateType {
                    state_id: child_id,
                    state_type: StateType::Decider.to_string(),
                    reason: "deciders are only allowed inside barrier concurrency states"
                        .to_string(),
                }
                .into());
            }
            if container.decider().is_some() {
                return Err(ValidationError::InvalidStateType {
                    state_id: child_id,
                    state_type: StateType::Decider.to_string(),
                    reason: format!("state '{}' already has a decider", self.state_id),
                }
                .into());
            }
        }

        child.set_parent_id(Some(self.state_id.clone()));
        let parent_id = self.state_id.clone();
        let container = self
            .container_mut()
            .ok_or(ValidationError::NotAContainer { state_id: parent_id })?;
        container.states.insert(child_id.clone(), Arc::new(child));
        Ok(child_id)
    }

    /// Remove a child with its transitions and data flows
    pub fn remove_state(&mut self, state_id: &str) -> Result<State> {
        let owner_id = self.state_id.clone();
        let container = self
            .container_mut()
            .ok_or(ValidationError::NotAContainer {
                state_id: owner_id,
            })?;
        let removed = container
            .states
            .remove(state_id)
            .ok_or_else(|| ValidationError::StateNotFound {
                state_id: state_id.to_string(),
            })?;
        container.detach(state_id);

        let mut removed = Arc::try_unwrap(removed).unwrap_or_else(|shared| (*shared).clone());
        removed.set_parent_id(None);
        Ok(removed)
    }

    /// Swap a direct child for another state with the same id, keeping its wiring
    pub(crate) fn replace_child(&mut self, mut child: State) -> Result<()> {
        let owner_id = self.state_id.clone();
        let container = self
            .container_mut()
            .ok_or_else(|| ValidationError::NotAContainer {
                state_id: owner_id.clone(),
            })?;
        if !container.states.contains_key(&child.state_id) {
            return Err(ValidationError::StateNotFound {
                state_id: child.state_id.clone(),
            }
            .into());
        }
        child.set_parent_id(Some(owner_id));
        container.states.insert(child.state_id.clone(), Arc::new(child));
        Ok(())
    }

    /// Set or clear the start state of a hierarchy
    pub fn set_start_state(&mut self, state_id: Option<&str>) -> Result<()> {
        if self.state_type() != StateType::Hierarchy {
            return Err(match self.state_type() {
                t if t.is_concurrency() => ValidationError::InvalidStateType {
                    state_id: self.state_id.clone(),
                    state_type: t.to_string(),
                    reason: "concurrency states have no start state".to_string(),
                },
                _ => self.not_a_container(),
            }
            .into());
        }
        let container = self.require_container()?;
        if let Some(id) = state_id {
            if !container.states.contains_key(id) {
                return Err(ValidationError::StateNotFound {
                    state_id: id.to_string(),
                }
                .into());
            }
        }
        if let Some(container) = self.container_mut() {
            container.start_state_id = state_id.map(str::to_string);
        }
        Ok(())
    }

    // ---- transitions ----

    /// Connect `(from_state, from_outcome)` to a sibling or to an outcome of this state
    pub fn add_transition(
        &mut self,
        from_state: &str,
        from_outcome: OutcomeId,
        to_state: Option<&str>,
        to_outcome: Option<OutcomeId>,
    ) -> Result<TransitionId> {
        let transition_id = self.require_container()?.next_transition_id();
        self.insert_transition(Transition {
            transition_id,
            from_state: from_state.to_string(),
            from_outcome,
            to_state: to_state.map(str::to_string),
            to_outcome,
        })
    }

    /// Insert a transition keeping its id
    pub fn insert_transition(&mut self, transition: Transition) -> Result<TransitionId> {
        self.check_transition(&transition)?;
        let transition_id = transition.transition_id;
        if let Some(container) = self.container_mut() {
            container.transitions.insert(transition_id, transition);
        }
        Ok(transition_id)
    }

    fn check_transition(&self, t: &Transition) -> Result<()> {
        let container = self.require_container()?;
        if container.transitions.contains_key(&t.transition_id) {
            return Err(self
                .invalid_transition(format!("transition id {} is already used", t.transition_id))
                .into());
        }

        let from = container.states.get(&t.from_state).ok_or_else(|| {
            self.invalid_transition(format!("origin state '{}' is not a child", t.from_state))
        })?;
        if from.outcome(t.from_outcome).is_none() {
            return Err(self
                .invalid_transition(format!(
                    "state '{}' has no outcome {}",
                    t.from_state, t.from_outcome
                ))
                .into());
        }
        if container
            .transition_from(&t.from_state, t.from_outcome)
            .is_some()
        {
            return Err(self
                .invalid_transition(format!(
                    "outcome {} of state '{}' is already connected",
                    t.from_outcome, t.from_state
                ))
                .into());
        }

        match t.target(&self.state_id) {
            Some(TransitionTarget::State(to)) => {
                if self.state_type().is_concurrency() {
                    return Err(self
                        .invalid_transition(
                            "concurrency states only allow transitions to their own outcomes",
                        )
                        .into());
                }
                if !container.states.contains_key(to) {
                    return Err(self
                        .invalid_transition(format!("target state '{}' is not a child", to))
                        .into());
                }
            }
            Some(TransitionTarget::Outcome(outcome_id)) => {
                if self.outcome(outcome_id).is_none() {
                    return Err(self
                        .invalid_transition(format!("target outcome {} does not exist", outcome_id))
                        .into());
                }
            }
            None => {
                return Err(self
                    .invalid_transition(
                        "target must be either a sibling state or an outcome of the parent",
                    )
                    .into())
            }
        }
        Ok(())
    }

    pub fn remove_transition(&mut self, transition_id: TransitionId) -> Result<Transition> {
        let owner_id = self.state_id.clone();
        let invalid = self.invalid_transition(format!("transition {} does not exist", transition_id));
        let container = self
            .container_mut()
            .ok_or(ValidationError::NotAContainer { state_id: owner_id })?;
        container
            .transitions
            .remove(&transition_id)
            .ok_or_else(|| invalid.into())
    }

    // ---- data flows ----

    /// Connect a port to a port within this state's scope
    pub fn add_data_flow(
        &mut self,
        from_state: &str,
        from_key: PortId,
        to_state: &str,
        to_key: PortId,
    ) -> Result<DataFlowId> {
        let data_flow_id = self.require_container()?.next_data_flow_id();
        self.insert_data_flow(DataFlow {
            data_flow_id,
            from_state: from_state.to_string(),
            from_key,
            to_state: to_state.to_string(),
            to_key,
        })
    }

    /// Insert a data flow keeping its id
    pub fn insert_data_flow(&mut self, data_flow: DataFlow) -> Result<DataFlowId> {
        self.check_data_flow(&data_flow)?;
        let data_flow_id = data_flow.data_flow_id;
        if let Some(container) = self.container_mut() {
            container.data_flows.insert(data_flow_id, data_flow);
        }
        Ok(data_flow_id)
    }

    fn check_data_flow(&self, df: &DataFlow) -> Result<()> {
        let container = self.require_container()?;
        if container.data_flows.contains_key(&df.data_flow_id) {
            return Err(self
                .invalid_data_flow(format!("data flow id {} is already used", df.data_flow_id))
                .into());
        }
        if df.from_state == df.to_state && df.from_state != self.state_id {
            return Err(self
                .invalid_data_flow(format!("state '{}' cannot feed itself", df.from_state))
                .into());
        }

        // Sources: own inputs or child outputs. Targets: child inputs or own outputs.
        let source = self.scoped_port(container, &df.from_state, df.from_key, true)?;
        let target = self.scoped_port(container, &df.to_state, df.to_key, false)?;
        if !source.data_type.flows_into(target.data_type) {
            return Err(self
                .invalid_data_flow(format!(
                    "type {} of '{}' does not flow into type {} of '{}'",
                    source.data_type, source.name, target.data_type, target.name
                ))
                .into());
        }

        let duplicate = container.data_flows.values().any(|existing| {
            existing.from_state == df.from_state
                && existing.from_key == df.from_key
                && existing.to_state == df.to_state
                && existing.to_key == df.to_key
        });
        if duplicate {
            return Err(self.invalid_data_flow("an identical data flow exists").into());
        }
        Ok(())
    }

    fn scoped_port<'a>(
        &'a self,
        container: &'a Container,
        state_id: &str,
        port_id: PortId,
        is_source: bool,
    ) -> Result<&'a DataPort> {
        let (state, expected) = if state_id == self.state_id {
            let own = if is_source {
                PortDirection::Input
            } else {
                PortDirection::Output
            };
            (self, own)
        } else {
            let child = container.states.get(state_id).ok_or_else(|| {
                self.invalid_data_flow(format!("state '{}' is not in scope", state_id))
            })?;
            let child_dir = if is_source {
                PortDirection::Output
            } else {
                PortDirection::Input
            };
            (child.as_ref(), child_dir)
        };
        match state.data_port(port_id) {
            Some((direction, port)) if direction == expected => Ok(port),
            Some((direction, _)) => Err(self
                .invalid_data_flow(format!(
                    "port {} of '{}' is an {}, expected an {}",
                    port_id,
                    state_id,
                    direction.label(),
                    expected.label()
                ))
                .into()),
            None => Err(ValidationError::PortNotFound {
                state_id: state_id.to_string(),
                port_id,
            }
            .into()),
        }
    }

    pub fn remove_data_flow(&mut self, data_flow_id: DataFlowId) -> Result<DataFlow> {
        let owner_id = self.state_id.clone();
        let invalid = self.invalid_data_flow(format!("data flow {} does not exist", data_flow_id));
        let container = self
            .container_mut()
            .ok_or(ValidationError::NotAContainer { state_id: owner_id })?;
        container
            .data_flows
            .remove(&data_flow_id)
            .ok_or_else(|| invalid.into())
    }

    /// Drop transitions leaving `child_id` through an outcome it no longer declares
    pub(crate) fn purge_outcome_references(&mut self, child_id: &str, outcome_id: OutcomeId) {
        if let Some(container) = self.container_mut() {
            container
                .transitions
                .retain(|_, t| !(t.from_state == child_id && t.from_outcome == outcome_id));
        }
    }

    /// Drop data flows attached to a port `child_id` no longer declares
    pub(crate) fn purge_port_references(&mut self, child_id: &str, port_id: PortId) {
        if let Some(container) = self.container_mut() {
            container.data_flows.retain(|_, df| {
                !(df.from_state == child_id && df.from_key == port_id
                    || df.to_state == child_id && df.to_key == port_id)
            });
        }
    }

    // ---- lookup ----

    /// Find a state by id in this subtree, including this state
    pub fn get_state(&self, state_id: &str) -> Option<&State> {
        if self.state_id == state_id {
            return Some(self);
        }
        let container = self.container()?;
        if let Some(child) = container.states.get(state_id) {
            return Some(child);
        }
        container
            .states
            .values()
            .find_map(|child| child.get_state(state_id))
    }

    /// Mutable lookup, copying shared nodes on the path
    pub fn get_state_mut(&mut self, state_id: &str) -> Option<&mut State> {
        if self.state_id == state_id {
            return Some(self);
        }
        let container = self.container_mut()?;
        let holder = container
            .states
            .iter()
            .find(|(_, child)| child.get_state(state_id).is_some())
            .map(|(id, _)| id.clone())?;
        let child = container.states.get_mut(&holder)?;
        Arc::make_mut(child).get_state_mut(state_id)
    }

    /// The container state holding `state_id` as a direct child
    pub fn parent_of(&self, state_id: &str) -> Option<&State> {
        let container = self.container()?;
        if container.states.contains_key(state_id) {
            return Some(self);
        }
        container
            .states
            .values()
            .find_map(|child| child.parent_of(state_id))
    }

    pub(crate) fn parent_of_mut(&mut self, state_id: &str) -> Option<&mut State> {
        let parent_id = self.parent_of(state_id)?.state_id.clone();
        self.get_state_mut(&parent_id)
    }

    // ---- static validation ----

    /// Check the connectivity invariant over the whole subtree
    pub fn validate(&self) -> Result<()> {
        if let Some(container) = self.container() {
            self.check_connectivity(container, BarrierDefaultOutcome::default())?;
            for child in container.states.values() {
                child.validate()?;
            }
        }
        Ok(())
    }

    /// Every child outcome that can occur here resolves to a transition or is a
    /// boundary outcome of this state.
    ///
    /// Hierarchies require a valid start state and check the children reachable from
    /// it. Preemptive states check every child. Barrier states check their decider, or
    /// every child when the configured policy routes the first child's outcome.
    pub(crate) fn check_connectivity(
        &self,
        container: &Container,
        policy: BarrierDefaultOutcome,
    ) -> Result<()> {
        let candidates: Vec<&Arc<State>> = match &self.kind {
            StateKind::Hierarchy(_) => self.reachable_children(container)?,
            StateKind::PreemptiveConcurrency(_) => container.states.values().collect(),
            StateKind::BarrierConcurrency(_) => match container.decider() {
                Some(decider) => vec![decider],
                None if policy == BarrierDefaultOutcome::FirstChild => {
                    container.states.values().collect()
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        };

        for child in candidates {
            for outcome_id in child.outcomes.keys() {
                if container.transition_from(&child.state_id, *outcome_id).is_none()
                    && !self.outcomes.contains_key(outcome_id)
                {
                    return Err(ValidationError::UnconnectedOutcome {
                        state_id: self.state_id.clone(),
                        child_id: child.state_id.clone(),
                        outcome_id: *outcome_id,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn reachable_children<'a>(&self, container: &'a Container) -> Result<Vec<&'a Arc<State>>> {
        let start = container
            .start_state_id
            .as_deref()
            .and_then(|id| container.states.get(id))
            .ok_or_else(|| ValidationError::NoStartState {
                state_id: self.state_id.clone(),
            })?;

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        let mut reachable = Vec::new();
        while let Some(child) = queue.pop_front() {
            if !seen.insert(child.state_id.as_str()) {
                continue;
            }
            reachable.push(child);
            for transition in container.transitions.values() {
                if transition.from_state != child.state_id {
                    continue;
                }
                if let Some(TransitionTarget::State(next)) = transition.target(&self.state_id) {
                    if let Some(next) = container.states.get(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        Ok(reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskStateError;
    use crate::port::DataType;

    fn validation(err: TaskStateError) -> ValidationError {
        err.as_validation().cloned().expect("validation error")
    }

    fn worker(id: &str) -> State {
        State::execution(id).with_id(id)
    }

    #[test]
    fn test_add_and_remove_children() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_state(worker("A")).unwrap();
        root.add_state(worker("B")).unwrap();
        assert_eq!(root.children().count(), 2);
        assert_eq!(root.get_state("A").unwrap().parent_id(), Some("ROOT"));

        let err = validation(root.add_state(worker("A")).unwrap_err());
        assert!(matches!(err, ValidationError::DuplicateStateId { .. }));
        for bad in ["../x", "a/b", "", "/abs"] {
            let err = validation(root.add_state(worker(bad)).unwrap_err());
            assert!(matches!(err, ValidationError::InvalidStateId { .. }));
        }
        assert_eq!(root.children().count(), 2);

        root.set_start_state(Some("A")).unwrap();
        root.add_transition("A", 0, Some("B"), None).unwrap();
        let removed = root.remove_state("A").unwrap();
        assert!(removed.is_root_state());

        let container = root.container().unwrap();
        assert!(container.transitions().is_empty());
        assert_eq!(container.start_state_id(), None);
    }

    #[test]
    fn test_execution_state_has_no_children() {
        let mut leaf = worker("A");
        let err = validation(leaf.add_state(worker("B")).unwrap_err());
        assert!(matches!(err, ValidationError::NotAContainer { .. }));
    }

    #[test]
    fn test_decider_placement() {
        let mut hierarchy = State::hierarchy("H");
        let err = validation(hierarchy.add_state(State::decider("D")).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidStateType { .. }));

        let mut barrier = State::barrier_concurrency("B");
        barrier.add_state(State::decider("D1").with_id("D1")).unwrap();
        let err = validation(barrier.add_state(State::decider("D2").with_id("D2")).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidStateType { .. }));
    }

    #[test]
    fn test_single_transition_per_outcome() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_state(worker("A")).unwrap();
        root.add_state(worker("B")).unwrap();

        root.add_transition("A", 0, Some("B"), None).unwrap();
        let err = validation(root.add_transition("A", 0, None, Some(0)).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidTransition { .. }));
        assert_eq!(root.container().unwrap().transitions().len(), 1);
    }

    #[test]
    fn test_transition_endpoints_checked() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_state(worker("A")).unwrap();

        assert!(root.add_transition("X", 0, None, Some(0)).is_err());
        assert!(root.add_transition("A", 42, None, Some(0)).is_err());
        assert!(root.add_transition("A", 0, Some("X"), None).is_err());
        assert!(root.add_transition("A", 0, None, Some(42)).is_err());
        assert!(root.add_transition("A", 0, None, None).is_err());
        assert!(root.add_transition("A", 0, Some("ROOT"), Some(0)).is_ok());
    }

    #[test]
    fn test_no_sibling_transitions_in_concurrency() {
        let mut root = State::preemptive_concurrency("Root");
        root.add_state(worker("A")).unwrap();
        root.add_state(worker("B")).unwrap();

        let err = validation(root.add_transition("A", 0, Some("B"), None).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidTransition { .. }));
        assert!(root.set_start_state(Some("A")).is_err());
    }

    #[test]
    fn test_data_flow_scope_and_types() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        let root_in = root.add_input_data_port("x", DataType::Int, None).unwrap();
        let root_out = root.add_output_data_port("y", DataType::Str, None).unwrap();

        let mut a = worker("A");
        let a_in = a.add_input_data_port("x", DataType::Float, None).unwrap();
        let a_out = a.add_output_data_port("y", DataType::Float, None).unwrap();
        root.add_state(a).unwrap();

        root.add_data_flow("ROOT", root_in, "A", a_in).unwrap();

        // wrong direction
        let err = validation(root.add_data_flow("A", a_in, "ROOT", root_out).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidDataFlow { .. }));
        // incompatible types
        let err = validation(root.add_data_flow("A", a_out, "ROOT", root_out).unwrap_err());
        assert!(matches!(err, ValidationError::InvalidDataFlow { .. }));
        // out of scope
        assert!(root.add_data_flow("Z", 0, "A", a_in).is_err());
        // duplicate
        assert!(root.add_data_flow("ROOT", root_in, "A", a_in).is_err());
    }

    #[test]
    fn test_removing_port_drops_flows() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        let root_in = root.add_input_data_port("x", DataType::Int, None).unwrap();
        let mut a = worker("A");
        let a_in = a.add_input_data_port("x", DataType::Int, None).unwrap();
        root.add_state(a).unwrap();
        root.add_data_flow("ROOT", root_in, "A", a_in).unwrap();

        root.remove_data_port(root_in).unwrap();
        assert!(root.container().unwrap().data_flows().is_empty());
    }

    #[test]
    fn test_validate_requires_start_state() {
        let mut root = State::hierarchy("Root");
        root.add_state(worker("A")).unwrap();
        let err = validation(root.validate().unwrap_err());
        assert!(matches!(err, ValidationError::NoStartState { .. }));
    }

    #[test]
    fn test_validate_reports_unconnected_outcome() {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        let mut a = worker("A");
        a.add_outcome("done", Some(5)).unwrap();
        root.add_state(a).unwrap();
        root.set_start_state(Some("A")).unwrap();

        let err = validation(root.validate().unwrap_err());
        assert_eq!(
            err,
            ValidationError::UnconnectedOutcome {
                state_id: "ROOT".to_string(),
                child_id: "A".to_string(),
                outcome_id: 5,
            }
        );

        root.add_transition("A", 5, None, Some(0)).unwrap();
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_unreachable_children_are_not_checked() {
        let mut root = State::hierarchy("Root");
        root.add_state(worker("A")).unwrap();
        let mut orphan = worker("B");
        orphan.add_outcome("lost", Some(9)).unwrap();
        root.add_state(orphan).unwrap();
        root.set_start_state(Some("A")).unwrap();
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_nested_lookup_and_copy_on_write() {
        let mut inner = State::hierarchy("Inner").with_id("INNER");
        inner.add_state(worker("LEAF")).unwrap();
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_state(inner).unwrap();

        let snapshot = Arc::new(root.clone());
        root.get_state_mut("LEAF").unwrap().set_name("Renamed");

        assert_eq!(root.get_state("LEAF").unwrap().name(), "Renamed");
        assert_eq!(snapshot.get_state("LEAF").unwrap().name(), "LEAF");
        assert_eq!(root.parent_of("LEAF").unwrap().state_id(), "INNER");
        assert!(root.parent_of("ROOT").is_none());
    }
}
