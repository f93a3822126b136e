//! Converting a state to another variant.

use super::{Container, LogicBinding, State, StateKind, StateType};
use crate::error::{Result, TaskStateError, ValidationError};
use crate::transition::TransitionTarget;

impl State {
    /// Build a copy of this state as `target`.
    ///
    /// Identity, ports and outcomes are kept. Children, transitions and data flows are
    /// kept where `target` supports them: concurrency states drop the start state and
    /// sibling transitions, and only barrier states keep a decider child. Logic names
    /// survive conversions between execution and decider states.
    ///
    /// `parent_type` is the type of the state's parent, `None` for a root state.
    pub fn change_state_type(&self, target: StateType, parent_type: Option<StateType>) -> Result<State> {
        let invalid = |reason: &str| -> TaskStateError {
            ValidationError::InvalidStateType {
                state_id: self.state_id.clone(),
                state_type: target.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };

        match target {
            StateType::Library => {
                return Err(invalid("library states are created from a library reference"))
            }
            StateType::Decider if parent_type != Some(StateType::BarrierConcurrency) => {
                return Err(invalid(
                    "deciders are only allowed inside barrier concurrency states",
                ))
            }
            _ => {}
        }
        if target == self.state_type() {
            return Ok(self.clone());
        }

        let logic_name = self.logic_name().map(str::to_string);
        let kind = match target {
            StateType::Execution => {
                StateKind::Execution(logic_name.map(LogicBinding::named).unwrap_or_default())
            }
            StateType::Decider => {
                StateKind::Decider(logic_name.map(LogicBinding::named).unwrap_or_default())
            }
            StateType::Hierarchy => StateKind::Hierarchy(self.rehome_container(target)),
            StateType::PreemptiveConcurrency => {
                StateKind::PreemptiveConcurrency(self.rehome_container(target))
            }
            StateType::BarrierConcurrency => {
                StateKind::BarrierConcurrency(self.rehome_container(target))
            }
            StateType::Library => return Err(invalid("unreachable conversion")),
        };

        let mut converted = State::from_parts(
            self.state_id.clone(),
            self.name.clone(),
            self.input_data_ports.clone(),
            self.output_data_ports.clone(),
            self.outcomes.clone(),
            kind,
        );
        converted.set_parent_id(self.parent_id.clone());
        Ok(converted)
    }

    fn rehome_container(&self, target: StateType) -> Container {
        let Some(source) = self.container() else {
            return Container::default();
        };
        let mut container = source.clone();

        if target != StateType::BarrierConcurrency {
            let deciders: Vec<String> = container
                .states
                .values()
                .filter(|s| s.state_type() == StateType::Decider)
                .map(|s| s.state_id.clone())
                .collect();
            for id in deciders {
                container.states.remove(&id);
                container.detach(&id);
            }
        }

        if target.is_concurrency() {
            container.start_state_id = None;
            let owner_id = self.state_id.as_str();
            container.transitions.retain(|_, t| {
                matches!(t.target(owner_id), Some(TransitionTarget::Outcome(_)))
            });
        }
        container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::DataType;

    fn hierarchy_with_chain() -> State {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        root.add_input_data_port("x", DataType::Int, None).unwrap();
        root.add_state(State::execution("A").with_id("A")).unwrap();
        root.add_state(State::execution("B").with_id("B")).unwrap();
        root.set_start_state(Some("A")).unwrap();
        root.add_transition("A", 0, Some("B"), None).unwrap();
        root.add_transition("B", 0, None, Some(0)).unwrap();
        root
    }

    #[test]
    fn test_hierarchy_to_preemptive_drops_sibling_transitions() {
        let root = hierarchy_with_chain();
        let converted = root
            .change_state_type(StateType::PreemptiveConcurrency, None)
            .unwrap();

        assert_eq!(converted.state_id(), "ROOT");
        assert_eq!(converted.input_data_ports(), root.input_data_ports());
        let container = converted.container().unwrap();
        assert_eq!(container.states().len(), 2);
        assert_eq!(container.start_state_id(), None);
        assert_eq!(container.transitions().len(), 1);
    }

    #[test]
    fn test_container_to_execution_drops_children() {
        let root = hierarchy_with_chain();
        let converted = root.change_state_type(StateType::Execution, None).unwrap();
        assert_eq!(converted.state_type(), StateType::Execution);
        assert!(converted.container().is_none());
        assert_eq!(converted.outcomes(), root.outcomes());
    }

    #[test]
    fn test_execution_to_hierarchy_is_empty_container() {
        let state = State::execution("Leaf");
        let converted = state.change_state_type(StateType::Hierarchy, None).unwrap();
        assert_eq!(converted.children().count(), 0);
    }

    #[test]
    fn test_invalid_targets() {
        let state = State::execution("Leaf");
        assert!(state.change_state_type(StateType::Library, None).is_err());
        assert!(state.change_state_type(StateType::Decider, None).is_err());
        assert!(state
            .change_state_type(StateType::Decider, Some(StateType::Hierarchy))
            .is_err());

        let mut named = State::execution("Leaf");
        named.set_logic_name("decide").unwrap();
        let decider = named
            .change_state_type(StateType::Decider, Some(StateType::BarrierConcurrency))
            .unwrap();
        assert_eq!(decider.logic_name(), Some("decide"));
    }

    #[test]
    fn test_barrier_to_hierarchy_drops_decider() {
        let mut barrier = State::barrier_concurrency("Barrier");
        barrier.add_state(State::execution("A").with_id("A")).unwrap();
        barrier.add_state(State::decider("D").with_id("D")).unwrap();
        barrier.add_transition("D", 0, None, Some(0)).unwrap();

        let converted = barrier.change_state_type(StateType::Hierarchy, None).unwrap();
        let container = converted.container().unwrap();
        assert!(container.state("D").is_none());
        assert!(container.transitions().is_empty());
    }
}
