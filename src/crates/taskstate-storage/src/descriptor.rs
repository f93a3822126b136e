//! On-disk descriptors: the manifest of a stored state machine and one
//! `core_data` descriptor per state.
//!
//! Descriptors are plain data. Converting a [`State`] into a descriptor never fails;
//! building a state back from a descriptor goes through the model's own validating
//! operations, so a stored tree is accepted only if it could have been built in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskstate_core::{
    validate_state_id, DataFlow, DataFlowId, DataPort, DataType, Outcome, OutcomeId,
    PortDirection, PortId, State, StateId, StateType, TaskStateError, Transition, TransitionId,
};

/// Version written into every manifest
pub const FORMAT_VERSION: u32 = 1;

/// Top-level file of a stored state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub state_machine_id: uuid::Uuid,
    pub root_state_id: StateId,
    pub creation_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub id: PortId,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl From<&DataPort> for PortDescriptor {
    fn from(port: &DataPort) -> Self {
        Self {
            id: port.data_port_id,
            name: port.name.clone(),
            data_type: port.data_type,
            default: port.default_value.clone(),
        }
    }
}

impl From<PortDescriptor> for DataPort {
    fn from(port: PortDescriptor) -> Self {
        DataPort::new(port.id, port.name, port.data_type, port.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDescriptor {
    pub id: OutcomeId,
    pub name: String,
}

impl From<Outcome> for OutcomeDescriptor {
    fn from(outcome: Outcome) -> Self {
        Self {
            id: outcome.outcome_id,
            name: outcome.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDescriptor {
    pub id: TransitionId,
    pub from_state: StateId,
    pub from_outcome: OutcomeId,
    #[serde(default)]
    pub to_state: Option<StateId>,
    #[serde(default)]
    pub to_outcome: Option<OutcomeId>,
}

impl From<&Transition> for TransitionDescriptor {
    fn from(t: &Transition) -> Self {
        Self {
            id: t.transition_id,
            from_state: t.from_state.clone(),
            from_outcome: t.from_outcome,
            to_state: t.to_state.clone(),
            to_outcome: t.to_outcome,
        }
    }
}

impl From<TransitionDescriptor> for Transition {
    fn from(t: TransitionDescriptor) -> Self {
        Transition {
            transition_id: t.id,
            from_state: t.from_state,
            from_outcome: t.from_outcome,
            to_state: t.to_state,
            to_outcome: t.to_outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlowDescriptor {
    pub id: DataFlowId,
    pub from_state: StateId,
    pub from_port: PortId,
    pub to_state: StateId,
    pub to_port: PortId,
}

impl From<&DataFlow> for DataFlowDescriptor {
    fn from(df: &DataFlow) -> Self {
        Self {
            id: df.data_flow_id,
            from_state: df.from_state.clone(),
            from_port: df.from_key,
            to_state: df.to_state.clone(),
            to_port: df.to_key,
        }
    }
}

impl From<DataFlowDescriptor> for DataFlow {
    fn from(df: DataFlowDescriptor) -> Self {
        DataFlow {
            data_flow_id: df.id,
            from_state: df.from_state,
            from_key: df.from_port,
            to_state: df.to_state,
            to_key: df.to_port,
        }
    }
}

/// Contents of one `core_data` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub state_id: StateId,
    pub name: String,
    #[serde(rename = "type")]
    pub state_type: StateType,
    #[serde(default)]
    pub input_data_ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub output_data_ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub outcomes: Vec<OutcomeDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state_id: Option<StateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_flows: Vec<DataFlowDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_name: Option<String>,
}

impl StateDescriptor {
    /// Describe `state` without its children's contents (children are listed by id)
    pub fn describe(state: &State) -> Self {
        let container = state.container();
        let reference = state.library_reference();
        Self {
            state_id: state.state_id().to_string(),
            name: state.name().to_string(),
            state_type: state.state_type(),
            input_data_ports: state.input_data_ports().values().map(Into::into).collect(),
            output_data_ports: state.output_data_ports().values().map(Into::into).collect(),
            outcomes: state.outcomes().values().cloned().map(Into::into).collect(),
            start_state_id: container.and_then(|c| c.start_state_id().map(str::to_string)),
            children: container
                .map(|c| c.states().keys().cloned().collect())
                .unwrap_or_default(),
            transitions: container
                .map(|c| c.transitions().values().map(Into::into).collect())
                .unwrap_or_default(),
            data_flows: container
                .map(|c| c.data_flows().values().map(Into::into).collect())
                .unwrap_or_default(),
            logic: state.logic_name().map(str::to_string),
            library_path: reference.map(|r| r.library_path.clone()),
            library_name: reference.map(|r| r.library_name.clone()),
        }
    }

    /// Build the state this descriptor stands for.
    ///
    /// `children` must hold the already rebuilt children listed in
    /// [`StateDescriptor::children`]. Errors are the model's own validation errors.
    pub fn build(self, children: Vec<State>) -> std::result::Result<State, BuildError> {
        validate_state_id(&self.state_id)?;
        let mut state = match self.state_type {
            StateType::Execution => State::execution(self.name),
            StateType::Hierarchy => State::hierarchy(self.name),
            StateType::PreemptiveConcurrency => State::preemptive_concurrency(self.name),
            StateType::BarrierConcurrency => State::barrier_concurrency(self.name),
            StateType::Decider => State::decider(self.name),
            StateType::Library => {
                let library_path = self.library_path.ok_or(BuildError::Missing("library_path"))?;
                let library_name = self.library_name.ok_or(BuildError::Missing("library_name"))?;
                State::library(self.name, library_path, library_name)
            }
        }
        .with_id(self.state_id);

        if let Some(logic) = self.logic {
            state.set_logic_name(logic)?;
        }
        for port in self.input_data_ports {
            state.add_data_port(PortDirection::Input, port.into())?;
        }
        for port in self.output_data_ports {
            state.add_data_port(PortDirection::Output, port.into())?;
        }
        for outcome in self.outcomes {
            match state.outcome(outcome.id) {
                Some(existing) if existing.name == outcome.name => {}
                Some(existing) => {
                    return Err(BuildError::Invalid(format!(
                        "outcome {} is named '{}', not '{}'",
                        outcome.id, existing.name, outcome.name
                    )))
                }
                None => {
                    state.add_outcome(outcome.name, Some(outcome.id))?;
                }
            }
        }

        if !state.state_type().is_container() {
            if !self.children.is_empty() || !self.transitions.is_empty() || !self.data_flows.is_empty() {
                return Err(BuildError::Invalid(format!(
                    "{} state cannot own children, transitions or data flows",
                    state.state_type()
                )));
            }
            return Ok(state);
        }

        for child in children {
            state.add_state(child)?;
        }
        if self.start_state_id.is_some() {
            state.set_start_state(self.start_state_id.as_deref())?;
        }
        for transition in self.transitions {
            state.insert_transition(transition.into())?;
        }
        for data_flow in self.data_flows {
            state.insert_data_flow(data_flow.into())?;
        }
        Ok(state)
    }
}

/// Why a descriptor could not be turned into a state
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing field '{0}'")]
    Missing(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Model(#[from] TaskStateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> State {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        let input = root
            .add_input_data_port("x", DataType::Int, Some(json!(1)))
            .unwrap();
        let mut step = State::execution("Step").with_id("STEP");
        step.set_logic_name("increment").unwrap();
        let step_in = step.add_input_data_port("x", DataType::Int, None).unwrap();
        step.add_outcome("again", Some(1)).unwrap();
        root.add_state(step).unwrap();
        root.set_start_state(Some("STEP")).unwrap();
        root.add_transition("STEP", 1, Some("STEP"), None).unwrap();
        root.add_data_flow("ROOT", input, "STEP", step_in).unwrap();
        root
    }

    #[test]
    fn test_describe_lists_children_by_id() {
        let descriptor = StateDescriptor::describe(&counter());
        assert_eq!(descriptor.state_type, StateType::Hierarchy);
        assert_eq!(descriptor.children, vec!["STEP".to_string()]);
        assert_eq!(descriptor.start_state_id.as_deref(), Some("STEP"));
        assert_eq!(descriptor.transitions.len(), 1);
        assert_eq!(descriptor.data_flows[0].from_state, "ROOT");
        assert!(descriptor.logic.is_none());
    }

    #[test]
    fn test_rebuild_matches_original() {
        let original = counter();
        let step = original.get_state("STEP").unwrap().clone();
        let rebuilt_step = StateDescriptor::describe(&step).build(Vec::new()).unwrap();
        let rebuilt = StateDescriptor::describe(&original)
            .build(vec![rebuilt_step])
            .unwrap();
        assert_eq!(rebuilt, original);
        assert_eq!(rebuilt.get_state("STEP").unwrap().logic_name(), Some("increment"));
    }

    #[test]
    fn test_dangling_transition_is_rejected() {
        let mut descriptor = StateDescriptor::describe(&counter());
        descriptor.transitions[0].to_state = Some("GONE".to_string());
        let step = StateDescriptor::describe(counter().get_state("STEP").unwrap())
            .build(Vec::new())
            .unwrap();
        assert!(matches!(
            descriptor.build(vec![step]),
            Err(BuildError::Model(_))
        ));
    }

    #[test]
    fn test_port_uses_short_field_names() {
        let port = PortDescriptor::from(&DataPort::new(2, "speed", DataType::Float, Some(json!(0.5))));
        let value = serde_json::to_value(&port).unwrap();
        assert_eq!(value, json!({"id": 2, "name": "speed", "type": "float", "default": 0.5}));
    }

    #[test]
    fn test_library_requires_reference() {
        let mut descriptor = StateDescriptor::describe(&State::library("Lib", "generic", "wait"));
        descriptor.library_name = None;
        assert!(matches!(
            descriptor.build(Vec::new()),
            Err(BuildError::Missing("library_name"))
        ));
    }

    #[test]
    fn test_path_like_state_id_is_rejected() {
        let mut descriptor = StateDescriptor::describe(&State::execution("Step"));
        descriptor.state_id = "../escaped".to_string();
        assert!(matches!(
            descriptor.build(Vec::new()),
            Err(BuildError::Model(_))
        ));
    }
}
