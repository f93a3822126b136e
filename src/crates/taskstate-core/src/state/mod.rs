//! The polymorphic [`State`] node.
//!
//! Every node of a state machine is a `State`: an identity (`state_id`, `name`), typed
//! input and output ports, outcomes, a back-reference to its parent, and a variant
//! payload ([`StateKind`]):
//!
//! | variant | payload | runs |
//! |---|---|---|
//! | `Execution` | logic reference | user [`StateLogic`] |
//! | `Hierarchy` | [`Container`] with start state | one child at a time, driven by transitions |
//! | `PreemptiveConcurrency` | [`Container`] | all children, first to finish wins |
//! | `BarrierConcurrency` | [`Container`] | all children, then the optional decider |
//! | `Decider` | logic reference | user [`DeciderLogic`] over the barrier results |
//! | `Library` | [`LibraryReference`] | the resolved sub-hierarchy |
//!
//! Containers own their children through `Arc<State>`. A running engine holds a
//! snapshot of the root `Arc`, and edits copy the path to the edited node on write,
//! so a running tree is never observed half-mutated.
//!
//! Every mutator validates first and commits only on success.
//!
//! # Example
//!
//! ```rust
//! use taskstate_core::{DataType, State};
//!
//! let mut root = State::hierarchy("Root");
//! let worker = State::execution("Worker");
//! let worker_id = root.add_state(worker).unwrap();
//! root.set_start_state(Some(&worker_id)).unwrap();
//! root.add_transition(&worker_id, 0, None, Some(0)).unwrap();
//! assert!(root.validate().is_ok());
//! ```

mod change_type;
mod concurrency;
mod container;
mod execution;
mod hierarchy;
mod library;

pub use concurrency::{BarrierResults, ChildResult};
pub use container::Container;
pub use execution::{
    decider_fn, logic_fn, DeciderLogic, LogicBinding, LogicOutput, LogicRegistry, StateLogic,
};
pub use library::{LibraryError, LibraryReference, LibraryResolver};

use crate::context::ExecutionContext;
use crate::error::{Result, ValidationError};
use crate::event::StateMachineEvent;
use crate::outcome::{self, Outcome, OutcomeId, RESERVED_OUTCOMES};
use crate::port::{DataMap, DataPort, DataType, PortDirection, PortId};
use crate::transition::TransitionTarget;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::debug;

/// Identifier of a state, unique among its siblings
pub type StateId = String;

const STATE_ID_LENGTH: usize = 6;

/// Generate a random state id of six uppercase letters
pub fn generate_state_id() -> StateId {
    let mut rng = rand::thread_rng();
    (0..STATE_ID_LENGTH)
        .map(|_| rng.gen_range(b'A'..=b'Z') as char)
        .collect()
}

/// Check that `state_id` can name a directory in a saved state machine
///
/// Ids must be a single normal path component: not empty, no separators,
/// not `.` or `..`.
pub fn validate_state_id(state_id: &str) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(ValidationError::InvalidStateId {
            state_id: state_id.to_string(),
            reason: reason.to_string(),
        }
        .into())
    };
    if state_id.is_empty() {
        return invalid("id is empty");
    }
    if state_id.contains(['/', '\\']) {
        return invalid("id contains a path separator");
    }
    let mut components = Path::new(state_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == state_id => Ok(()),
        _ => invalid("id is not a plain name"),
    }
}

/// Type tag of a [`State`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    Execution,
    Hierarchy,
    PreemptiveConcurrency,
    BarrierConcurrency,
    Decider,
    Library,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Execution => "execution",
            StateType::Hierarchy => "hierarchy",
            StateType::PreemptiveConcurrency => "preemptive_concurrency",
            StateType::BarrierConcurrency => "barrier_concurrency",
            StateType::Decider => "decider",
            StateType::Library => "library",
        }
    }

    /// Whether states of this type own children
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            StateType::Hierarchy | StateType::PreemptiveConcurrency | StateType::BarrierConcurrency
        )
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            StateType::PreemptiveConcurrency | StateType::BarrierConcurrency
        )
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant payload of a [`State`]
#[derive(Clone)]
pub enum StateKind {
    Execution(LogicBinding<dyn StateLogic>),
    Hierarchy(Container),
    PreemptiveConcurrency(Container),
    BarrierConcurrency(Container),
    Decider(LogicBinding<dyn DeciderLogic>),
    Library(LibraryReference),
}

impl StateKind {
    pub fn state_type(&self) -> StateType {
        match self {
            StateKind::Execution(_) => StateType::Execution,
            StateKind::Hierarchy(_) => StateType::Hierarchy,
            StateKind::PreemptiveConcurrency(_) => StateType::PreemptiveConcurrency,
            StateKind::BarrierConcurrency(_) => StateType::BarrierConcurrency,
            StateKind::Decider(_) => StateType::Decider,
            StateKind::Library(_) => StateType::Library,
        }
    }
}

impl fmt::Debug for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Execution(binding) => f.debug_tuple("Execution").field(binding).finish(),
            StateKind::Hierarchy(c) => f.debug_tuple("Hierarchy").field(c).finish(),
            StateKind::PreemptiveConcurrency(c) => {
                f.debug_tuple("PreemptiveConcurrency").field(c).finish()
            }
            StateKind::BarrierConcurrency(c) => {
                f.debug_tuple("BarrierConcurrency").field(c).finish()
            }
            StateKind::Decider(binding) => f.debug_tuple("Decider").field(binding).finish(),
            StateKind::Library(reference) => f.debug_tuple("Library").field(reference).finish(),
        }
    }
}

/// Result of running a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOutput {
    /// Outcome the state finished with
    pub outcome: Outcome,
    /// Values of the output ports, keyed by port name
    pub output: DataMap,
    /// Fault message when the state finished with the synthetic error outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateOutput {
    pub fn new(outcome: Outcome, output: DataMap) -> Self {
        Self {
            outcome,
            output,
            error: None,
        }
    }

    pub fn preempted() -> Self {
        Self::new(Outcome::preempted(), DataMap::new())
    }

    /// Synthetic error outcome: `aborted` carrying the fault message
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::aborted(),
            output: DataMap::new(),
            error: Some(message.into()),
        }
    }

    pub fn outcome_id(&self) -> OutcomeId {
        self.outcome.outcome_id
    }

    pub fn is_preempted(&self) -> bool {
        self.outcome.is_preempted()
    }
}

/// A node of a state machine
#[derive(Clone)]
pub struct State {
    state_id: StateId,
    name: String,
    parent_id: Option<StateId>,
    input_data_ports: BTreeMap<PortId, DataPort>,
    output_data_ports: BTreeMap<PortId, DataPort>,
    outcomes: BTreeMap<OutcomeId, Outcome>,
    kind: StateKind,
}

impl State {
    fn with_kind(name: impl Into<String>, kind: StateKind) -> Self {
        let outcomes = RESERVED_OUTCOMES
            .iter()
            .map(|(id, name)| (*id, Outcome::new(*id, *name)))
            .collect();
        Self {
            state_id: generate_state_id(),
            name: name.into(),
            parent_id: None,
            input_data_ports: BTreeMap::new(),
            output_data_ports: BTreeMap::new(),
            outcomes,
            kind,
        }
    }

    /// Leaf state running user logic
    pub fn execution(name: impl Into<String>) -> Self {
        Self::with_kind(name, StateKind::Execution(LogicBinding::default()))
    }

    /// Execution state bound to a logic instance
    pub fn execution_with_logic(name: impl Into<String>, logic: Arc<dyn StateLogic>) -> Self {
        Self::with_kind(name, StateKind::Execution(LogicBinding::bound(logic)))
    }

    pub fn hierarchy(name: impl Into<String>) -> Self {
        Self::with_kind(name, StateKind::Hierarchy(Container::default()))
    }

    pub fn preemptive_concurrency(name: impl Into<String>) -> Self {
        Self::with_kind(name, StateKind::PreemptiveConcurrency(Container::default()))
    }

    pub fn barrier_concurrency(name: impl Into<String>) -> Self {
        Self::with_kind(name, StateKind::BarrierConcurrency(Container::default()))
    }

    /// Decider of a barrier concurrency state
    pub fn decider(name: impl Into<String>) -> Self {
        Self::with_kind(name, StateKind::Decider(LogicBinding::default()))
    }

    pub fn decider_with_logic(name: impl Into<String>, logic: Arc<dyn DeciderLogic>) -> Self {
        Self::with_kind(name, StateKind::Decider(LogicBinding::bound(logic)))
    }

    /// Reference to a sub-hierarchy resolved at run time
    pub fn library(
        name: impl Into<String>,
        library_path: impl Into<String>,
        library_name: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            StateKind::Library(LibraryReference::new(library_path, library_name)),
        )
    }

    /// Replace the generated id.
    ///
    /// Only meaningful before the state is added to a parent.
    pub fn with_id(mut self, state_id: impl Into<StateId>) -> Self {
        self.state_id = state_id.into();
        self
    }

    pub(crate) fn from_parts(
        state_id: StateId,
        name: String,
        input_data_ports: BTreeMap<PortId, DataPort>,
        output_data_ports: BTreeMap<PortId, DataPort>,
        outcomes: BTreeMap<OutcomeId, Outcome>,
        kind: StateKind,
    ) -> Self {
        Self {
            state_id,
            name,
            parent_id: None,
            input_data_ports,
            output_data_ports,
            outcomes,
            kind,
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn is_root_state(&self) -> bool {
        self.parent_id.is_none()
    }

    pub(crate) fn set_parent_id(&mut self, parent_id: Option<StateId>) {
        self.parent_id = parent_id;
    }

    pub fn state_type(&self) -> StateType {
        self.kind.state_type()
    }

    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn input_data_ports(&self) -> &BTreeMap<PortId, DataPort> {
        &self.input_data_ports
    }

    pub fn output_data_ports(&self) -> &BTreeMap<PortId, DataPort> {
        &self.output_data_ports
    }

    pub fn outcomes(&self) -> &BTreeMap<OutcomeId, Outcome> {
        &self.outcomes
    }

    pub fn outcome(&self, outcome_id: OutcomeId) -> Option<&Outcome> {
        self.outcomes.get(&outcome_id)
    }

    pub fn input_port_by_name(&self, name: &str) -> Option<&DataPort> {
        self.input_data_ports.values().find(|p| p.name == name)
    }

    pub fn output_port_by_name(&self, name: &str) -> Option<&DataPort> {
        self.output_data_ports.values().find(|p| p.name == name)
    }

    /// Look up a port of either direction by id
    pub fn data_port(&self, port_id: PortId) -> Option<(PortDirection, &DataPort)> {
        self.input_data_ports
            .get(&port_id)
            .map(|p| (PortDirection::Input, p))
            .or_else(|| {
                self.output_data_ports
                    .get(&port_id)
                    .map(|p| (PortDirection::Output, p))
            })
    }

    /// Name of the logic referenced by an execution or decider state
    pub fn logic_name(&self) -> Option<&str> {
        match &self.kind {
            StateKind::Execution(binding) => binding.name(),
            StateKind::Decider(binding) => binding.name(),
            _ => None,
        }
    }

    pub fn library_reference(&self) -> Option<&LibraryReference> {
        match &self.kind {
            StateKind::Library(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn container(&self) -> Option<&Container> {
        match &self.kind {
            StateKind::Hierarchy(c)
            | StateKind::PreemptiveConcurrency(c)
            | StateKind::BarrierConcurrency(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut Container> {
        match &mut self.kind {
            StateKind::Hierarchy(c)
            | StateKind::PreemptiveConcurrency(c)
            | StateKind::BarrierConcurrency(c) => Some(c),
            _ => None,
        }
    }

    /// Children of a container state, ordered by id
    pub fn children(&self) -> impl Iterator<Item = &State> + '_ {
        self.container()
            .into_iter()
            .flat_map(|c| c.states().values().map(|s| s.as_ref()))
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Reference logic by registry name
    pub fn set_logic_name(&mut self, name: impl Into<String>) -> Result<()> {
        match &mut self.kind {
            StateKind::Execution(binding) => binding.set_name(name.into()),
            StateKind::Decider(binding) => binding.set_name(name.into()),
            _ => {
                return Err(ValidationError::InvalidStateType {
                    state_id: self.state_id.clone(),
                    state_type: self.state_type().to_string(),
                    reason: "only execution and decider states reference logic".to_string(),
                }
                .into())
            }
        }
        Ok(())
    }

    /// Bind a logic instance to an execution state
    pub fn bind_logic(&mut self, logic: Arc<dyn StateLogic>) -> Result<()> {
        match &mut self.kind {
            StateKind::Execution(binding) => {
                binding.bind(logic);
                Ok(())
            }
            _ => Err(ValidationError::InvalidStateType {
                state_id: self.state_id.clone(),
                state_type: self.state_type().to_string(),
                reason: "state logic can only be bound to execution states".to_string(),
            }
            .into()),
        }
    }

    /// Bind a decider instance to a decider state
    pub fn bind_decider(&mut self, logic: Arc<dyn DeciderLogic>) -> Result<()> {
        match &mut self.kind {
            StateKind::Decider(binding) => {
                binding.bind(logic);
                Ok(())
            }
            _ => Err(ValidationError::InvalidStateType {
                state_id: self.state_id.clone(),
                state_type: self.state_type().to_string(),
                reason: "decider logic can only be bound to decider states".to_string(),
            }
            .into()),
        }
    }

    // ---- outcomes ----

    /// Add an outcome.
    ///
    /// Without an explicit id the next free positive id is assigned.
    pub fn add_outcome(
        &mut self,
        name: impl Into<String>,
        outcome_id: Option<OutcomeId>,
    ) -> Result<OutcomeId> {
        let name = name.into();
        let outcome_id = match outcome_id {
            Some(id) => id,
            None => self
                .outcomes
                .keys()
                .next_back()
                .map_or(1, |max| (*max + 1).max(1)),
        };
        if self.outcomes.contains_key(&outcome_id) {
            return Err(ValidationError::DuplicateOutcome {
                state_id: self.state_id.clone(),
                outcome_id,
            }
            .into());
        }
        if self.outcomes.values().any(|o| o.name == name) {
            return Err(ValidationError::DuplicateName {
                state_id: self.state_id.clone(),
                kind: "outcome",
                name,
            }
            .into());
        }
        self.outcomes
            .insert(outcome_id, Outcome::new(outcome_id, name));
        Ok(outcome_id)
    }

    /// Remove an outcome and the transitions of this state's container targeting it.
    ///
    /// Transitions of the parent leaving this state through the outcome are the parent's
    /// to clean up ([`State::purge_outcome_references`]).
    pub fn remove_outcome(&mut self, outcome_id: OutcomeId) -> Result<Outcome> {
        if outcome::is_reserved(outcome_id) {
            return Err(ValidationError::ReservedOutcome { outcome_id }.into());
        }
        let removed = self.outcomes.remove(&outcome_id).ok_or_else(|| {
            ValidationError::OutcomeNotFound {
                state_id: self.state_id.clone(),
                outcome_id,
            }
        })?;
        let owner_id = self.state_id.clone();
        if let Some(container) = self.container_mut() {
            container.transitions.retain(|_, t| {
                !matches!(
                    t.target(&owner_id),
                    Some(TransitionTarget::Outcome(o)) if o == outcome_id
                )
            });
        }
        Ok(removed)
    }

    // ---- data ports ----

    pub fn add_input_data_port(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        default_value: Option<Value>,
    ) -> Result<PortId> {
        let port_id = self.next_port_id();
        self.add_data_port(
            PortDirection::Input,
            DataPort::new(port_id, name, data_type, default_value),
        )
    }

    pub fn add_output_data_port(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        default_value: Option<Value>,
    ) -> Result<PortId> {
        let port_id = self.next_port_id();
        self.add_data_port(
            PortDirection::Output,
            DataPort::new(port_id, name, data_type, default_value),
        )
    }

    /// Add a fully specified port, keeping its id
    pub fn add_data_port(&mut self, direction: PortDirection, port: DataPort) -> Result<PortId> {
        if self.data_port(port.data_port_id).is_some() {
            return Err(ValidationError::DuplicatePortId {
                state_id: self.state_id.clone(),
                port_id: port.data_port_id,
            }
            .into());
        }
        let ports = match direction {
            PortDirection::Input => &self.input_data_ports,
            PortDirection::Output => &self.output_data_ports,
        };
        if ports.values().any(|p| p.name == port.name) {
            return Err(ValidationError::DuplicateName {
                state_id: self.state_id.clone(),
                kind: direction.label(),
                name: port.name,
            }
            .into());
        }
        if let Some(default) = &port.default_value {
            if !port.data_type.accepts(default) {
                return Err(ValidationError::InvalidDefaultValue {
                    name: port.name,
                    data_type: port.data_type.to_string(),
                }
                .into());
            }
        }

        let port_id = port.data_port_id;
        match direction {
            PortDirection::Input => self.input_data_ports.insert(port_id, port),
            PortDirection::Output => self.output_data_ports.insert(port_id, port),
        };
        Ok(port_id)
    }

    /// Remove a port of either direction and the data flows of this state's
    /// container attached to it
    pub fn remove_data_port(&mut self, port_id: PortId) -> Result<DataPort> {
        let removed = self
            .input_data_ports
            .remove(&port_id)
            .or_else(|| self.output_data_ports.remove(&port_id))
            .ok_or_else(|| ValidationError::PortNotFound {
                state_id: self.state_id.clone(),
                port_id,
            })?;
        let owner_id = self.state_id.clone();
        if let Some(container) = self.container_mut() {
            container.data_flows.retain(|_, df| {
                !(df.from_state == owner_id && df.from_key == port_id
                    || df.to_state == owner_id && df.to_key == port_id)
            });
        }
        Ok(removed)
    }

    pub fn remove_input_data_port(&mut self, port_id: PortId) -> Result<DataPort> {
        if !self.input_data_ports.contains_key(&port_id) {
            return Err(ValidationError::PortNotFound {
                state_id: self.state_id.clone(),
                port_id,
            }
            .into());
        }
        self.remove_data_port(port_id)
    }

    pub fn remove_output_data_port(&mut self, port_id: PortId) -> Result<DataPort> {
        if !self.output_data_ports.contains_key(&port_id) {
            return Err(ValidationError::PortNotFound {
                state_id: self.state_id.clone(),
                port_id,
            }
            .into());
        }
        self.remove_data_port(port_id)
    }

    fn next_port_id(&self) -> PortId {
        let max_in = self.input_data_ports.keys().next_back().copied();
        let max_out = self.output_data_ports.keys().next_back().copied();
        max_in.max(max_out).map_or(0, |max| max + 1)
    }

    // ---- execution ----

    /// Run this state with the given input values.
    ///
    /// Faults of the state's own logic are reported as the error outcome. An `Err`
    /// means the structure itself could not be executed (unconnected outcome, missing
    /// start state).
    pub fn run<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        input: DataMap,
    ) -> BoxFuture<'a, Result<StateOutput>> {
        Box::pin(async move {
            if ctx.checkpoint().await.is_err() {
                let output = StateOutput::preempted();
                self.notify_finished(ctx, &output);
                return Ok(output);
            }
            self.notify_entered(ctx);

            let output = match &self.kind {
                StateKind::Execution(binding) => self.run_execution(ctx, binding, input).await,
                StateKind::Decider(binding) => {
                    self.run_decider_logic(ctx, binding, input, &BarrierResults::default())
                        .await
                }
                StateKind::Hierarchy(container) => {
                    self.run_hierarchy(ctx, container, input).await?
                }
                StateKind::PreemptiveConcurrency(container) => {
                    self.run_preemptive(ctx, container, input).await?
                }
                StateKind::BarrierConcurrency(container) => {
                    self.run_barrier(ctx, container, input).await?
                }
                StateKind::Library(reference) => self.run_library(ctx, reference, input).await?,
            };

            self.notify_finished(ctx, &output);
            Ok(output)
        })
    }

    pub(crate) fn notify_entered(&self, ctx: &ExecutionContext) {
        debug!(state_id = %self.state_id, name = %self.name, state_type = %self.state_type(), "Entering state");
        ctx.events().publish(StateMachineEvent::StateEntered {
            state_id: self.state_id.clone(),
            name: self.name.clone(),
        });
    }

    pub(crate) fn notify_finished(&self, ctx: &ExecutionContext, output: &StateOutput) {
        debug!(
            state_id = %self.state_id,
            outcome_id = output.outcome.outcome_id,
            outcome = %output.outcome.name,
            "State finished"
        );
        ctx.events().publish(StateMachineEvent::StateFinished {
            state_id: self.state_id.clone(),
            name: self.name.clone(),
            outcome: output.outcome.clone(),
        });
    }

    /// Apply defaults to missing inputs and type-check the result.
    ///
    /// Keys without a matching input port are ignored.
    pub(crate) fn prepare_inputs(&self, mut input: DataMap) -> std::result::Result<DataMap, String> {
        let mut prepared = DataMap::new();
        for port in self.input_data_ports.values() {
            let value = match input.remove(&port.name) {
                Some(v) if !v.is_null() => v,
                _ => port.default_or_null(),
            };
            if !port.data_type.accepts(&value) {
                return Err(format!(
                    "input '{}' expects {} but received {}",
                    port.name, port.data_type, value
                ));
            }
            prepared.insert(port.name.clone(), value);
        }
        for key in input.keys() {
            debug!(state_id = %self.state_id, key = %key, "Ignoring input without a port");
        }
        Ok(prepared)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("state_id", &self.state_id)
            .field("name", &self.name)
            .field("parent_id", &self.parent_id)
            .field("input_data_ports", &self.input_data_ports)
            .field("output_data_ports", &self.output_data_ports)
            .field("outcomes", &self.outcomes)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Structural equality: ids, names, ports, outcomes, type, references and children.
/// Bound logic instances are not compared.
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        if self.state_id != other.state_id
            || self.name != other.name
            || self.input_data_ports != other.input_data_ports
            || self.output_data_ports != other.output_data_ports
            || self.outcomes != other.outcomes
            || self.state_type() != other.state_type()
            || self.logic_name() != other.logic_name()
            || self.library_reference() != other.library_reference()
        {
            return false;
        }
        self.container() == other.container()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskStateError;
    use serde_json::json;

    fn validation(err: TaskStateError) -> ValidationError {
        err.as_validation().cloned().expect("validation error")
    }

    #[test]
    fn test_generated_ids() {
        let id = generate_state_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_uppercase()));
        assert!(validate_state_id(&id).is_ok());
    }

    #[test]
    fn test_state_ids_must_be_plain_names() {
        assert!(validate_state_id("ROOT").is_ok());
        assert!(validate_state_id("node.v2").is_ok());
        for bad in ["", ".", "..", "../x", "a/b", "/abs", "a\\b"] {
            let err = validation(validate_state_id(bad).unwrap_err());
            assert!(
                matches!(err, ValidationError::InvalidStateId { .. }),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_new_state_has_reserved_outcomes() {
        let state = State::execution("Worker");
        assert!(state.is_root_state());
        assert_eq!(state.state_type(), StateType::Execution);
        let ids: Vec<_> = state.outcomes().keys().copied().collect();
        assert_eq!(ids, vec![outcome::PREEMPTED, outcome::ABORTED, outcome::SUCCESS]);
    }

    #[test]
    fn test_add_outcome_assigns_next_id() {
        let mut state = State::execution("Worker");
        assert_eq!(state.add_outcome("done", None).unwrap(), 1);
        assert_eq!(state.add_outcome("custom", Some(7)).unwrap(), 7);
        assert_eq!(state.add_outcome("next", None).unwrap(), 8);
    }

    #[test]
    fn test_duplicate_outcome_rejected() {
        let mut state = State::execution("Worker");
        state.add_outcome("done", Some(3)).unwrap();

        let err = validation(state.add_outcome("other", Some(3)).unwrap_err());
        assert!(matches!(err, ValidationError::DuplicateOutcome { outcome_id: 3, .. }));

        let err = validation(state.add_outcome("done", None).unwrap_err());
        assert!(matches!(err, ValidationError::DuplicateName { kind: "outcome", .. }));
        assert_eq!(state.outcomes().len(), 4);
    }

    #[test]
    fn test_reserved_outcome_cannot_be_removed() {
        let mut state = State::execution("Worker");
        let err = validation(state.remove_outcome(outcome::SUCCESS).unwrap_err());
        assert_eq!(err, ValidationError::ReservedOutcome { outcome_id: 0 });
    }

    #[test]
    fn test_port_names_unique_per_direction() {
        let mut state = State::execution("Worker");
        let input = state
            .add_input_data_port("x", DataType::Float, Some(json!(3.0)))
            .unwrap();
        let output = state.add_output_data_port("x", DataType::Int, None).unwrap();
        assert_ne!(input, output);

        let err = validation(
            state
                .add_input_data_port("x", DataType::Int, None)
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::DuplicateName { kind: "input port", .. }));
    }

    #[test]
    fn test_default_must_match_type() {
        let mut state = State::execution("Worker");
        let err = validation(
            state
                .add_input_data_port("x", DataType::Int, Some(json!("three")))
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::InvalidDefaultValue { .. }));
        assert!(state.input_data_ports().is_empty());
    }

    #[test]
    fn test_duplicate_port_id() {
        let mut state = State::execution("Worker");
        state
            .add_data_port(PortDirection::Input, DataPort::new(4, "a", DataType::Int, None))
            .unwrap();
        let err = validation(
            state
                .add_data_port(PortDirection::Output, DataPort::new(4, "b", DataType::Int, None))
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::DuplicatePortId { port_id: 4, .. }));
    }

    #[test]
    fn test_prepare_inputs_applies_defaults() {
        let mut state = State::execution("Worker");
        state
            .add_input_data_port("x", DataType::Float, Some(json!(3.0)))
            .unwrap();
        state.add_input_data_port("y", DataType::Int, None).unwrap();

        let prepared = state.prepare_inputs(DataMap::new()).unwrap();
        assert_eq!(prepared["x"], json!(3.0));
        assert_eq!(prepared["y"], Value::Null);

        let mut input = DataMap::new();
        input.insert("y".to_string(), json!("nope"));
        assert!(state.prepare_inputs(input).is_err());
    }

    #[test]
    fn test_logic_name_only_on_logic_states() {
        let mut state = State::hierarchy("Root");
        assert!(state.set_logic_name("noop").is_err());

        let mut worker = State::execution("Worker");
        worker.set_logic_name("noop").unwrap();
        assert_eq!(worker.logic_name(), Some("noop"));
    }
}
