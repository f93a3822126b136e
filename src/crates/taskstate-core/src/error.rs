//! Error types for state machine editing and execution
//!
//! Errors are split by the layer that raises them:
//!
//! ```text
//! TaskStateError
//! ├── Validation     - Structural edits rejected before anything is committed
//! ├── Engine         - Invalid engine call ordering (no active machine, busy machine)
//! ├── Execution      - Failures that cannot be expressed as an outcome
//! ├── Serialization  - JSON errors
//! ├── Yaml           - YAML errors (configuration)
//! ├── Io             - File system errors
//! └── Configuration  - Invalid configuration values
//! ```
//!
//! A fault inside user logic is *not* an error at this level: it is converted into the
//! synthetic ERROR outcome of the failing state (see [`crate::outcome::ABORTED`]) so the
//! surrounding composite can route it like any other outcome.
//!
//! # Example
//!
//! ```rust
//! use taskstate_core::error::{TaskStateError, ValidationError};
//! use taskstate_core::{DataType, State};
//!
//! let mut state = State::execution("Worker");
//! state.add_input_data_port("x", DataType::Float, None).unwrap();
//!
//! match state.add_input_data_port("x", DataType::Float, None) {
//!     Err(TaskStateError::Validation(ValidationError::DuplicateName { name, .. })) => {
//!         assert_eq!(name, "x");
//!     }
//!     other => panic!("unexpected result: {:?}", other),
//! }
//! ```

use crate::outcome::OutcomeId;
use crate::port::PortId;
use thiserror::Error;

/// Convenience result type using [`TaskStateError`]
pub type Result<T> = std::result::Result<T, TaskStateError>;

/// Umbrella error for all operations of this crate
#[derive(Error, Debug)]
pub enum TaskStateError {
    /// A structural edit or a structural precondition of `run` was violated
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The execution engine was driven in an invalid order
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Execution failed in a way that cannot be routed as an outcome
    #[error("Execution of state '{state_id}' failed: {reason}")]
    Execution {
        /// State in which the failure surfaced
        state_id: String,
        /// Failure description
        reason: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TaskStateError {
    /// Create an execution error with state context
    pub fn execution(state_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            state_id: state_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns the wrapped validation error, if any
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the wrapped engine error, if any
    pub fn as_engine(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }
}

/// Structural errors raised synchronously by mutating calls.
///
/// When one of these is returned no change has been committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A port or outcome name is already used in the same scope
    #[error("State '{state_id}' already has a {kind} named '{name}'")]
    DuplicateName {
        state_id: String,
        /// What kind of element clashed ("input port", "output port", "outcome")
        kind: &'static str,
        name: String,
    },

    /// An outcome id is already taken
    #[error("State '{state_id}' already has an outcome with id {outcome_id}")]
    DuplicateOutcome { state_id: String, outcome_id: OutcomeId },

    /// A data port id is already taken
    #[error("State '{state_id}' already has a data port with id {port_id}")]
    DuplicatePortId { state_id: String, port_id: PortId },

    /// A child with the same id already exists in the container
    #[error("State '{parent_id}' already contains a child with id '{state_id}'")]
    DuplicateStateId { parent_id: String, state_id: String },

    /// State id unusable as a single path component
    #[error("Invalid state id '{state_id}': {reason}")]
    InvalidStateId { state_id: String, reason: String },

    /// Transition rejected
    #[error("Invalid transition in state '{state_id}': {reason}")]
    InvalidTransition { state_id: String, reason: String },

    /// Data flow rejected
    #[error("Invalid data flow in state '{state_id}': {reason}")]
    InvalidDataFlow { state_id: String, reason: String },

    /// Hierarchy has no (valid) start state
    #[error("Hierarchy state '{state_id}' has no valid start state")]
    NoStartState { state_id: String },

    /// A reachable child outcome has neither a transition nor a matching boundary outcome
    #[error("Outcome {outcome_id} of state '{child_id}' is not connected in '{state_id}'")]
    UnconnectedOutcome {
        state_id: String,
        child_id: String,
        outcome_id: OutcomeId,
    },

    /// Referenced state does not exist
    #[error("State '{state_id}' not found")]
    StateNotFound { state_id: String },

    /// Referenced data port does not exist
    #[error("State '{state_id}' has no data port with id {port_id}")]
    PortNotFound { state_id: String, port_id: PortId },

    /// Referenced outcome does not exist
    #[error("State '{state_id}' has no outcome with id {outcome_id}")]
    OutcomeNotFound { state_id: String, outcome_id: OutcomeId },

    /// Reserved outcomes cannot be added or removed explicitly
    #[error("Outcome {outcome_id} is reserved")]
    ReservedOutcome { outcome_id: OutcomeId },

    /// Default value does not match the declared port type
    #[error("Default value of port '{name}' does not match type {data_type}")]
    InvalidDefaultValue { name: String, data_type: String },

    /// State type not allowed in this context
    #[error("State '{state_id}' cannot be a {state_type}: {reason}")]
    InvalidStateType {
        state_id: String,
        state_type: String,
        reason: String,
    },

    /// Operation requires a container state
    #[error("State '{state_id}' is not a container state")]
    NotAContainer { state_id: String },
}

/// Errors that guard the ordering of engine and manager calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `start` was called without an active state machine
    #[error("No active state machine")]
    NoActiveStateMachine,

    /// The state machine is running and cannot be modified or replaced
    #[error("State machine {state_machine_id} is busy")]
    StateMachineBusy { state_machine_id: String },

    /// Unknown state machine id
    #[error("State machine {state_machine_id} not found")]
    StateMachineNotFound { state_machine_id: String },

    /// The requested control needs a running execution
    #[error("Execution engine is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::DuplicateOutcome {
            state_id: "ABCDEF".to_string(),
            outcome_id: 3,
        };
        assert_eq!(
            err.to_string(),
            "State 'ABCDEF' already has an outcome with id 3"
        );
    }

    #[test]
    fn test_umbrella_is_transparent() {
        let err: TaskStateError = EngineError::NoActiveStateMachine.into();
        assert_eq!(err.to_string(), "No active state machine");
        assert_eq!(err.as_engine(), Some(&EngineError::NoActiveStateMachine));
        assert!(err.as_validation().is_none());
    }

    #[test]
    fn test_execution_helper() {
        let err = TaskStateError::execution("root", "join failed");
        assert_eq!(err.to_string(), "Execution of state 'root' failed: join failed");
    }
}
