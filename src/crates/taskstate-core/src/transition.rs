//! Transitions and data flows: the routing links inside a container state.

use crate::outcome::OutcomeId;
use crate::port::PortId;
use crate::state::StateId;
use serde::{Deserialize, Serialize};

/// Identifier of a transition, unique within its container
pub type TransitionId = u64;

/// Identifier of a data flow, unique within its container
pub type DataFlowId = u64;

/// Directed edge from `(from_state, from_outcome)` to a sibling or to the container boundary.
///
/// A `to_state` of `None` (or equal to the container's own id) leaves the container
/// through `to_outcome`. Otherwise `to_outcome` must be `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub transition_id: TransitionId,
    pub from_state: StateId,
    pub from_outcome: OutcomeId,
    pub to_state: Option<StateId>,
    pub to_outcome: Option<OutcomeId>,
}

/// Resolved target of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionTarget<'a> {
    /// Continue with a sibling state
    State(&'a str),
    /// Leave the container with one of its own outcomes
    Outcome(OutcomeId),
}

impl Transition {
    /// Resolve the target relative to the container `owner_id`.
    ///
    /// Returns `None` for a malformed transition (neither a sibling nor a boundary outcome).
    pub fn target(&self, owner_id: &str) -> Option<TransitionTarget<'_>> {
        match (&self.to_state, self.to_outcome) {
            (Some(to), None) if to != owner_id => Some(TransitionTarget::State(to.as_str())),
            (Some(to), Some(outcome)) if to == owner_id => Some(TransitionTarget::Outcome(outcome)),
            (None, Some(outcome)) => Some(TransitionTarget::Outcome(outcome)),
            _ => None,
        }
    }
}

/// Directed edge moving a value between two ports of the same container scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFlow {
    pub data_flow_id: DataFlowId,
    pub from_state: StateId,
    pub from_key: PortId,
    pub to_state: StateId,
    pub to_key: PortId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(to_state: Option<&str>, to_outcome: Option<OutcomeId>) -> Transition {
        Transition {
            transition_id: 1,
            from_state: "CHILD".to_string(),
            from_outcome: 0,
            to_state: to_state.map(str::to_string),
            to_outcome,
        }
    }

    #[test]
    fn test_target_resolution() {
        assert_eq!(
            transition(Some("OTHER"), None).target("PARENT"),
            Some(TransitionTarget::State("OTHER"))
        );
        assert_eq!(
            transition(None, Some(3)).target("PARENT"),
            Some(TransitionTarget::Outcome(3))
        );
        assert_eq!(
            transition(Some("PARENT"), Some(3)).target("PARENT"),
            Some(TransitionTarget::Outcome(3))
        );
        assert_eq!(transition(Some("OTHER"), Some(3)).target("PARENT"), None);
        assert_eq!(transition(None, None).target("PARENT"), None);
    }
}
