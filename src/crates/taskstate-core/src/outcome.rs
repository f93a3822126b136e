//! Outcomes: the named exit points of a state.

use serde::{Deserialize, Serialize};

/// Numeric outcome identifier, unique within its owning state
pub type OutcomeId = i64;

/// Regular successful termination
pub const SUCCESS: OutcomeId = 0;

/// Aborted execution; also reported as the synthetic ERROR outcome of a faulting state
pub const ABORTED: OutcomeId = -1;

/// Execution was preempted by a sibling or an external stop
pub const PREEMPTED: OutcomeId = -2;

/// Outcomes present on every state, in id order
pub const RESERVED_OUTCOMES: [(OutcomeId, &str); 3] =
    [(PREEMPTED, "preempted"), (ABORTED, "aborted"), (SUCCESS, "success")];

/// Whether `outcome_id` is one of the reserved outcomes
pub fn is_reserved(outcome_id: OutcomeId) -> bool {
    RESERVED_OUTCOMES.iter().any(|(id, _)| *id == outcome_id)
}

/// A named, numbered exit point of a state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub outcome_id: OutcomeId,
    pub name: String,
}

impl Outcome {
    pub fn new(outcome_id: OutcomeId, name: impl Into<String>) -> Self {
        Self {
            outcome_id,
            name: name.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(SUCCESS, "success")
    }

    pub fn aborted() -> Self {
        Self::new(ABORTED, "aborted")
    }

    pub fn preempted() -> Self {
        Self::new(PREEMPTED, "preempted")
    }

    pub fn is_preempted(&self) -> bool {
        self.outcome_id == PREEMPTED
    }

    pub fn is_aborted(&self) -> bool {
        self.outcome_id == ABORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(is_reserved(SUCCESS));
        assert!(is_reserved(ABORTED));
        assert!(is_reserved(PREEMPTED));
        assert!(!is_reserved(3));
    }

    #[test]
    fn test_constructors() {
        assert!(Outcome::preempted().is_preempted());
        assert!(Outcome::aborted().is_aborted());
        assert_eq!(Outcome::success().name, "success");
    }
}
