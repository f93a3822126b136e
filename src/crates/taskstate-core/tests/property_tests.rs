//! Property tests for the structural invariants of states

use proptest::prelude::*;
use std::collections::BTreeSet;
use taskstate_core::{State, TaskStateError, ValidationError, ABORTED, PREEMPTED, SUCCESS};

proptest! {
    #[test]
    fn outcome_ids_stay_unique(ids in prop::collection::vec(-3i64..12, 0..24)) {
        let mut state = State::execution("Worker");
        let mut expected: BTreeSet<i64> = [SUCCESS, ABORTED, PREEMPTED].into_iter().collect();

        for (i, id) in ids.into_iter().enumerate() {
            let result = state.add_outcome(format!("outcome_{}", i), Some(id));
            if expected.contains(&id) {
                let is_duplicate = matches!(
                    result,
                    Err(TaskStateError::Validation(ValidationError::DuplicateOutcome { outcome_id, .. }))
                        if outcome_id == id
                );
                prop_assert!(is_duplicate);
            } else {
                prop_assert_eq!(result.ok(), Some(id));
                expected.insert(id);
            }
        }

        let actual: BTreeSet<i64> = state.outcomes().keys().copied().collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn generated_outcome_ids_are_fresh(count in 1usize..16) {
        let mut state = State::execution("Worker");
        let mut seen = BTreeSet::new();
        for i in 0..count {
            let id = state.add_outcome(format!("o{}", i), None).unwrap();
            prop_assert!(id > 0);
            prop_assert!(seen.insert(id));
        }
    }

    #[test]
    fn one_transition_per_outcome(attempts in prop::collection::vec((0usize..3, 0usize..2), 1..12)) {
        let mut root = State::hierarchy("Root").with_id("ROOT");
        for id in ["A", "B", "C"] {
            let mut child = State::execution(id).with_id(id);
            child.add_outcome("next", Some(1)).unwrap();
            root.add_state(child).unwrap();
        }

        let names = ["A", "B", "C"];
        let outcomes = [SUCCESS, 1];
        let mut connected = BTreeSet::new();
        for (from, outcome) in attempts {
            let from_state = names[from];
            let from_outcome = outcomes[outcome];
            let result = root.add_transition(from_state, from_outcome, None, Some(SUCCESS));
            prop_assert_eq!(result.is_ok(), connected.insert((from_state, from_outcome)));
        }

        let container = root.container().unwrap();
        prop_assert_eq!(container.transitions().len(), connected.len());
    }
}
