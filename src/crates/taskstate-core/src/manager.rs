//! Registry of open state machines and of the active one.

use crate::error::{EngineError, Result};
use crate::state_machine::StateMachine;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Shared handle on a managed state machine
pub type SharedStateMachine = Arc<RwLock<StateMachine>>;

/// Owns the open state machines and tracks which one the engine executes
#[derive(Debug, Default)]
pub struct StateMachineManager {
    state_machines: RwLock<BTreeMap<Uuid, SharedStateMachine>>,
    active: RwLock<Option<Uuid>>,
}

impl StateMachineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a state machine.
    ///
    /// The first machine added becomes the active one.
    pub fn add_state_machine(&self, state_machine: StateMachine) -> SharedStateMachine {
        let state_machine_id = state_machine.state_machine_id();
        let shared = Arc::new(RwLock::new(state_machine));
        self.state_machines
            .write()
            .insert(state_machine_id, Arc::clone(&shared));

        let mut active = self.active.write();
        if active.is_none() {
            *active = Some(state_machine_id);
        }
        info!(state_machine_id = %state_machine_id, "Added state machine");
        shared
    }

    /// Unregister a state machine that is not running
    pub fn remove_state_machine(&self, state_machine_id: Uuid) -> Result<SharedStateMachine> {
        let shared = self.require(state_machine_id)?;
        if shared.read().is_running() {
            return Err(EngineError::StateMachineBusy {
                state_machine_id: state_machine_id.to_string(),
            }
            .into());
        }
        self.state_machines.write().remove(&state_machine_id);

        let mut active = self.active.write();
        if *active == Some(state_machine_id) {
            *active = None;
        }
        info!(state_machine_id = %state_machine_id, "Removed state machine");
        Ok(shared)
    }

    pub fn get_state_machine(&self, state_machine_id: Uuid) -> Option<SharedStateMachine> {
        self.state_machines.read().get(&state_machine_id).cloned()
    }

    fn require(&self, state_machine_id: Uuid) -> Result<SharedStateMachine> {
        self.get_state_machine(state_machine_id).ok_or_else(|| {
            EngineError::StateMachineNotFound {
                state_machine_id: state_machine_id.to_string(),
            }
            .into()
        })
    }

    /// Select the machine the engine executes.
    ///
    /// Refused while another machine is running.
    pub fn set_active_state_machine(&self, state_machine_id: Uuid) -> Result<()> {
        self.require(state_machine_id)?;
        let mut active = self.active.write();
        if let Some(current) = *active {
            if current != state_machine_id {
                let running = self
                    .get_state_machine(current)
                    .map_or(false, |sm| sm.read().is_running());
                if running {
                    return Err(EngineError::StateMachineBusy {
                        state_machine_id: current.to_string(),
                    }
                    .into());
                }
            }
        }
        *active = Some(state_machine_id);
        Ok(())
    }

    pub fn active_state_machine_id(&self) -> Option<Uuid> {
        *self.active.read()
    }

    pub fn active_state_machine(&self) -> Option<SharedStateMachine> {
        self.active_state_machine_id()
            .and_then(|id| self.get_state_machine(id))
    }

    pub fn state_machine_ids(&self) -> Vec<Uuid> {
        self.state_machines.read().keys().copied().collect()
    }

    pub fn has_dirty_state_machines(&self) -> bool {
        self.state_machines
            .read()
            .values()
            .any(|sm| sm.read().marked_dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use std::sync::atomic::Ordering;

    fn machine() -> StateMachine {
        StateMachine::new(State::hierarchy("Root"))
    }

    #[test]
    fn test_first_machine_becomes_active() {
        let manager = StateMachineManager::new();
        let first = manager.add_state_machine(machine());
        let first_id = first.read().state_machine_id();
        manager.add_state_machine(machine());

        assert_eq!(manager.active_state_machine_id(), Some(first_id));
        assert_eq!(manager.state_machine_ids().len(), 2);
    }

    #[test]
    fn test_remove_clears_active() {
        let manager = StateMachineManager::new();
        let sm = manager.add_state_machine(machine());
        let id = sm.read().state_machine_id();

        manager.remove_state_machine(id).unwrap();
        assert!(manager.active_state_machine().is_none());
        assert!(manager.remove_state_machine(id).is_err());
    }

    #[test]
    fn test_running_machine_blocks_switching() {
        let manager = StateMachineManager::new();
        let running = manager.add_state_machine(machine());
        let other = manager.add_state_machine(machine());
        let other_id = other.read().state_machine_id();

        running.read().running_flag().store(true, Ordering::SeqCst);
        let err = manager.set_active_state_machine(other_id).unwrap_err();
        assert!(matches!(
            err.as_engine(),
            Some(EngineError::StateMachineBusy { .. })
        ));

        running.read().running_flag().store(false, Ordering::SeqCst);
        manager.set_active_state_machine(other_id).unwrap();
        assert_eq!(manager.active_state_machine_id(), Some(other_id));
    }

    #[test]
    fn test_dirty_tracking() {
        let manager = StateMachineManager::new();
        let sm = manager.add_state_machine(machine());
        assert!(!manager.has_dirty_state_machines());
        sm.write().mark_dirty();
        assert!(manager.has_dirty_state_machines());
    }
}
