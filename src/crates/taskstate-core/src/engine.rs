//! Execution engine: runs the active state machine of a [`StateMachineManager`].
//!
//! The engine is an explicitly constructed object, not a process-wide singleton. It
//! executes at most one state machine at a time on a spawned tokio task and exposes
//! cooperative control over that run:
//!
//! ```text
//!            start()                 pause()
//!  Stopped ──────────▶ Running ─────────────▶ Paused
//!     ▲                 │   ▲   resume()        │
//!     │   run returns   │   └───────────────────┘
//!     └─────────────────┴──── stop() (cancel root token, then join)
//! ```
//!
//! Pausing and stopping are cooperative: states observe them at their checkpoints.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskstate_core::{
//!     logic_fn, EngineConfig, ExecutionEngine, LogicOutput, State, StateMachine,
//!     StateMachineManager,
//! };
//!
//! # async fn example() -> taskstate_core::Result<()> {
//! let mut root = State::hierarchy("Root");
//! let child = State::execution_with_logic("Hello", logic_fn(|_| Ok(LogicOutput::new(0))));
//! let child_id = root.add_state(child)?;
//! root.set_start_state(Some(&child_id))?;
//!
//! let manager = Arc::new(StateMachineManager::new());
//! manager.add_state_machine(StateMachine::new(root));
//!
//! let engine = ExecutionEngine::with_config(Arc::clone(&manager), EngineConfig::default());
//! engine.start()?;
//! let report = engine.join().await;
//! println!("{:?}", report.map(|r| r.result));
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, ExecutionServices};
use crate::error::{EngineError, Result};
use crate::event::StateMachineEvent;
use crate::manager::StateMachineManager;
use crate::outcome::Outcome;
use crate::port::DataMap;
use crate::state::StateOutput;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Status of the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Stopped,
    Running,
    Paused,
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub state_machine_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Output of the root state, or the structural error that ended the run
    pub result: std::result::Result<StateOutput, String>,
}

impl ExecutionReport {
    pub fn outcome(&self) -> Option<&Outcome> {
        self.result.as_ref().ok().map(|output| &output.outcome)
    }
}

struct ActiveRun {
    state_machine_id: Uuid,
    preemption: CancellationToken,
}

/// Runs state machines, one at a time
pub struct ExecutionEngine {
    manager: Arc<StateMachineManager>,
    services: Arc<ExecutionServices>,
    status: Arc<watch::Sender<ExecutionStatus>>,
    pause: watch::Sender<bool>,
    active_run: Arc<Mutex<Option<ActiveRun>>>,
    last_report: Arc<Mutex<Option<ExecutionReport>>>,
}

impl ExecutionEngine {
    pub fn new(manager: Arc<StateMachineManager>, services: ExecutionServices) -> Self {
        let (status, _) = watch::channel(ExecutionStatus::Stopped);
        let (pause, _) = watch::channel(false);
        Self {
            manager,
            services: Arc::new(services),
            status: Arc::new(status),
            pause,
            active_run: Arc::new(Mutex::new(None)),
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Engine with default services built from `config`
    pub fn with_config(manager: Arc<StateMachineManager>, config: EngineConfig) -> Self {
        Self::new(manager, ExecutionServices::new(config))
    }

    pub fn manager(&self) -> &Arc<StateMachineManager> {
        &self.manager
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    /// Subscribe to execution events (state entered/finished, status changes)
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateMachineEvent> {
        self.services.events().subscribe()
    }

    pub fn last_report(&self) -> Option<ExecutionReport> {
        self.last_report.lock().clone()
    }

    /// Id of the state machine currently executing
    pub fn running_state_machine_id(&self) -> Option<Uuid> {
        self.active_run.lock().as_ref().map(|run| run.state_machine_id)
    }

    fn set_status(&self, status: ExecutionStatus) {
        publish_status(&self.status, &self.services, status);
    }

    /// Start the active state machine with no input
    pub fn start(&self) -> Result<()> {
        self.start_with_input(DataMap::new())
    }

    /// Start the active state machine, feeding `input` to the root state
    pub fn start_with_input(&self, input: DataMap) -> Result<()> {
        let mut active_run = self.active_run.lock();
        if let Some(run) = active_run.as_ref() {
            return Err(EngineError::StateMachineBusy {
                state_machine_id: run.state_machine_id.to_string(),
            }
            .into());
        }
        let shared = self
            .manager
            .active_state_machine()
            .ok_or(EngineError::NoActiveStateMachine)?;
        let (state_machine_id, root, running) = {
            // write lock: no editor can slip in between the claim and the snapshot
            let sm = shared.write();
            let running = sm.running_flag();
            if running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(EngineError::StateMachineBusy {
                    state_machine_id: sm.state_machine_id().to_string(),
                }
                .into());
            }
            (sm.state_machine_id(), sm.root_snapshot(), running)
        };

        self.pause.send_replace(false);
        let preemption = CancellationToken::new();
        let ctx = ExecutionContext::with_controls(
            Arc::clone(&self.services),
            preemption.clone(),
            self.pause.subscribe(),
        );
        *active_run = Some(ActiveRun {
            state_machine_id,
            preemption,
        });
        self.set_status(ExecutionStatus::Running);
        info!(state_machine_id = %state_machine_id, root = %root.state_id(), "Starting execution");

        let status = Arc::clone(&self.status);
        let services = Arc::clone(&self.services);
        let slot = Arc::clone(&self.active_run);
        let last_report = Arc::clone(&self.last_report);
        tokio::spawn(async move {
            let started_at = Utc::now();
            let result = match AssertUnwindSafe(root.run(&ctx, input)).catch_unwind().await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => {
                    error!(state_machine_id = %state_machine_id, error = %e, "Execution failed");
                    Err(e.to_string())
                }
                Err(_) => {
                    error!(state_machine_id = %state_machine_id, "Root state panicked");
                    Err("root state panicked".to_string())
                }
            };
            let report = ExecutionReport {
                state_machine_id,
                started_at,
                finished_at: Utc::now(),
                result,
            };
            info!(
                state_machine_id = %state_machine_id,
                outcome = ?report.outcome().map(|o| o.outcome_id),
                "Execution finished"
            );

            running.store(false, Ordering::SeqCst);
            *last_report.lock() = Some(report);
            let mut active_run = slot.lock();
            active_run.take();
            publish_status(&status, &services, ExecutionStatus::Stopped);
        });
        Ok(())
    }

    /// Ask running states to wait at their next checkpoint
    pub fn pause(&self) -> Result<()> {
        let active_run = self.active_run.lock();
        if active_run.is_none() {
            return Err(EngineError::NotRunning.into());
        }
        if self.status() == ExecutionStatus::Running {
            self.pause.send_replace(true);
            self.set_status(ExecutionStatus::Paused);
            info!("Execution paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let active_run = self.active_run.lock();
        if active_run.is_none() {
            return Err(EngineError::NotRunning.into());
        }
        if self.status() == ExecutionStatus::Paused {
            self.pause.send_replace(false);
            self.set_status(ExecutionStatus::Running);
            info!("Execution resumed");
        }
        Ok(())
    }

    /// Preempt the whole run and wait for the root to acknowledge.
    ///
    /// Returns the report of the run, or of the last run when nothing was running.
    pub async fn stop(&self) -> Option<ExecutionReport> {
        let preemption = self
            .active_run
            .lock()
            .as_ref()
            .map(|run| run.preemption.clone());
        match preemption {
            Some(token) => {
                warn!("Stopping execution");
                token.cancel();
                self.pause.send_replace(false);
                self.join().await
            }
            None => self.last_report(),
        }
    }

    /// Wait until the current run (if any) has finished
    pub async fn join(&self) -> Option<ExecutionReport> {
        let mut status = self.status.subscribe();
        // The sender lives as long as the engine, so this only ends once stopped.
        let _ = status.wait_for(|s| *s == ExecutionStatus::Stopped).await;
        self.last_report()
    }
}

fn publish_status(
    status: &watch::Sender<ExecutionStatus>,
    services: &ExecutionServices,
    next: ExecutionStatus,
) {
    status.send_replace(next);
    services
        .events()
        .publish(StateMachineEvent::ExecutionStatusChanged { status: next });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskStateError;
    use crate::outcome;
    use crate::state::{logic_fn, LogicOutput, State};
    use crate::state_machine::StateMachine;

    fn engine_with(root: Option<State>) -> ExecutionEngine {
        let manager = Arc::new(StateMachineManager::new());
        if let Some(root) = root {
            manager.add_state_machine(StateMachine::new(root));
        }
        ExecutionEngine::with_config(manager, EngineConfig::default())
    }

    fn single_step() -> State {
        let mut root = State::hierarchy("Root");
        let child = State::execution_with_logic(
            "Step",
            logic_fn(|_| Ok(LogicOutput::new(outcome::SUCCESS))),
        );
        let child_id = root.add_state(child).unwrap();
        root.set_start_state(Some(&child_id)).unwrap();
        root
    }

    #[tokio::test]
    async fn test_start_without_machine() {
        let engine = engine_with(None);
        let err = engine.start().unwrap_err();
        assert!(matches!(
            err,
            TaskStateError::Engine(EngineError::NoActiveStateMachine)
        ));
        assert_eq!(engine.status(), ExecutionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let engine = engine_with(Some(single_step()));
        engine.start().unwrap();
        let report = engine.join().await.unwrap();

        assert_eq!(report.outcome().map(|o| o.outcome_id), Some(outcome::SUCCESS));
        assert_eq!(engine.status(), ExecutionStatus::Stopped);
        assert!(engine.running_state_machine_id().is_none());
    }

    #[tokio::test]
    async fn test_pause_requires_run() {
        let engine = engine_with(Some(single_step()));
        assert!(matches!(
            engine.pause().unwrap_err(),
            TaskStateError::Engine(EngineError::NotRunning)
        ));
        assert!(engine.resume().is_err());
        assert!(engine.stop().await.is_none());
    }
}
