//! # taskstate-core - Hierarchical Concurrent Task State Machines
//!
//! Build task-level robot behaviour (and any other long-running, interruptible workflow)
//! as a tree of states. Leaves run user logic; composites orchestrate their children
//! sequentially, concurrently, or as a reusable library reference.
//!
//! ## Overview
//!
//! - **Hierarchical composition** - states nest arbitrarily deep; every composite owns
//!   its children, transitions and data flows
//! - **Typed data flow** - values move between typed ports along explicit data flows,
//!   scoped to the composite that declares them
//! - **Outcome routing** - every state finishes with an outcome, and transitions map
//!   outcomes to the next sibling or to an outcome of the parent
//! - **Concurrency** - preemptive (first child to finish wins) and barrier (all children,
//!   then an optional decider) concurrency on tokio tasks
//! - **Cooperative control** - pause, resume and preemption are checked at defined
//!   checkpoints; nothing is force-terminated
//! - **Change notifications** - structural edits and execution progress are published on
//!   a broadcast [`EventBus`]
//!
//! ## Core Concepts
//!
//! ### 1. States
//!
//! [`State`] is a single node type with a variant payload ([`StateKind`]): execution,
//! hierarchy, preemptive concurrency, barrier concurrency, decider and library states.
//! Every state carries the reserved outcomes `success` (0), `aborted` (-1) and
//! `preempted` (-2). A fault inside a state is isolated to that state and reported as
//! `aborted`, with the fault message in [`StateOutput::error`].
//!
//! ### 2. Execution
//!
//! [`State::run`] executes a subtree with an [`ExecutionContext`]. The
//! [`ExecutionEngine`] wraps this for whole state machines: it runs the active machine
//! of a [`StateMachineManager`] on a spawned task and exposes
//! `start`/`pause`/`resume`/`stop`/`join`.
//!
//! ### 3. Editing
//!
//! [`StateMachine::edit`] hands out a [`StateEditor`] for one state. Edits are validated
//! before they are applied, rejected while the machine runs, mark the machine dirty and
//! publish a change event.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskstate_core::{
//!     logic_fn, DataMap, DataType, ExecutionContext, ExecutionServices, LogicOutput, State,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> taskstate_core::Result<()> {
//! let mut root = State::hierarchy("Root");
//! let root_in = root.add_input_data_port("x", DataType::Int, Some(json!(1)))?;
//! let root_out = root.add_output_data_port("y", DataType::Int, None)?;
//!
//! let mut double = State::execution_with_logic(
//!     "Double",
//!     logic_fn(|inputs| {
//!         let x = inputs["x"].as_i64().unwrap_or_default();
//!         Ok(LogicOutput::new(0).with_output("y", json!(x * 2)))
//!     }),
//! );
//! let x = double.add_input_data_port("x", DataType::Int, None)?;
//! let y = double.add_output_data_port("y", DataType::Int, None)?;
//! let double_id = root.add_state(double)?;
//!
//! root.set_start_state(Some(&double_id))?;
//! root.add_transition(&double_id, 0, None, Some(0))?;
//! let root_id = root.state_id().to_string();
//! root.add_data_flow(&root_id, root_in, &double_id, x)?;
//! root.add_data_flow(&double_id, y, &root_id, root_out)?;
//!
//! let ctx = ExecutionContext::new(Arc::new(ExecutionServices::default()));
//! let mut input = DataMap::new();
//! input.insert("x".to_string(), json!(21));
//! let output = root.run(&ctx, input).await?;
//! assert_eq!(output.output["y"], json!(42));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod global_variables;
pub mod manager;
pub mod outcome;
pub mod port;
pub mod state;
pub mod state_machine;
pub mod transition;

pub use config::{BarrierDefaultOutcome, EngineConfig};
pub use context::{ExecutionContext, ExecutionServices, Preempted};
pub use engine::{ExecutionEngine, ExecutionReport, ExecutionStatus};
pub use error::{EngineError, Result, TaskStateError, ValidationError};
pub use event::{ChangeKind, EventBus, StateMachineEvent, DEFAULT_EVENT_CAPACITY};
pub use global_variables::{GlobalVariableStore, InMemoryGlobalVariables};
pub use manager::{SharedStateMachine, StateMachineManager};
pub use outcome::{Outcome, OutcomeId, ABORTED, PREEMPTED, SUCCESS};
pub use port::{DataMap, DataPort, DataType, PortDirection, PortId};
pub use state::{
    decider_fn, generate_state_id, logic_fn, validate_state_id, BarrierResults, ChildResult,
    Container, DeciderLogic, LibraryError, LibraryReference, LibraryResolver, LogicBinding,
    LogicOutput, LogicRegistry, State, StateId, StateKind, StateLogic, StateOutput, StateType,
};
pub use state_machine::{StateEditor, StateMachine};
pub use transition::{DataFlow, DataFlowId, Transition, TransitionId, TransitionTarget};
