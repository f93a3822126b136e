//! Preemptive and barrier concurrency.
//!
//! Both variants start every non-decider child on its own tokio task. Children of one
//! concurrency state share a group context derived from the parent's; cancelling the
//! group preempts the siblings without touching the parent, while preempting the
//! parent cascades into the group.

use super::hierarchy::{Route, ScopedData};
use super::{Container, State, StateId, StateKind, StateOutput, StateType};
use crate::config::BarrierDefaultOutcome;
use crate::context::ExecutionContext;
use crate::error::{Result, TaskStateError};
use crate::outcome::Outcome;
use crate::port::DataMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of one child of a barrier concurrency state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResult {
    pub state_id: StateId,
    pub name: String,
    pub outcome: Outcome,
    pub output: DataMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results of all children of a barrier, ordered by child id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarrierResults {
    results: Vec<ChildResult>,
}

impl BarrierResults {
    pub fn new(mut results: Vec<ChildResult>) -> Self {
        results.sort_by(|a, b| a.state_id.cmp(&b.state_id));
        Self { results }
    }

    pub fn get(&self, state_id: &str) -> Option<&ChildResult> {
        self.results.iter().find(|r| r.state_id == state_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ChildResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn any_aborted(&self) -> bool {
        self.results.iter().any(|r| r.outcome.is_aborted())
    }

    pub fn any_preempted(&self) -> bool {
        self.results.iter().any(|r| r.outcome.is_preempted())
    }
}

type ChildJoin = (StateId, Result<StateOutput>);

impl State {
    /// Spawn every non-decider child on the group context
    fn spawn_children(
        &self,
        group: &ExecutionContext,
        container: &Container,
        scoped: &ScopedData,
    ) -> JoinSet<ChildJoin> {
        let mut tasks = JoinSet::new();
        for child in container.states.values() {
            if child.state_type() == StateType::Decider {
                continue;
            }
            let child = Arc::clone(child);
            let child_ctx = group.clone();
            let child_inputs = self.resolve_child_inputs(container, &child, scoped);
            tasks.spawn(async move {
                let result = AssertUnwindSafe(child.run(&child_ctx, child_inputs))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(TaskStateError::execution(child.state_id.clone(), "state panicked"))
                    });
                (child.state_id.clone(), result)
            });
        }
        tasks
    }

    pub(crate) async fn run_preemptive(
        &self,
        ctx: &ExecutionContext,
        container: &Container,
        input: DataMap,
    ) -> Result<StateOutput> {
        let inputs = match self.prepare_inputs(input) {
            Ok(inputs) => inputs,
            Err(reason) => return Ok(StateOutput::fault(reason)),
        };
        self.check_connectivity(container, ctx.services().config().barrier_default_outcome)?;

        let mut scoped = ScopedData::new();
        scoped.publish(&self.state_id, &self.input_data_ports, &inputs);

        let group = ctx.child();
        let mut tasks = self.spawn_children(&group, container, &scoped);
        if tasks.is_empty() {
            return Ok(StateOutput::new(
                Outcome::success(),
                self.resolve_own_outputs(container, &scoped),
            ));
        }

        let mut winner: Option<(StateId, StateOutput)> = None;
        let mut failure: Option<TaskStateError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (child_id, result) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    group.token().cancel();
                    failure.get_or_insert(TaskStateError::execution(
                        self.state_id.clone(),
                        format!("child task failed: {}", e),
                    ));
                    continue;
                }
            };
            match result {
                Ok(output) if winner.is_none() && failure.is_none() => {
                    debug!(
                        state_id = %self.state_id,
                        winner = %child_id,
                        outcome_id = output.outcome.outcome_id,
                        "Preempting siblings"
                    );
                    group.token().cancel();
                    winner = Some((child_id, output));
                }
                Ok(output) => {
                    debug!(
                        state_id = %self.state_id,
                        child_id = %child_id,
                        outcome_id = output.outcome.outcome_id,
                        "Sibling finished"
                    );
                }
                Err(e) => {
                    group.token().cancel();
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        let Some((winner_id, result)) = winner else {
            return Ok(StateOutput::preempted());
        };
        if ctx.is_preempted() {
            return Ok(StateOutput::preempted());
        }

        if let Some(child) = container.states.get(&winner_id) {
            scoped.publish(&winner_id, &child.output_data_ports, &result.output);
        }
        self.leave_through(container, &winner_id, result, &scoped)
    }

    pub(crate) async fn run_barrier(
        &self,
        ctx: &ExecutionContext,
        container: &Container,
        input: DataMap,
    ) -> Result<StateOutput> {
        let inputs = match self.prepare_inputs(input) {
            Ok(inputs) => inputs,
            Err(reason) => return Ok(StateOutput::fault(reason)),
        };
        let policy = ctx.services().config().barrier_default_outcome;
        self.check_connectivity(container, policy)?;

        let mut scoped = ScopedData::new();
        scoped.publish(&self.state_id, &self.input_data_ports, &inputs);

        let group = ctx.child();
        let mut tasks = self.spawn_children(&group, container, &scoped);
        let mut finished = Vec::with_capacity(tasks.len());
        let mut failure: Option<TaskStateError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((child_id, Ok(output))) => finished.push((child_id, output)),
                Ok((_, Err(e))) => {
                    group.token().cancel();
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    group.token().cancel();
                    failure.get_or_insert(TaskStateError::execution(
                        self.state_id.clone(),
                        format!("child task failed: {}", e),
                    ));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if ctx.checkpoint().await.is_err() {
            warn!(state_id = %self.state_id, "Barrier preempted");
            return Ok(StateOutput::preempted());
        }

        finished.sort_by(|a, b| a.0.cmp(&b.0));
        let mut results = Vec::with_capacity(finished.len());
        for (child_id, output) in finished {
            let Some(child) = container.states.get(&child_id) else {
                continue;
            };
            scoped.publish(&child_id, &child.output_data_ports, &output.output);
            results.push(ChildResult {
                state_id: child_id,
                name: child.name.clone(),
                outcome: output.outcome,
                output: output.output,
                error: output.error,
            });
        }
        let results = BarrierResults::new(results);

        if let Some(decider) = container.decider() {
            let StateKind::Decider(binding) = &decider.kind else {
                return Err(TaskStateError::execution(
                    decider.state_id.clone(),
                    "decider child has no decider logic",
                ));
            };
            decider.notify_entered(ctx);
            let decider_inputs = self.resolve_child_inputs(container, decider, &scoped);
            let decision = decider
                .run_decider_logic(ctx, binding, decider_inputs, &results)
                .await;
            decider.notify_finished(ctx, &decision);
            if decision.is_preempted() && ctx.is_preempted() {
                return Ok(StateOutput::preempted());
            }
            scoped.publish(&decider.state_id, &decider.output_data_ports, &decision.output);
            return self.leave_through(container, &decider.state_id, decision, &scoped);
        }

        match policy {
            BarrierDefaultOutcome::AbortOnFailure => {
                let (outcome, error) = if results.any_aborted() {
                    let error = results.iter().find_map(|r| r.error.clone());
                    (Outcome::aborted(), error)
                } else if results.any_preempted() {
                    (Outcome::preempted(), None)
                } else {
                    (Outcome::success(), None)
                };
                let outcome = self.outcome(outcome.outcome_id).cloned().unwrap_or(outcome);
                Ok(StateOutput {
                    outcome,
                    output: self.resolve_own_outputs(container, &scoped),
                    error,
                })
            }
            BarrierDefaultOutcome::FirstChild => match results.iter().next() {
                Some(first) => {
                    let first_id = first.state_id.clone();
                    let output = StateOutput {
                        outcome: first.outcome.clone(),
                        output: first.output.clone(),
                        error: first.error.clone(),
                    };
                    self.leave_through(container, &first_id, output, &scoped)
                }
                None => Ok(StateOutput::new(
                    Outcome::success(),
                    self.resolve_own_outputs(container, &scoped),
                )),
            },
        }
    }

    /// Resolve the outcome of the deciding child to one of this state's outcomes
    fn leave_through(
        &self,
        container: &Container,
        child_id: &str,
        result: StateOutput,
        scoped: &ScopedData,
    ) -> Result<StateOutput> {
        match self.route(container, child_id, &result.outcome)? {
            Route::Leave(outcome) => {
                let error = if outcome.is_aborted() { result.error } else { None };
                Ok(StateOutput {
                    outcome,
                    output: self.resolve_own_outputs(container, scoped),
                    error,
                })
            }
            Route::Next(next) => Err(TaskStateError::execution(
                self.state_id.clone(),
                format!("concurrency states cannot transition to sibling '{}'", next.state_id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::ExecutionServices;
    use crate::error::ValidationError;
    use crate::event::StateMachineEvent;
    use crate::outcome;
    use crate::state::{decider_fn, logic_fn, LogicOutput, StateLogic};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(ExecutionServices::default()))
    }

    fn first_child_ctx() -> ExecutionContext {
        let config = EngineConfig {
            barrier_default_outcome: BarrierDefaultOutcome::FirstChild,
            ..Default::default()
        };
        ExecutionContext::new(Arc::new(ExecutionServices::new(config)))
    }

    struct Delayed {
        millis: u64,
        outcome_id: i64,
    }

    #[async_trait]
    impl StateLogic for Delayed {
        async fn execute(&self, _ctx: &ExecutionContext, _inputs: &DataMap) -> anyhow::Result<LogicOutput> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(LogicOutput::new(self.outcome_id))
        }
    }

    fn delayed(id: &str, millis: u64, outcome_id: i64) -> State {
        let mut state = State::execution_with_logic(id, Arc::new(Delayed { millis, outcome_id }))
            .with_id(id);
        if !outcome::is_reserved(outcome_id) {
            state.add_outcome(format!("outcome_{}", outcome_id), Some(outcome_id)).unwrap();
        }
        state
    }

    #[tokio::test]
    async fn test_preemptive_first_child_wins() {
        let mut root = State::preemptive_concurrency("Race").with_id("RACE");
        root.add_outcome("fast", Some(1)).unwrap();
        root.add_state(delayed("FAST", 10, 1)).unwrap();
        root.add_state(delayed("SLOW", 5_000, outcome::SUCCESS)).unwrap();
        root.add_transition("FAST", 1, None, Some(1)).unwrap();

        let ctx = ctx();
        let mut rx = ctx.events().subscribe();

        let output = root.run(&ctx, DataMap::new()).await.unwrap();
        assert_eq!(output.outcome_id(), 1);

        let mut slow_outcome = None;
        while let Ok(event) = rx.try_recv() {
            if let StateMachineEvent::StateFinished { state_id, outcome, .. } = event {
                if state_id == "SLOW" {
                    slow_outcome = Some(outcome);
                }
            }
        }
        assert_eq!(slow_outcome, Some(Outcome::preempted()));
    }

    #[tokio::test]
    async fn test_barrier_waits_for_all_and_decider_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let decider = State::decider_with_logic(
            "Decider",
            decider_fn(move |results, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(results.len(), 2);
                assert_eq!(results.get("A").unwrap().outcome.outcome_id, 1);
                assert_eq!(results.get("B").unwrap().outcome.outcome_id, 2);
                Ok(LogicOutput::new(7))
            }),
        )
        .with_id("DECIDER");

        let mut root = State::barrier_concurrency("Barrier");
        root.add_state(delayed("A", 5, 1)).unwrap();
        root.add_state(delayed("B", 50, 2)).unwrap();
        let mut decider = decider;
        decider.add_outcome("chosen", Some(7)).unwrap();
        root.add_state(decider).unwrap();
        root.add_outcome("done", Some(3)).unwrap();
        root.add_transition("DECIDER", 7, None, Some(3)).unwrap();

        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert_eq!(output.outcome_id(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_barrier_without_decider_aborts_on_failure() {
        let mut root = State::barrier_concurrency("Barrier");
        root.add_state(delayed("A", 1, outcome::SUCCESS)).unwrap();
        root.add_state(
            State::execution_with_logic("B", logic_fn(|_| Err(anyhow::anyhow!("gripper stuck"))))
                .with_id("B"),
        )
        .unwrap();

        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert!(output.outcome.is_aborted());
        assert_eq!(output.error.as_deref(), Some("gripper stuck"));
    }

    #[tokio::test]
    async fn test_barrier_preempted_skips_decider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut root = State::barrier_concurrency("Barrier");
        root.add_state(delayed("A", 5_000, outcome::SUCCESS)).unwrap();
        root.add_state(
            State::decider_with_logic(
                "Decider",
                decider_fn(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(LogicOutput::new(outcome::SUCCESS))
                }),
            )
            .with_id("DECIDER"),
        )
        .unwrap();

        let ctx = ctx();
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let output = root.run(&ctx, DataMap::new()).await.unwrap();
        assert!(output.is_preempted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_barrier_first_child_routes_lowest_child_id() {
        let mut root = State::barrier_concurrency("Barrier");
        root.add_outcome("done", Some(7)).unwrap();
        root.add_state(delayed("A", 30, 1)).unwrap();
        root.add_state(delayed("B", 1, 2)).unwrap();
        root.add_transition("A", 1, None, Some(7)).unwrap();
        root.add_transition("B", 2, None, Some(7)).unwrap();

        let output = root.run(&first_child_ctx(), DataMap::new()).await.unwrap();
        assert_eq!(output.outcome_id(), 7);
        assert!(output.error.is_none());
    }

    #[tokio::test]
    async fn test_barrier_first_child_checks_every_child() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let mut root = State::barrier_concurrency("Barrier");
        root.add_outcome("done", Some(7)).unwrap();
        let mut a = State::execution_with_logic(
            "A",
            logic_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(LogicOutput::new(1))
            }),
        )
        .with_id("A");
        a.add_outcome("left", Some(1)).unwrap();
        root.add_state(a).unwrap();
        root.add_state(delayed("B", 1, 2)).unwrap();
        root.add_transition("A", 1, None, Some(7)).unwrap();

        let err = root
            .run(&first_child_ctx(), DataMap::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.as_validation(),
            Some(&ValidationError::UnconnectedOutcome {
                state_id: root.state_id().to_string(),
                child_id: "B".to_string(),
                outcome_id: 2,
            })
        );
        assert_eq!(started.load(Ordering::SeqCst), 0);

        // the default policy only routes through a decider
        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert_eq!(output.outcome_id(), outcome::SUCCESS);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
