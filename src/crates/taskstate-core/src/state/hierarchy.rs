//! Sequential execution of a hierarchy state, plus the scoped data and outcome
//! routing shared with the concurrency states.

use super::{Container, State, StateId, StateOutput};
use crate::context::ExecutionContext;
use crate::error::{Result, TaskStateError, ValidationError};
use crate::outcome::Outcome;
use crate::port::{DataMap, DataPort, PortId};
use crate::transition::TransitionTarget;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Values produced inside one composite, keyed by `(state_id, port_id)`.
///
/// Every write gets a sequence number; when several data flows feed one port the
/// most recent write wins.
#[derive(Debug, Default)]
pub(crate) struct ScopedData {
    values: HashMap<(StateId, PortId), (u64, Value)>,
    seq: u64,
}

impl ScopedData {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the values of `ports` found in `data` (by port name)
    pub(crate) fn publish(
        &mut self,
        state_id: &str,
        ports: &BTreeMap<PortId, DataPort>,
        data: &DataMap,
    ) {
        for port in ports.values() {
            if let Some(value) = data.get(&port.name) {
                self.seq += 1;
                self.values.insert(
                    (state_id.to_string(), port.data_port_id),
                    (self.seq, value.clone()),
                );
            }
        }
    }

    fn get(&self, state_id: &str, port_id: PortId) -> Option<&(u64, Value)> {
        self.values.get(&(state_id.to_string(), port_id))
    }
}

/// Where a child's outcome leads
pub(crate) enum Route<'a> {
    Next(&'a Arc<State>),
    Leave(Outcome),
}

impl State {
    /// Values for the input ports of `child` from the data flows targeting it.
    ///
    /// Ports without an available value are left out so the child applies its defaults.
    pub(crate) fn resolve_child_inputs(
        &self,
        container: &Container,
        child: &State,
        scoped: &ScopedData,
    ) -> DataMap {
        let mut inputs = DataMap::new();
        for port in child.input_data_ports.values() {
            let latest = container
                .data_flows
                .values()
                .filter(|df| df.to_state == child.state_id && df.to_key == port.data_port_id)
                .filter_map(|df| scoped.get(&df.from_state, df.from_key))
                .max_by_key(|(seq, _)| *seq);
            if let Some((_, value)) = latest {
                inputs.insert(port.name.clone(), value.clone());
            }
        }
        inputs
    }

    /// Values of this state's own output ports; unresolved ports take their default
    pub(crate) fn resolve_own_outputs(&self, container: &Container, scoped: &ScopedData) -> DataMap {
        let mut outputs = DataMap::new();
        for port in self.output_data_ports.values() {
            let value = container
                .data_flows
                .values()
                .filter(|df| df.to_state == self.state_id && df.to_key == port.data_port_id)
                .filter_map(|df| scoped.get(&df.from_state, df.from_key))
                .max_by_key(|(seq, _)| *seq)
                .map(|(_, value)| value.clone())
                .unwrap_or_else(|| port.default_or_null());
            outputs.insert(port.name.clone(), value);
        }
        outputs
    }

    /// Follow the transition of `(child_id, outcome)`, or pass a boundary outcome through
    pub(crate) fn route<'a>(
        &self,
        container: &'a Container,
        child_id: &str,
        outcome: &Outcome,
    ) -> Result<Route<'a>> {
        let Some(transition) = container.transition_from(child_id, outcome.outcome_id) else {
            return match self.outcomes.get(&outcome.outcome_id) {
                Some(own) => Ok(Route::Leave(own.clone())),
                None => Err(ValidationError::UnconnectedOutcome {
                    state_id: self.state_id.clone(),
                    child_id: child_id.to_string(),
                    outcome_id: outcome.outcome_id,
                }
                .into()),
            };
        };

        match transition.target(&self.state_id) {
            Some(TransitionTarget::State(next)) => container
                .states
                .get(next)
                .map(Route::Next)
                .ok_or_else(|| {
                    TaskStateError::execution(
                        self.state_id.clone(),
                        format!("transition {} targets unknown state '{}'", transition.transition_id, next),
                    )
                }),
            Some(TransitionTarget::Outcome(outcome_id)) => self
                .outcomes
                .get(&outcome_id)
                .map(|o| Route::Leave(o.clone()))
                .ok_or_else(|| {
                    TaskStateError::execution(
                        self.state_id.clone(),
                        format!("transition {} targets unknown outcome {}", transition.transition_id, outcome_id),
                    )
                }),
            None => Err(TaskStateError::execution(
                self.state_id.clone(),
                format!("transition {} has no valid target", transition.transition_id),
            )),
        }
    }

    pub(crate) async fn run_hierarchy(
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
        let mut current = container
            .start_state_id
            .as_deref()
            .and_then(|id| container.states.get(id))
            .ok_or_else(|| ValidationError::NoStartState {
                state_id: self.state_id.clone(),
            })?;

        let mut scoped = ScopedData::new();
        scoped.publish(&self.state_id, &self.input_data_ports, &inputs);

        loop {
            if ctx.checkpoint().await.is_err() {
                debug!(state_id = %self.state_id, "Hierarchy preempted between children");
                return Ok(StateOutput::preempted());
            }

            let child_inputs = self.resolve_child_inputs(container, current, &scoped);
            let result = current.run(ctx, child_inputs).await?;
            if result.is_preempted() && ctx.is_preempted() {
                return Ok(StateOutput::preempted());
            }
            scoped.publish(&current.state_id, &current.output_data_ports, &result.output);

            match self.route(container, &current.state_id, &result.outcome)? {
                Route::Next(next) => {
                    debug!(
                        state_id = %self.state_id,
                        from = %current.state_id,
                        to = %next.state_id,
                        "Following transition"
                    );
                    current = next;
                }
                Route::Leave(outcome) => {
                    let error = if outcome.is_aborted() { result.error } else { None };
                    return Ok(StateOutput {
                        outcome,
                        output: self.resolve_own_outputs(container, &scoped),
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionServices;
    use crate::outcome;
    use crate::port::DataType;
    use crate::state::{logic_fn, LogicOutput};
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(ExecutionServices::default()))
    }

    /// Root(x) -> A(x) -> B(x) -> Root.y, each child adding one
    fn counter_chain() -> State {
        let add_one = || {
            logic_fn(|inputs| {
                let x = inputs["x"].as_i64().unwrap_or_default();
                Ok(LogicOutput::new(outcome::SUCCESS).with_output("x", json!(x + 1)))
            })
        };
        let mut root = State::hierarchy("Root").with_id("ROOT");
        let root_in = root.add_input_data_port("x", DataType::Int, Some(json!(0))).unwrap();
        let root_out = root.add_output_data_port("y", DataType::Int, None).unwrap();

        let mut ports = Vec::new();
        for id in ["A", "B"] {
            let mut child = State::execution_with_logic(id, add_one()).with_id(id);
            let i = child.add_input_data_port("x", DataType::Int, None).unwrap();
            let o = child.add_output_data_port("x", DataType::Int, None).unwrap();
            ports.push((i, o));
            root.add_state(child).unwrap();
        }
        root.set_start_state(Some("A")).unwrap();
        root.add_transition("A", outcome::SUCCESS, Some("B"), None).unwrap();
        root.add_transition("B", outcome::SUCCESS, None, Some(outcome::SUCCESS)).unwrap();
        root.add_data_flow("ROOT", root_in, "A", ports[0].0).unwrap();
        root.add_data_flow("A", ports[0].1, "B", ports[1].0).unwrap();
        root.add_data_flow("B", ports[1].1, "ROOT", root_out).unwrap();
        root
    }

    #[tokio::test]
    async fn test_sequential_data_flow() {
        let root = counter_chain();
        let mut input = DataMap::new();
        input.insert("x".to_string(), json!(40));

        let output = root.run(&ctx(), input).await.unwrap();
        assert_eq!(output.outcome_id(), outcome::SUCCESS);
        assert_eq!(output.output["y"], json!(42));
    }

    #[tokio::test]
    async fn test_most_recent_write_wins() {
        let mut root = counter_chain();
        let root_in = root.input_port_by_name("x").unwrap().data_port_id;
        let b_in = root.get_state("B").unwrap().input_port_by_name("x").unwrap().data_port_id;
        // B is fed by the root input and by A; A wrote last
        root.add_data_flow("ROOT", root_in, "B", b_in).unwrap();

        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert_eq!(output.output["y"], json!(2));
    }

    #[tokio::test]
    async fn test_missing_start_state_fails_before_running() {
        let mut root = counter_chain();
        root.set_start_state(None).unwrap();
        let err = root.run(&ctx(), DataMap::new()).await.unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::NoStartState { .. })
        ));
    }

    #[tokio::test]
    async fn test_boundary_outcome_passes_through() {
        let mut root = State::hierarchy("Root");
        root.add_outcome("retry", Some(4)).unwrap();
        let mut child = State::execution_with_logic("Child", logic_fn(|_| Ok(LogicOutput::new(4))))
            .with_id("CHILD");
        child.add_outcome("retry", Some(4)).unwrap();
        root.add_state(child).unwrap();
        root.set_start_state(Some("CHILD")).unwrap();

        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert_eq!(output.outcome_id(), 4);
        assert_eq!(output.outcome.name, "retry");
    }

    #[tokio::test]
    async fn test_child_fault_propagates_as_aborted() {
        let mut root = State::hierarchy("Root");
        let child = State::execution_with_logic("Child", logic_fn(|_| Err(anyhow::anyhow!("jammed"))))
            .with_id("CHILD");
        root.add_state(child).unwrap();
        root.set_start_state(Some("CHILD")).unwrap();

        let output = root.run(&ctx(), DataMap::new()).await.unwrap();
        assert!(output.outcome.is_aborted());
        assert_eq!(output.error.as_deref(), Some("jammed"));
    }
}
