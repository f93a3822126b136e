//! User logic of execution and decider states.
//!
//! Logic is external code: it receives the prepared inputs and returns the chosen
//! outcome id together with its output values. Anything that goes wrong inside it
//! (an error, a panic, an undeclared outcome) is isolated to the state and reported
//! as the error outcome.
//!
//! Logic is raced against the preemption token. When the state is preempted the logic
//! future is dropped at its current await point, so long-running logic should either
//! await regularly or call [`ExecutionContext::checkpoint`] itself.

use super::concurrency::BarrierResults;
use super::{State, StateOutput};
use crate::context::{ExecutionContext, Preempted};
use crate::outcome::OutcomeId;
use crate::port::DataMap;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

/// Outcome and output values produced by a logic invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicOutput {
    pub outcome_id: OutcomeId,
    pub outputs: DataMap,
}

impl LogicOutput {
    pub fn new(outcome_id: OutcomeId) -> Self {
        Self {
            outcome_id,
            outputs: DataMap::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(name.into(), value);
        self
    }
}

/// Logic of an execution state
#[async_trait]
pub trait StateLogic: Send + Sync {
    /// Execute the unit of work.
    ///
    /// Return [`Preempted`] (for instance through `ctx.checkpoint().await?`) to stop
    /// early once the state has been preempted.
    async fn execute(&self, ctx: &ExecutionContext, inputs: &DataMap) -> anyhow::Result<LogicOutput>;
}

/// Logic of a decider state, run once after its barrier closes
#[async_trait]
pub trait DeciderLogic: Send + Sync {
    async fn decide(
        &self,
        ctx: &ExecutionContext,
        results: &BarrierResults,
        inputs: &DataMap,
    ) -> anyhow::Result<LogicOutput>;
}

struct FnLogic<F>(F);

#[async_trait]
impl<F> StateLogic for FnLogic<F>
where
    F: Fn(&DataMap) -> anyhow::Result<LogicOutput> + Send + Sync,
{
    async fn execute(&self, _ctx: &ExecutionContext, inputs: &DataMap) -> anyhow::Result<LogicOutput> {
        (self.0)(inputs)
    }
}

struct FnDecider<F>(F);

#[async_trait]
impl<F> DeciderLogic for FnDecider<F>
where
    F: Fn(&BarrierResults, &DataMap) -> anyhow::Result<LogicOutput> + Send + Sync,
{
    async fn decide(
        &self,
        _ctx: &ExecutionContext,
        results: &BarrierResults,
        inputs: &DataMap,
    ) -> anyhow::Result<LogicOutput> {
        (self.0)(results, inputs)
    }
}

/// Wrap a synchronous closure as [`StateLogic`]
pub fn logic_fn<F>(f: F) -> Arc<dyn StateLogic>
where
    F: Fn(&DataMap) -> anyhow::Result<LogicOutput> + Send + Sync + 'static,
{
    Arc::new(FnLogic(f))
}

/// Wrap a synchronous closure as [`DeciderLogic`]
pub fn decider_fn<F>(f: F) -> Arc<dyn DeciderLogic>
where
    F: Fn(&BarrierResults, &DataMap) -> anyhow::Result<LogicOutput> + Send + Sync + 'static,
{
    Arc::new(FnDecider(f))
}

/// Logic reference of a state: a registry name, an instance, or both
pub struct LogicBinding<T: ?Sized> {
    name: Option<String>,
    logic: Option<Arc<T>>,
}

impl<T: ?Sized> LogicBinding<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            logic: None,
        }
    }

    pub fn bound(logic: Arc<T>) -> Self {
        Self {
            name: None,
            logic: Some(logic),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn logic(&self) -> Option<&Arc<T>> {
        self.logic.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.logic.is_some()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub(crate) fn bind(&mut self, logic: Arc<T>) {
        self.logic = Some(logic);
    }

    fn resolve(
        &self,
        lookup: impl FnOnce(&str) -> Option<Arc<T>>,
    ) -> Result<Arc<T>, String> {
        if let Some(logic) = &self.logic {
            return Ok(Arc::clone(logic));
        }
        match &self.name {
            Some(name) => lookup(name).ok_or_else(|| format!("no logic registered as '{}'", name)),
            None => Err("no logic bound to state".to_string()),
        }
    }
}

impl<T: ?Sized> Default for LogicBinding<T> {
    fn default() -> Self {
        Self {
            name: None,
            logic: None,
        }
    }
}

impl<T: ?Sized> Clone for LogicBinding<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            logic: self.logic.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for LogicBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicBinding")
            .field("name", &self.name)
            .field("bound", &self.logic.is_some())
            .finish()
    }
}

/// Name -> logic table used to bind states that reference logic by name
#[derive(Clone, Default)]
pub struct LogicRegistry {
    state_logic: HashMap<String, Arc<dyn StateLogic>>,
    deciders: HashMap<String, Arc<dyn DeciderLogic>>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_logic(&mut self, name: impl Into<String>, logic: Arc<dyn StateLogic>) {
        self.state_logic.insert(name.into(), logic);
    }

    pub fn register_decider(&mut self, name: impl Into<String>, logic: Arc<dyn DeciderLogic>) {
        self.deciders.insert(name.into(), logic);
    }

    pub fn state_logic(&self, name: &str) -> Option<Arc<dyn StateLogic>> {
        self.state_logic.get(name).cloned()
    }

    pub fn decider(&self, name: &str) -> Option<Arc<dyn DeciderLogic>> {
        self.deciders.get(name).cloned()
    }
}

impl fmt::Debug for LogicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut logic: Vec<_> = self.state_logic.keys().collect();
        logic.sort();
        let mut deciders: Vec<_> = self.deciders.keys().collect();
        deciders.sort();
        f.debug_struct("LogicRegistry")
            .field("state_logic", &logic)
            .field("deciders", &deciders)
            .finish()
    }
}

impl State {
    pub(crate) async fn run_execution(
        &self,
        ctx: &ExecutionContext,
        binding: &LogicBinding<dyn StateLogic>,
        input: DataMap,
    ) -> StateOutput {
        let inputs = match self.prepare_inputs(input) {
            Ok(inputs) => inputs,
            Err(reason) => return self.logic_fault(reason),
        };
        let logic = match binding.resolve(|name| ctx.services().logic_registry().state_logic(name)) {
            Ok(logic) => logic,
            Err(reason) => return self.logic_fault(reason),
        };
        self.guard_logic(ctx, logic.execute(ctx, &inputs)).await
    }

    pub(crate) async fn run_decider_logic(
        &self,
        ctx: &ExecutionContext,
        binding: &LogicBinding<dyn DeciderLogic>,
        input: DataMap,
        results: &BarrierResults,
    ) -> StateOutput {
        let inputs = match self.prepare_inputs(input) {
            Ok(inputs) => inputs,
            Err(reason) => return self.logic_fault(reason),
        };
        let logic = match binding.resolve(|name| ctx.services().logic_registry().decider(name)) {
            Ok(logic) => logic,
            Err(reason) => return self.logic_fault(reason),
        };
        self.guard_logic(ctx, logic.decide(ctx, results, &inputs)).await
    }

    /// Race logic against preemption and turn its result into a [`StateOutput`]
    async fn guard_logic<F>(&self, ctx: &ExecutionContext, execution: F) -> StateOutput
    where
        F: Future<Output = anyhow::Result<LogicOutput>> + Send,
    {
        let result = {
            let execution = AssertUnwindSafe(execution).catch_unwind();
            tokio::select! {
                biased;
                _ = ctx.preempted() => None,
                result = execution => Some(result),
            }
        };

        let logic_output = match result {
            None => {
                warn!(state_id = %self.state_id, "Logic preempted");
                return StateOutput::preempted();
            }
            Some(Err(_panic)) => return self.logic_fault("logic panicked"),
            Some(Ok(Err(e))) if e.downcast_ref::<Preempted>().is_some() || ctx.is_preempted() => {
                warn!(state_id = %self.state_id, "Logic stopped after preemption");
                return StateOutput::preempted();
            }
            Some(Ok(Err(e))) => return self.logic_fault(format!("{:#}", e)),
            Some(Ok(Ok(output))) => output,
        };

        if ctx.is_preempted() {
            return StateOutput::preempted();
        }

        let outcome = match self.outcome(logic_output.outcome_id) {
            Some(outcome) => outcome.clone(),
            None => {
                return self.logic_fault(format!(
                    "logic returned undeclared outcome {}",
                    logic_output.outcome_id
                ))
            }
        };
        StateOutput::new(outcome, self.collect_outputs(logic_output.outputs))
    }

    /// Keep declared outputs only, filling the missing ones with their defaults
    fn collect_outputs(&self, mut produced: DataMap) -> DataMap {
        let mut output = DataMap::new();
        for port in self.output_data_ports.values() {
            let value = produced
                .remove(&port.name)
                .unwrap_or_else(|| port.default_or_null());
            if !port.data_type.accepts(&value) {
                warn!(
                    state_id = %self.state_id,
                    port = %port.name,
                    data_type = %port.data_type,
                    "Output value does not match the port type"
                );
            }
            output.insert(port.name.clone(), value);
        }
        for key in produced.keys() {
            warn!(state_id = %self.state_id, key = %key, "Dropping undeclared output");
        }
        output
    }

    fn logic_fault(&self, reason: impl Into<String>) -> StateOutput {
        let reason = reason.into();
        error!(state_id = %self.state_id, name = %self.name, error = %reason, "State logic failed");
        StateOutput::fault(reason)
    }
}
