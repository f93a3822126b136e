//! Execution context threaded through every running state.
//!
//! The context carries the cooperative control signals of a run and the shared
//! collaborators (global variables, library resolver, logic registry, event bus):
//!
//! - **Preemption**: a [`CancellationToken`]. Concurrency states hand each group of
//!   children a child token, so cancelling a parent cascades top-down while cancelling
//!   a child group leaves the parent untouched.
//! - **Pause**: a watch channel owned by the engine. Running states wait at their
//!   checkpoints while it reads `true`.
//!
//! Neither signal force-terminates anything: states observe them at
//! [`ExecutionContext::checkpoint`] and at the await points of their logic.

use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::global_variables::{GlobalVariableStore, InMemoryGlobalVariables};
use crate::state::{LibraryResolver, LogicRegistry};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Returned by [`ExecutionContext::checkpoint`] once the running unit has been preempted.
///
/// Logic can propagate it with `?`; the state then reports the `preempted` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution preempted")]
pub struct Preempted;

/// Collaborators shared by all states of a run
pub struct ExecutionServices {
    config: EngineConfig,
    events: EventBus,
    global_variables: Arc<dyn GlobalVariableStore>,
    library_resolver: Option<Arc<dyn LibraryResolver>>,
    logic_registry: LogicRegistry,
}

impl ExecutionServices {
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            events,
            global_variables: Arc::new(InMemoryGlobalVariables::new()),
            library_resolver: None,
            logic_registry: LogicRegistry::new(),
        }
    }

    pub fn with_global_variables(mut self, store: Arc<dyn GlobalVariableStore>) -> Self {
        self.global_variables = store;
        self
    }

    pub fn with_library_resolver(mut self, resolver: Arc<dyn LibraryResolver>) -> Self {
        self.library_resolver = Some(resolver);
        self
    }

    pub fn with_logic_registry(mut self, registry: LogicRegistry) -> Self {
        self.logic_registry = registry;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn global_variables(&self) -> &Arc<dyn GlobalVariableStore> {
        &self.global_variables
    }

    pub fn library_resolver(&self) -> Option<&Arc<dyn LibraryResolver>> {
        self.library_resolver.as_ref()
    }

    pub fn logic_registry(&self) -> &LogicRegistry {
        &self.logic_registry
    }
}

impl Default for ExecutionServices {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for ExecutionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionServices")
            .field("config", &self.config)
            .field("library_resolver", &self.library_resolver.is_some())
            .field("logic_registry", &self.logic_registry)
            .finish()
    }
}

/// Per-unit execution context
#[derive(Clone)]
pub struct ExecutionContext {
    services: Arc<ExecutionServices>,
    preemption: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Create a standalone context that is never paused.
    ///
    /// Used to run a state directly, outside the [`ExecutionEngine`](crate::ExecutionEngine).
    /// Preempt the run through [`ExecutionContext::token`].
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        let (_tx, pause) = watch::channel(false);
        Self::with_controls(services, CancellationToken::new(), pause)
    }

    pub(crate) fn with_controls(
        services: Arc<ExecutionServices>,
        preemption: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> Self {
        Self {
            services,
            preemption,
            pause,
        }
    }

    /// Derive a context whose preemption is cascaded from this one but can be
    /// cancelled independently
    pub fn child(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            preemption: self.preemption.child_token(),
            pause: self.pause.clone(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.preemption
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn events(&self) -> &EventBus {
        self.services.events()
    }

    pub fn global_variables(&self) -> &dyn GlobalVariableStore {
        self.services.global_variables().as_ref()
    }

    pub fn is_preempted(&self) -> bool {
        self.preemption.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Completes once this unit has been preempted
    pub async fn preempted(&self) {
        self.preemption.cancelled().await
    }

    /// Cooperative checkpoint.
    ///
    /// Returns `Err(Preempted)` if the unit was preempted, and waits while the engine
    /// is paused. A preemption during the pause ends the wait.
    pub async fn checkpoint(&self) -> Result<(), Preempted> {
        if self.is_preempted() {
            return Err(Preempted);
        }
        let mut pause = self.pause.clone();
        while *pause.borrow_and_update() {
            tokio::select! {
                biased;
                _ = self.preemption.cancelled() => return Err(Preempted),
                changed = pause.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if self.is_preempted() {
            Err(Preempted)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("preempted", &self.is_preempted())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn services() -> Arc<ExecutionServices> {
        Arc::new(ExecutionServices::default())
    }

    #[tokio::test]
    async fn test_checkpoint_passes_when_idle() {
        let ctx = ExecutionContext::new(services());
        assert!(ctx.checkpoint().await.is_ok());
        assert!(!ctx.is_paused());
    }

    #[tokio::test]
    async fn test_child_preemption_does_not_reach_parent() {
        let parent = ExecutionContext::new(services());
        let child = parent.child();

        child.token().cancel();
        assert_eq!(child.checkpoint().await, Err(Preempted));
        assert!(parent.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_parent_preemption_cascades() {
        let parent = ExecutionContext::new(services());
        let child = parent.child();
        let grandchild = child.child();

        parent.token().cancel();
        assert!(child.is_preempted());
        assert_eq!(grandchild.checkpoint().await, Err(Preempted));
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let (tx, rx) = watch::channel(true);
        let ctx = ExecutionContext::with_controls(services(), CancellationToken::new(), rx);

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.checkpoint().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send_replace(false);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_preemption_ends_pause() {
        let (_tx, rx) = watch::channel(true);
        let token = CancellationToken::new();
        let ctx = ExecutionContext::with_controls(services(), token.clone(), rx);

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.checkpoint().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Preempted));
    }
}
