//! Library states: references to reusable sub-hierarchies resolved at run time.

use super::{State, StateOutput};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::port::{DataMap, PortDirection};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error};

/// `(library_path, library_name)` pair identifying a stored sub-hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryReference {
    pub library_path: String,
    pub library_name: String,
}

impl LibraryReference {
    pub fn new(library_path: impl Into<String>, library_name: impl Into<String>) -> Self {
        Self {
            library_path: library_path.into(),
            library_name: library_name.into(),
        }
    }
}

impl fmt::Display for LibraryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.library_path, self.library_name)
    }
}

/// Errors reported by a [`LibraryResolver`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    #[error("Library path '{library_path}' is not mounted")]
    UnknownLibraryPath { library_path: String },

    #[error("Library '{library_path}/{library_name}' not found")]
    NotFound {
        library_path: String,
        library_name: String,
    },

    #[error("Failed to load library '{library_path}/{library_name}': {reason}")]
    LoadFailed {
        library_path: String,
        library_name: String,
        reason: String,
    },
}

/// Resolves library references to fully formed sub-hierarchies
pub trait LibraryResolver: Send + Sync {
    fn resolve(&self, library_path: &str, library_name: &str) -> std::result::Result<State, LibraryError>;
}

impl State {
    /// Library state exposing the interface (ports and outcomes) of `library_root`
    pub fn library_from(
        name: impl Into<String>,
        reference: LibraryReference,
        library_root: &State,
    ) -> Result<Self> {
        let mut state = State::library(name, reference.library_path, reference.library_name);
        for port in library_root.input_data_ports.values() {
            state.add_data_port(PortDirection::Input, port.clone())?;
        }
        for port in library_root.output_data_ports.values() {
            state.add_data_port(PortDirection::Output, port.clone())?;
        }
        for outcome in library_root.outcomes.values() {
            if state.outcome(outcome.outcome_id).is_none() {
                state.add_outcome(outcome.name.clone(), Some(outcome.outcome_id))?;
            }
        }
        Ok(state)
    }

    pub(crate) async fn run_library(
        &self,
        ctx: &ExecutionContext,
        reference: &LibraryReference,
        input: DataMap,
    ) -> Result<StateOutput> {
        let inputs = match self.prepare_inputs(input) {
            Ok(inputs) => inputs,
            Err(reason) => return Ok(self.library_fault(reference, reason)),
        };
        let Some(resolver) = ctx.services().library_resolver() else {
            return Ok(self.library_fault(reference, "no library resolver configured"));
        };
        let library = match resolver.resolve(&reference.library_path, &reference.library_name) {
            Ok(library) => library,
            Err(e) => return Ok(self.library_fault(reference, e.to_string())),
        };
        debug!(state_id = %self.state_id, library = %reference, "Resolved library");

        let library_inputs: DataMap = library
            .input_data_ports
            .values()
            .filter_map(|port| {
                inputs
                    .get(&port.name)
                    .map(|value| (port.name.clone(), value.clone()))
            })
            .collect();

        let result = library.run(ctx, library_inputs).await?;
        if result.is_preempted() {
            return Ok(StateOutput::preempted());
        }
        let Some(outcome) = self.outcome(result.outcome.outcome_id).cloned() else {
            return Ok(self.library_fault(
                reference,
                format!("library returned outcome {} which this state does not declare", result.outcome.outcome_id),
            ));
        };

        let mut output = DataMap::new();
        for port in self.output_data_ports.values() {
            let value = result
                .output
                .get(&port.name)
                .cloned()
                .unwrap_or_else(|| port.default_or_null());
            output.insert(port.name.clone(), value);
        }
        Ok(StateOutput {
            outcome,
            output,
            error: result.error,
        })
    }

    fn library_fault(&self, reference: &LibraryReference, reason: impl Into<String>) -> StateOutput {
        let reason = reason.into();
        error!(state_id = %self.state_id, library = %reference, error = %reason, "Library state failed");
        StateOutput::fault(reason)
    }
}
