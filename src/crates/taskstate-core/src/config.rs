//! Engine configuration.
//!
//! Loaded from YAML with `${ENV_VAR:default}` expansion in string values. Every field
//! has a default, so an empty document is a valid configuration.
//!
//! ```yaml
//! barrier_default_outcome: first_child
//! event_capacity: 512
//! library_paths:
//!   generic: ${TASKSTATE_LIB_PATH:/opt/taskstate/libraries}/generic
//! ```

use crate::error::{Result, TaskStateError};
use crate::event::DEFAULT_EVENT_CAPACITY;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Composite outcome of a barrier concurrency state that has no decider child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierDefaultOutcome {
    /// `aborted` if any child aborted, else `preempted` if any child was preempted,
    /// else `success`
    #[default]
    AbortOnFailure,
    /// Outcome of the child with the lowest state id, routed through the transitions
    FirstChild,
}

/// Configuration of the execution engine and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy for barrier states without a decider
    pub barrier_default_outcome: BarrierDefaultOutcome,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,

    /// Library mount points: `library_path` key -> directory
    pub library_paths: BTreeMap<String, PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            barrier_default_outcome: BarrierDefaultOutcome::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            library_paths: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut value: YamlValue = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        expand_variables(&mut value);
        let config: Self = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TaskStateError::Configuration(format!("Failed to read {:?}: {}", path, e))
        })?;
        Self::from_yaml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(TaskStateError::Configuration(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_variables(value: &mut YamlValue) {
    match value {
        YamlValue::String(s) => {
            if let Some(expanded) = expand_env_in_string(s) {
                *s = expanded;
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

fn env_reference() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").expect("env reference pattern is valid")
    })
}

/// Expand `${ENV_VAR:default_value}` references in a string
fn expand_env_in_string(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    let expanded = env_reference().replace_all(s, |cap: &Captures<'_>| {
        env::var(&cap[1]).unwrap_or_else(|_| {
            cap.get(2)
                .map(|default| default.as_str().to_string())
                .unwrap_or_default()
        })
    });
    Some(expanded.into_owned())
}
