//! Error types for state machine persistence

use std::path::PathBuf;
use taskstate_core::{LibraryError, TaskStateError};
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while saving or loading state machines
#[derive(Error, Debug)]
pub enum StorageError {
    /// A stored file is unreadable or references something that does not exist
    #[error("Corrupt state machine at {}: {reason}", path.display())]
    CorruptStateMachine { path: PathBuf, reason: String },

    /// The manifest was written by an incompatible version
    #[error("Unsupported format version {found} in {} (supported: {supported})", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// No stored state machine at the given location
    #[error("No state machine found at {}", .0.display())]
    NotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A library reference could not be resolved
    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    /// A model operation refused the stored structure
    #[error("Validation error: {0}")]
    Validation(#[from] TaskStateError),
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StorageError::CorruptStateMachine {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
