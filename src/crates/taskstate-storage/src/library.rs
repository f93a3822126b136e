//! Filesystem-backed library manager.
//!
//! Libraries are stored state machines under a mounted directory:
//! `<library_paths[library_path]>/<library_name>/statemachine.<ext>`, where
//! `library_name` may span several directories (`navigation/move_to`).

use crate::error::Result;
use crate::serializer::StorageFormat;
use crate::storage::StateMachineStorage;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use taskstate_core::{EngineConfig, LibraryError, LibraryReference, LibraryResolver, State};
use tracing::debug;

/// Resolves library references against mounted library directories
#[derive(Debug, Clone, Default)]
pub struct FileSystemLibraryManager {
    storage: StateMachineStorage,
    library_paths: BTreeMap<String, PathBuf>,
}

impl FileSystemLibraryManager {
    pub fn new(storage: StateMachineStorage) -> Self {
        Self {
            storage,
            library_paths: BTreeMap::new(),
        }
    }

    /// Manager mounting every `library_paths` entry of `config`
    pub fn from_config(config: &EngineConfig, storage: StateMachineStorage) -> Self {
        Self {
            storage,
            library_paths: config.library_paths.clone(),
        }
    }

    /// Mount `dir` under the key `library_path`, replacing any previous mount
    pub fn mount(&mut self, library_path: impl Into<String>, dir: impl Into<PathBuf>) {
        self.library_paths.insert(library_path.into(), dir.into());
    }

    pub fn library_paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.library_paths
    }

    fn library_dir(
        &self,
        library_path: &str,
        library_name: &str,
    ) -> std::result::Result<PathBuf, LibraryError> {
        let root = self
            .library_paths
            .get(library_path)
            .ok_or_else(|| LibraryError::UnknownLibraryPath {
                library_path: library_path.to_string(),
            })?;
        let relative = Path::new(library_name);
        let plain = !library_name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(LibraryError::NotFound {
                library_path: library_path.to_string(),
                library_name: library_name.to_string(),
            });
        }
        Ok(root.join(relative))
    }

    /// Names of the libraries stored anywhere below a mount point, sorted.
    ///
    /// Nested libraries are named by their `/`-separated path relative to the mount.
    pub fn list_libraries(&self, library_path: &str) -> Result<Vec<String>> {
        let Some(root) = self.library_paths.get(library_path) else {
            return Ok(Vec::new());
        };
        let names = StateMachineStorage::find_state_machines(root)?
            .iter()
            .map(|relative| {
                relative
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect();
        Ok(names)
    }

    /// Re-save every library of a mount point in `format`, in place
    pub fn resave_libraries(
        &self,
        library_path: &str,
        format: StorageFormat,
    ) -> Result<Vec<PathBuf>> {
        let root = self
            .library_paths
            .get(library_path)
            .ok_or_else(|| LibraryError::UnknownLibraryPath {
                library_path: library_path.to_string(),
            })?;
        StateMachineStorage::new(format).resave_all(root, root)
    }

    /// Library state named `name` exposing the interface of the referenced library
    pub fn library_state(
        &self,
        name: impl Into<String>,
        library_path: &str,
        library_name: &str,
    ) -> Result<State> {
        let root = self.resolve(library_path, library_name)?;
        Ok(State::library_from(
            name,
            LibraryReference::new(library_path, library_name),
            &root,
        )?)
    }

    fn load_root(
        &self,
        dir: &Path,
        library_path: &str,
        library_name: &str,
    ) -> std::result::Result<State, LibraryError> {
        let state_machine = self.storage.load(dir).map_err(|e| LibraryError::LoadFailed {
            library_path: library_path.to_string(),
            library_name: library_name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(state_machine.root_state().clone())
    }
}

impl LibraryResolver for FileSystemLibraryManager {
    fn resolve(
        &self,
        library_path: &str,
        library_name: &str,
    ) -> std::result::Result<State, LibraryError> {
        let dir = self.library_dir(library_path, library_name)?;
        if !StateMachineStorage::contains_state_machine(&dir) {
            return Err(LibraryError::NotFound {
                library_path: library_path.to_string(),
                library_name: library_name.to_string(),
            });
        }
        debug!(library_path, library_name, path = %dir.display(), "Resolving library");
        self.load_root(&dir, library_path, library_name)
    }
}
