//! Directory-tree persistence of state machines.
//!
//! ```text
//! <dir>/statemachine.json            manifest
//! <dir>/<ROOT>/core_data.json        root state
//! <dir>/<ROOT>/<CHILD>/core_data.json
//! ...
//! ```
//!
//! Each container state's directory holds one subdirectory per child, named by the
//! child's id. Loading rebuilds the tree bottom-up through the model's validating
//! operations.

use crate::descriptor::{Manifest, StateDescriptor, FORMAT_VERSION};
use crate::error::{Result, StorageError};
use crate::serializer::StorageFormat;
use std::fs;
use std::path::{Path, PathBuf};
use taskstate_core::{validate_state_id, State, StateMachine};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Base name of the manifest file
pub const MANIFEST_FILE: &str = "statemachine";

/// Base name of each state's descriptor file
pub const STATE_FILE: &str = "core_data";

/// Saves and loads state machines in one [`StorageFormat`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachineStorage {
    format: StorageFormat,
}

impl StateMachineStorage {
    pub fn new(format: StorageFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    fn file_name(format: StorageFormat, base: &str) -> String {
        format!("{}.{}", base, format.extension())
    }

    /// Path of the manifest this storage writes under `dir`
    pub fn manifest_path(&self, dir: &Path) -> PathBuf {
        dir.join(Self::file_name(self.format, MANIFEST_FILE))
    }

    /// Whether `dir` contains a stored state machine in any format
    pub fn contains_state_machine(dir: &Path) -> bool {
        StorageFormat::ALL
            .iter()
            .any(|format| dir.join(Self::file_name(*format, MANIFEST_FILE)).is_file())
    }

    /// Relative paths of the state machines stored below `root`, sorted.
    ///
    /// Hidden entries are skipped and stored machines are not searched for nested
    /// ones.
    pub fn find_state_machines(root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let root = root.as_ref();
        let mut found = Vec::new();
        Self::collect_state_machines(root, Path::new(""), &mut found)?;
        found.sort();
        Ok(found)
    }

    fn collect_state_machines(
        root: &Path,
        relative: &Path,
        found: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for entry in fs::read_dir(root.join(relative))? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let relative = relative.join(&name);
            if Self::contains_state_machine(&root.join(&relative)) {
                found.push(relative);
            } else {
                Self::collect_state_machines(root, &relative, found)?;
            }
        }
        Ok(())
    }

    /// Load every state machine below `source` and save it in this storage's format
    /// at the same relative path below `target`.
    ///
    /// `target` may equal `source` to convert in place. Returns the relative paths
    /// written.
    pub fn resave_all(
        &self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        let (source, target) = (source.as_ref(), target.as_ref());
        let found = Self::find_state_machines(source)?;
        for relative in &found {
            let mut state_machine = self.load(source.join(relative))?;
            self.save(&mut state_machine, target.join(relative))?;
        }
        info!(
            source = %source.display(),
            target = %target.display(),
            count = found.len(),
            format = %self.format,
            "Re-saved state machines"
        );
        Ok(found)
    }

    /// Write `state_machine` to `dir`.
    ///
    /// The new tree and manifest are staged under hidden names and moved into place
    /// only once fully written; any failure before that leaves a previously saved
    /// machine in `dir` untouched. On success the machine records `dir` as its file
    /// system path and is no longer dirty.
    pub fn save(&self, state_machine: &mut StateMachine, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let root = state_machine.root_state();
        validate_tree(root)?;
        fs::create_dir_all(dir)?;
        let previous = self.previous_saves(dir)?;
        let tree = dir.join(root.state_id());
        let owned = previous
            .iter()
            .any(|stale| stale.root_state_id.as_deref() == Some(root.state_id()));
        if tree.exists() && !owned {
            return Err(StorageError::corrupt(
                &tree,
                "directory is not part of a saved state machine; refusing to replace it",
            ));
        }

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            state_machine_id: state_machine.state_machine_id(),
            root_state_id: root.state_id().to_string(),
            creation_time: state_machine.creation_time(),
            last_update: state_machine.last_update(),
        };
        let save_id = Uuid::new_v4().simple().to_string();
        let staged_tree = dir.join(format!(".{}.saving-{}", manifest.root_state_id, save_id));
        let manifest_path = self.manifest_path(dir);
        let staged_manifest = dir.join(format!(
            ".{}.saving-{}",
            Self::file_name(self.format, MANIFEST_FILE),
            save_id
        ));

        let staged = self.write_state(root, &staged_tree).and_then(|count| {
            fs::write(&staged_manifest, self.format.dumps(&manifest)?)?;
            Ok(count)
        });
        let count = match staged {
            Ok(count) => count,
            Err(e) => {
                discard(&staged_tree);
                discard(&staged_manifest);
                return Err(e);
            }
        };

        let replaced = dir.join(format!(".{}.replaced-{}", manifest.root_state_id, save_id));
        if let Err(e) = commit(&staged_tree, &tree, &replaced, &staged_manifest, &manifest_path) {
            discard(&staged_tree);
            discard(&staged_manifest);
            return Err(e);
        }

        discard(&replaced);
        for stale in previous {
            if stale.manifest != manifest_path {
                fs::remove_file(&stale.manifest)?;
            }
            if let Some(root_state_id) = stale.root_state_id {
                let stale_tree = dir.join(&root_state_id);
                if root_state_id != manifest.root_state_id && stale_tree.is_dir() {
                    debug!(path = %stale_tree.display(), "Removing previously saved tree");
                    fs::remove_dir_all(&stale_tree)?;
                }
            }
        }

        state_machine.set_file_system_path(dir);
        state_machine.clear_dirty();
        info!(
            state_machine_id = %manifest.state_machine_id,
            path = %dir.display(),
            states = count,
            format = %self.format,
            "Saved state machine"
        );
        Ok(())
    }

    /// Manifests already in `dir` and the trees they own.
    ///
    /// A tree is only claimed when its directory holds the descriptor of the state the
    /// manifest names. Anything else is refused.
    fn previous_saves(&self, dir: &Path) -> Result<Vec<PreviousSave>> {
        let mut previous = Vec::new();
        for format in StorageFormat::ALL {
            let manifest = dir.join(Self::file_name(format, MANIFEST_FILE));
            if !manifest.is_file() {
                continue;
            }
            let stored = match read_file::<Manifest>(format, &manifest) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %manifest.display(), error = %e, "Ignoring unreadable manifest");
                    previous.push(PreviousSave {
                        manifest,
                        root_state_id: None,
                    });
                    continue;
                }
            };
            validate_state_id(&stored.root_state_id)
                .map_err(|e| StorageError::corrupt(&manifest, e))?;
            let tree = dir.join(&stored.root_state_id);
            if !tree.exists() {
                previous.push(PreviousSave {
                    manifest,
                    root_state_id: None,
                });
                continue;
            }
            let descriptor_path = tree.join(Self::file_name(format, STATE_FILE));
            let owned = descriptor_path.is_file()
                && read_file::<StateDescriptor>(format, &descriptor_path)
                    .map_or(false, |descriptor| descriptor.state_id == stored.root_state_id);
            if !owned {
                return Err(StorageError::corrupt(
                    &manifest,
                    format!(
                        "'{}' is not a saved state '{}'; refusing to replace it",
                        tree.display(),
                        stored.root_state_id
                    ),
                ));
            }
            previous.push(PreviousSave {
                manifest,
                root_state_id: Some(stored.root_state_id),
            });
        }
        Ok(previous)
    }

    /// Read the state machine stored in `dir`.
    ///
    /// The manifest may be in any supported format; this storage's own format is
    /// tried first.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<StateMachine> {
        let dir = dir.as_ref();
        let format = self
            .detect_format(dir)
            .ok_or_else(|| StorageError::NotFound(dir.to_path_buf()))?;
        let manifest_path = dir.join(Self::file_name(format, MANIFEST_FILE));
        let manifest: Manifest = read_file(format, &manifest_path)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: manifest_path,
                found: manifest.format_version,
                supported: FORMAT_VERSION,
            });
        }

        validate_state_id(&manifest.root_state_id)
            .map_err(|e| StorageError::corrupt(&manifest_path, e))?;
        let root = load_state(format, &dir.join(&manifest.root_state_id), &manifest.root_state_id)?;
        let mut state_machine = StateMachine::new(root)
            .with_id(manifest.state_machine_id)
            .with_timestamps(manifest.creation_time, manifest.last_update);
        state_machine.set_file_system_path(dir);
        info!(
            state_machine_id = %manifest.state_machine_id,
            path = %dir.display(),
            format = %format,
            "Loaded state machine"
        );
        Ok(state_machine)
    }

    fn detect_format(&self, dir: &Path) -> Option<StorageFormat> {
        std::iter::once(self.format)
            .chain(StorageFormat::ALL)
            .find(|format| dir.join(Self::file_name(*format, MANIFEST_FILE)).is_file())
    }
}

/// Manifest found in a directory before saving over it
struct PreviousSave {
    manifest: PathBuf,
    /// Root tree owned by the manifest, if one exists on disk
    root_state_id: Option<String>,
}

fn validate_tree(state: &State) -> Result<()> {
    validate_state_id(state.state_id())?;
    state.children().try_for_each(validate_tree)
}

/// Move a staged tree and manifest into place, restoring the replaced tree on failure
fn commit(
    staged_tree: &Path,
    tree: &Path,
    replaced: &Path,
    staged_manifest: &Path,
    manifest: &Path,
) -> Result<()> {
    let had_tree = tree.exists();
    if had_tree {
        fs::rename(tree, replaced)?;
    }
    let moved = fs::rename(staged_tree, tree).and_then(|()| {
        fs::rename(staged_manifest, manifest).map_err(|e| {
            discard(tree);
            e
        })
    });
    if let Err(e) = moved {
        if had_tree {
            if let Err(restore) = fs::rename(replaced, tree) {
                error!(
                    path = %replaced.display(),
                    error = %restore,
                    "Failed to restore previously saved tree"
                );
            }
        }
        return Err(e.into());
    }
    Ok(())
}

/// Best-effort removal of a staged or replaced file or directory
fn discard(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = removed {
        warn!(path = %path.display(), error = %e, "Failed to remove leftover save data");
    }
}

fn read_file<T: serde::de::DeserializeOwned>(format: StorageFormat, path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    format
        .loads(&bytes)
        .map_err(|e| StorageError::corrupt(path, e))
}

fn load_state(format: StorageFormat, dir: &Path, expected_id: &str) -> Result<State> {
    let path = dir.join(StateMachineStorage::file_name(format, STATE_FILE));
    if !path.is_file() {
        return Err(StorageError::corrupt(
            path,
            format!("missing descriptor of state '{}'", expected_id),
        ));
    }
    let descriptor: StateDescriptor = read_file(format, &path)?;
    if descriptor.state_id != expected_id {
        return Err(StorageError::corrupt(
            path,
            format!(
                "descriptor is for state '{}', expected '{}'",
                descriptor.state_id, expected_id
            ),
        ));
    }

    let mut children = Vec::with_capacity(descriptor.children.len());
    for child_id in &descriptor.children {
        validate_state_id(child_id).map_err(|e| StorageError::corrupt(&path, e))?;
        children.push(load_state(format, &dir.join(child_id), child_id)?);
    }
    let state = descriptor
        .build(children)
        .map_err(|e| StorageError::corrupt(&path, e))?;
    debug!(state_id = %state.state_id(), path = %path.display(), "Loaded state");
    Ok(state)
}
