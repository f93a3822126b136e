//! # taskstate-storage - Persistence for Task State Machines
//!
//! Saves [`StateMachine`](taskstate_core::StateMachine)s as a directory tree with one
//! descriptor file per state, loads them back through the model's validating
//! operations, and resolves library states from mounted library directories.
//!
//! ## Layout
//!
//! ```text
//! my_machine/
//! ├── statemachine.json          manifest: format version, ids, timestamps
//! └── QWERTY/                    root state
//!     ├── core_data.json
//!     ├── ASDFGH/core_data.json  child states, nested by hierarchy
//!     └── ZXCVBN/core_data.json
//! ```
//!
//! JSON is the default; YAML is selected with [`StorageFormat::Yaml`]. Loading accepts
//! either.
//!
//! Logic is stored by name. Bind it at run time through a
//! [`LogicRegistry`](taskstate_core::LogicRegistry) on the execution services.
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskstate_core::{State, StateMachine};
//! use taskstate_storage::{StateMachineStorage, StorageFormat};
//!
//! # fn main() -> taskstate_storage::Result<()> {
//! let mut sm = StateMachine::new(State::hierarchy("Root"));
//! let storage = StateMachineStorage::new(StorageFormat::Yaml);
//! storage.save(&mut sm, "/tmp/my_machine")?;
//! let loaded = storage.load("/tmp/my_machine")?;
//! assert_eq!(loaded.root_state(), sm.root_state());
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod error;
pub mod library;
pub mod serializer;
pub mod storage;

pub use descriptor::{
    BuildError, DataFlowDescriptor, Manifest, OutcomeDescriptor, PortDescriptor,
    StateDescriptor, TransitionDescriptor, FORMAT_VERSION,
};
pub use error::{Result, StorageError};
pub use library::FileSystemLibraryManager;
pub use serializer::{JsonSerializer, SerializerProtocol, StorageFormat, YamlSerializer};
pub use storage::{StateMachineStorage, MANIFEST_FILE, STATE_FILE};
