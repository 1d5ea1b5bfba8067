//! Storage engine interface for MeshKV.
//!
//! The management layer in `meshkv-core` never talks to a concrete storage
//! engine directly. It consumes the traits defined here:
//!
//! * [`Engine`] — factory for per-identity delegate managers.
//! * [`DelegateManager`] — opens, closes and deletes stores for one
//!   `(app id, account id, data dir)` identity.
//! * [`KvStoreDelegate`] — one open store: data operations, transactions,
//!   observers, result sets, sync, rekey and export/import.
//!
//! A complete reference implementation backed by process memory (with
//! file-based export/import) ships in [`memory`]. It is the engine used by
//! the test suites and is suitable for embedders that want the management
//! layer without a persistent engine.

mod error;
pub mod memory;
mod traits;
mod types;

pub use error::{EngineError, EngineResult};
pub use memory::MemoryEngine;
pub use traits::{
    DelegateManager, Engine, KvObserver, KvResultSet, KvStoreDelegate, SyncCompletion,
};
pub use types::{
    ChangeNotification, ConflictPolicy, Entry, ObserverMode, OpenOptions, Query, SecurityLabel,
    SecurityOption, SyncMode,
};
