//! Engine interface traits consumed by the management layer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::types::{
    ChangeNotification, Entry, ObserverMode, OpenOptions, Query, SecurityOption, SyncMode,
};
use crate::EngineError;

/// Completion callback for a sync request.
///
/// Invoked exactly once with the per-device outcome of the exchange.
pub type SyncCompletion = Box<dyn FnOnce(HashMap<String, Result<(), EngineError>>) + Send>;

/// Receiver for change notifications on one store.
pub trait KvObserver: Send + Sync {
    /// Called after a batch of changes has been applied to the store.
    fn on_change(&self, change: &ChangeNotification);
}

/// A snapshot cursor over one prefix of a store.
///
/// Result sets stay valid until closed through the delegate that produced
/// them; the management layer tracks every live result set and releases
/// them before the store is torn down.
pub trait KvResultSet: Send + Sync {
    /// Number of entries visible to this result set.
    fn count(&self) -> usize;

    /// Returns the entry at `index`, or `None` past the end.
    fn entry_at(&self, index: usize) -> Option<Entry>;
}

/// One open store.
///
/// A delegate is exclusively owned by a single holder at a time and must be
/// returned to its [`DelegateManager`] for closing.
#[allow(clippy::module_name_repetitions)]
pub trait KvStoreDelegate: Send + Sync {
    /// Writes one key/value pair.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the key is absent.
    fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>>;

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn delete(&self, key: &[u8]) -> EngineResult<()>;

    /// Writes a batch of entries atomically.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure; no entry is applied then.
    fn put_batch(&self, entries: &[Entry]) -> EngineResult<()>;

    /// Removes a batch of keys atomically.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure; no key is removed then.
    fn delete_batch(&self, keys: &[Vec<u8>]) -> EngineResult<()>;

    /// Removes every entry of the store.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn clear(&self) -> EngineResult<()>;

    /// Begins a transaction on this store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] when a transaction is already open.
    fn start_transaction(&self) -> EngineResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn commit(&self) -> EngineResult<()>;

    /// Rolls the open transaction back.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn rollback(&self) -> EngineResult<()>;

    /// Registers `observer` for changes matching `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgs`] when the observer is already
    /// registered on this store.
    fn register_observer(
        &self,
        mode: ObserverMode,
        observer: Arc<dyn KvObserver>,
    ) -> EngineResult<()>;

    /// Removes a previously registered observer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the observer is unknown.
    fn unregister_observer(&self, observer: &Arc<dyn KvObserver>) -> EngineResult<()>;

    /// Returns every entry whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when nothing matches.
    fn get_entries(&self, prefix: &[u8]) -> EngineResult<Vec<Entry>>;

    /// Returns every entry matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when nothing matches.
    fn get_entries_by_query(&self, query: &Query) -> EngineResult<Vec<Entry>>;

    /// Counts the entries matching `query`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn get_count(&self, query: &Query) -> EngineResult<usize>;

    /// Opens a result set over `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn open_result_set(&self, prefix: &[u8]) -> EngineResult<Arc<dyn KvResultSet>>;

    /// Releases a result set produced by this delegate.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the result set is unknown.
    fn close_result_set(&self, result_set: &Arc<dyn KvResultSet>) -> EngineResult<()>;

    /// Starts a sync exchange with `devices` and reports the outcome
    /// through `completion`, which is invoked exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] when the engine cannot accept the
    /// request right now; `completion` is not invoked then.
    fn sync(
        &self,
        devices: &[String],
        mode: SyncMode,
        completion: SyncCompletion,
    ) -> EngineResult<()>;

    /// Drops all data that originated from `device_id`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn remove_device_data(&self, device_id: &str) -> EngineResult<()>;

    /// Replaces the store's cipher key with `key`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure; the old key stays valid then.
    fn rekey(&self, key: &[u8]) -> EngineResult<()>;

    /// Exports the store contents to `path`, protected by `key`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure; `path` is left untouched then.
    fn export(&self, path: &Path, key: &[u8]) -> EngineResult<()>;

    /// Replaces the store contents from an export at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CorruptedOrBadKey`] when `key` does not open
    /// the export.
    fn import(&self, path: &Path, key: &[u8]) -> EngineResult<()>;

    /// Reads the security option the store was created with.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotSupported`] when the engine carries no
    /// security metadata.
    fn get_security_option(&self) -> EngineResult<SecurityOption>;

    /// Enables or disables engine-driven automatic sync.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn set_auto_sync(&self, enabled: bool) -> EngineResult<()>;

    /// Writes a device-local (never synced) record.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn put_local(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Reads a device-local record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the key is absent.
    fn get_local(&self, key: &[u8]) -> EngineResult<Vec<u8>>;

    /// Removes a device-local record.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn delete_local(&self, key: &[u8]) -> EngineResult<()>;
}

/// Factory for store delegates under one `(app id, account id)` identity.
pub trait DelegateManager: Send + Sync {
    /// Opens (or creates) the store named `store_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the store does not exist and
    /// `create_if_missing` is off, [`EngineError::CorruptedOrBadKey`] when
    /// the cipher key does not open an existing encrypted store.
    fn open(&self, store_id: &str, options: &OpenOptions)
        -> EngineResult<Arc<dyn KvStoreDelegate>>;

    /// Closes a delegate previously produced by this manager.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure; the delegate stays open then.
    fn close(&self, delegate: Arc<dyn KvStoreDelegate>) -> EngineResult<()>;

    /// Deletes the physical store named `store_id`.
    ///
    /// # Errors
    ///
    /// Returns an engine status on failure.
    fn delete_store(&self, store_id: &str) -> EngineResult<()>;
}

/// A storage engine: produces delegate managers for identities.
pub trait Engine: Send + Sync {
    /// Creates a delegate manager for `(app_id, account_id)` rooted at
    /// `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an engine status when the manager cannot be constructed.
    fn delegate_manager(
        &self,
        app_id: &str,
        account_id: &str,
        data_dir: &Path,
    ) -> EngineResult<Arc<dyn DelegateManager>>;
}
