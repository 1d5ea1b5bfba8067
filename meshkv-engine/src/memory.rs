//! Reference in-memory engine.
//!
//! Backs every store with a process-wide map keyed by the manager's data
//! directory (plus the opening identity when `dir_by_store_id_only` is
//! off), so two managers rooted at the same directory observe the same
//! physical store, which is what the account migration protocol relies
//! on. Export and import write JSON snapshots to the filesystem, guarded
//! by a fingerprint of the cipher key, so the backup/recovery protocol can
//! be exercised end to end.
//!
//! The engine also exposes fault hooks (store corruption, export failure,
//! sync outcomes, remote-entry injection) used by the management layer's
//! test suites.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::traits::{
    DelegateManager, Engine, KvObserver, KvResultSet, KvStoreDelegate, SyncCompletion,
};
use crate::types::{
    ChangeNotification, Entry, ObserverMode, OpenOptions, Query, SecurityOption, SyncMode,
};

/// Stable fingerprint of a cipher key (FNV-1a fold).
///
/// Only used to detect a wrong key on open/import; not a security
/// boundary. Real engines derive this from their KDF.
fn key_fingerprint(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{hash:016x}")
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type StoreKey = (PathBuf, String);

#[derive(Default)]
struct StoreState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    local: BTreeMap<Vec<u8>, Vec<u8>>,
    origins: HashMap<Vec<u8>, String>,
    cipher_fingerprint: Option<String>,
    schema: String,
    auto_sync: bool,
    corrupted: bool,
    fail_next_export: bool,
    transaction: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
    observers: Vec<(ObserverMode, Arc<dyn KvObserver>)>,
    result_sets: Vec<Arc<MemoryResultSet>>,
    security: Option<SecurityOption>,
}

impl StoreState {
    fn guard_ready(&self) -> EngineResult<()> {
        if self.corrupted {
            return Err(EngineError::CorruptedOrBadKey);
        }
        Ok(())
    }
}

struct SharedStore {
    state: Mutex<StoreState>,
}

impl SharedStore {
    fn notify(&self, change: &ChangeNotification) {
        if change.is_empty() {
            return;
        }
        let observers = locked(&self.state).observers.clone();
        let foreign = !change.device_id.is_empty();
        for (mode, observer) in observers {
            let wants = if foreign {
                mode.includes_foreign()
            } else {
                mode.includes_native()
            };
            if wants {
                observer.on_change(change);
            }
        }
    }
}

#[derive(Default)]
struct SyncFaults {
    busy_remaining: u32,
    device_results: HashMap<String, EngineError>,
}

#[derive(Default)]
struct EngineInner {
    stores: Mutex<HashMap<StoreKey, Arc<SharedStore>>>,
    sync_faults: Mutex<SyncFaults>,
}

/// Process-memory storage engine with file-based export/import.
#[derive(Default, Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, data_dir: &Path, store_id: &str) -> Option<Arc<SharedStore>> {
        locked(&self.inner.stores)
            .get(&(data_dir.to_path_buf(), store_id.to_string()))
            .cloned()
    }

    /// Marks the store under `data_dir` as corrupted: every subsequent
    /// operation (including re-open) reports
    /// [`EngineError::CorruptedOrBadKey`] until a successful import.
    pub fn corrupt_store(&self, data_dir: &Path, store_id: &str) {
        if let Some(store) = self.lookup(data_dir, store_id) {
            locked(&store.state).corrupted = true;
        }
    }

    /// Makes the next export of the store fail with a generic engine
    /// error, leaving the target path untouched.
    pub fn fail_next_export(&self, data_dir: &Path, store_id: &str) {
        if let Some(store) = self.lookup(data_dir, store_id) {
            locked(&store.state).fail_next_export = true;
        }
    }

    /// Makes the next `count` sync requests report [`EngineError::Busy`].
    pub fn fail_sync_busy(&self, count: u32) {
        locked(&self.inner.sync_faults).busy_remaining = count;
    }

    /// Fixes the per-device outcome reported for `device_id` in every
    /// subsequent sync completion.
    pub fn set_sync_result(&self, device_id: &str, result: Result<(), EngineError>) {
        let mut faults = locked(&self.inner.sync_faults);
        match result {
            Ok(()) => {
                faults.device_results.remove(device_id);
            }
            Err(err) => {
                faults.device_results.insert(device_id.to_string(), err);
            }
        }
    }

    /// Applies `entries` to the store as if they had been synced in from
    /// `device_id`, notifying foreign observers.
    pub fn inject_remote_entries(
        &self,
        data_dir: &Path,
        store_id: &str,
        device_id: &str,
        entries: Vec<Entry>,
    ) {
        let Some(store) = self.lookup(data_dir, store_id) else {
            return;
        };
        let mut change = ChangeNotification {
            device_id: device_id.to_string(),
            ..ChangeNotification::default()
        };
        {
            let mut state = locked(&store.state);
            for entry in entries {
                let previous = state.data.insert(entry.key.clone(), entry.value.clone());
                state
                    .origins
                    .insert(entry.key.clone(), device_id.to_string());
                if previous.is_some() {
                    change.updated.push(entry);
                } else {
                    change.inserted.push(entry);
                }
            }
        }
        store.notify(&change);
    }
}

impl Engine for MemoryEngine {
    fn delegate_manager(
        &self,
        app_id: &str,
        account_id: &str,
        data_dir: &Path,
    ) -> EngineResult<Arc<dyn DelegateManager>> {
        Ok(Arc::new(MemoryDelegateManager {
            engine: Arc::clone(&self.inner),
            identity: format!("{app_id}/{account_id}"),
            data_dir: data_dir.to_path_buf(),
        }))
    }
}

struct MemoryDelegateManager {
    engine: Arc<EngineInner>,
    identity: String,
    data_dir: PathBuf,
}

impl MemoryDelegateManager {
    fn store_key(&self, store_id: &str, by_store_id: bool) -> StoreKey {
        if by_store_id {
            (self.data_dir.clone(), store_id.to_string())
        } else {
            (self.data_dir.clone(), format!("{}/{store_id}", self.identity))
        }
    }
}

impl DelegateManager for MemoryDelegateManager {
    fn open(
        &self,
        store_id: &str,
        options: &OpenOptions,
    ) -> EngineResult<Arc<dyn KvStoreDelegate>> {
        let key = self.store_key(store_id, options.dir_by_store_id_only);
        let requested = if options.encrypted {
            Some(key_fingerprint(&options.cipher_key))
        } else {
            None
        };

        let mut stores = locked(&self.engine.stores);
        let store = if let Some(existing) = stores.get(&key) {
            {
                let state = locked(&existing.state);
                if state.corrupted {
                    return Err(EngineError::CorruptedOrBadKey);
                }
                if state.cipher_fingerprint != requested {
                    return Err(EngineError::CorruptedOrBadKey);
                }
                if !state.schema.is_empty()
                    && !options.schema.is_empty()
                    && state.schema != options.schema
                {
                    return Err(EngineError::SchemaMismatch);
                }
            }
            Arc::clone(existing)
        } else {
            if !options.create_if_missing {
                return Err(EngineError::NotFound);
            }
            let state = StoreState {
                cipher_fingerprint: requested,
                schema: options.schema.clone(),
                security: options.security,
                ..StoreState::default()
            };
            let created = Arc::new(SharedStore {
                state: Mutex::new(state),
            });
            stores.insert(key, Arc::clone(&created));
            created
        };
        drop(stores);

        Ok(Arc::new(MemoryDelegate {
            store,
            engine: Arc::clone(&self.engine),
        }))
    }

    fn close(&self, delegate: Arc<dyn KvStoreDelegate>) -> EngineResult<()> {
        // Dropping the last reference releases the delegate; the shared
        // store stays resident until deleted.
        drop(delegate);
        Ok(())
    }

    fn delete_store(&self, store_id: &str) -> EngineResult<()> {
        let mut stores = locked(&self.engine.stores);
        // A store created with either directory policy answers to both keys.
        let by_dir = self.store_key(store_id, true);
        let by_identity = self.store_key(store_id, false);
        if stores.remove(&by_dir).is_none() && stores.remove(&by_identity).is_none() {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }
}

/// Snapshot cursor over one prefix.
struct MemoryResultSet {
    entries: Vec<Entry>,
}

impl KvResultSet for MemoryResultSet {
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn entry_at(&self, index: usize) -> Option<Entry> {
        self.entries.get(index).cloned()
    }
}

struct MemoryDelegate {
    store: Arc<SharedStore>,
    engine: Arc<EngineInner>,
}

#[derive(Serialize, Deserialize)]
struct ExportFile {
    key_fingerprint: Option<String>,
    entries: Vec<Entry>,
}

impl MemoryDelegate {
    fn collect_prefix(state: &StoreState, prefix: &[u8]) -> Vec<Entry> {
        state
            .data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| Entry::new(key.clone(), value.clone()))
            .collect()
    }
}

impl KvStoreDelegate for MemoryDelegate {
    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            let entry = Entry::new(key, value);
            if state.data.insert(key.to_vec(), value.to_vec()).is_some() {
                change.updated.push(entry);
            } else {
                change.inserted.push(entry);
            }
            state.origins.remove(key);
        }
        self.store.notify(&change);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let state = locked(&self.store.state);
        state.guard_ready()?;
        state.data.get(key).cloned().ok_or(EngineError::NotFound)
    }

    fn delete(&self, key: &[u8]) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            if let Some(value) = state.data.remove(key) {
                change.deleted.push(Entry::new(key, value));
            }
            state.origins.remove(key);
        }
        self.store.notify(&change);
        Ok(())
    }

    fn put_batch(&self, entries: &[Entry]) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            for entry in entries {
                if state
                    .data
                    .insert(entry.key.clone(), entry.value.clone())
                    .is_some()
                {
                    change.updated.push(entry.clone());
                } else {
                    change.inserted.push(entry.clone());
                }
                state.origins.remove(&entry.key);
            }
        }
        self.store.notify(&change);
        Ok(())
    }

    fn delete_batch(&self, keys: &[Vec<u8>]) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            for key in keys {
                if let Some(value) = state.data.remove(key) {
                    change.deleted.push(Entry::new(key.clone(), value));
                }
                state.origins.remove(key);
            }
        }
        self.store.notify(&change);
        Ok(())
    }

    fn clear(&self) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            let drained = std::mem::take(&mut state.data);
            state.origins.clear();
            change.deleted = drained
                .into_iter()
                .map(|(key, value)| Entry::new(key, value))
                .collect();
        }
        self.store.notify(&change);
        Ok(())
    }

    fn start_transaction(&self) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        if state.transaction.is_some() {
            return Err(EngineError::Busy);
        }
        state.transaction = Some(state.data.clone());
        Ok(())
    }

    fn commit(&self) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        if state.transaction.take().is_none() {
            return Err(EngineError::Db("no open transaction".to_string()));
        }
        Ok(())
    }

    fn rollback(&self) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        match state.transaction.take() {
            Some(snapshot) => {
                state.data = snapshot;
                Ok(())
            }
            None => Err(EngineError::Db("no open transaction".to_string())),
        }
    }

    fn register_observer(
        &self,
        mode: ObserverMode,
        observer: Arc<dyn KvObserver>,
    ) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        if state
            .observers
            .iter()
            .any(|(_, existing)| Arc::ptr_eq(existing, &observer))
        {
            return Err(EngineError::InvalidArgs(
                "observer already registered".to_string(),
            ));
        }
        state.observers.push((mode, observer));
        Ok(())
    }

    fn unregister_observer(&self, observer: &Arc<dyn KvObserver>) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        let before = state.observers.len();
        state
            .observers
            .retain(|(_, existing)| !Arc::ptr_eq(existing, observer));
        if state.observers.len() == before {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    fn get_entries(&self, prefix: &[u8]) -> EngineResult<Vec<Entry>> {
        let state = locked(&self.store.state);
        state.guard_ready()?;
        let entries = Self::collect_prefix(&state, prefix);
        if entries.is_empty() {
            return Err(EngineError::NotFound);
        }
        Ok(entries)
    }

    fn get_entries_by_query(&self, query: &Query) -> EngineResult<Vec<Entry>> {
        let state = locked(&self.store.state);
        state.guard_ready()?;
        let mut entries = Self::collect_prefix(&state, &query.prefix);
        if query.limit > 0 {
            entries.truncate(query.limit);
        }
        if entries.is_empty() {
            return Err(EngineError::NotFound);
        }
        Ok(entries)
    }

    fn get_count(&self, query: &Query) -> EngineResult<usize> {
        let state = locked(&self.store.state);
        state.guard_ready()?;
        let mut count = Self::collect_prefix(&state, &query.prefix).len();
        if query.limit > 0 {
            count = count.min(query.limit);
        }
        Ok(count)
    }

    fn open_result_set(&self, prefix: &[u8]) -> EngineResult<Arc<dyn KvResultSet>> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        let result_set = Arc::new(MemoryResultSet {
            entries: Self::collect_prefix(&state, prefix),
        });
        state.result_sets.push(Arc::clone(&result_set));
        Ok(result_set)
    }

    fn close_result_set(&self, result_set: &Arc<dyn KvResultSet>) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        let before = state.result_sets.len();
        state.result_sets.retain(|existing| {
            let existing: Arc<dyn KvResultSet> = Arc::clone(existing) as Arc<dyn KvResultSet>;
            !Arc::ptr_eq(&existing, result_set)
        });
        if state.result_sets.len() == before {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    fn sync(
        &self,
        devices: &[String],
        _mode: SyncMode,
        completion: SyncCompletion,
    ) -> EngineResult<()> {
        {
            let state = locked(&self.store.state);
            state.guard_ready()?;
        }
        {
            let mut faults = locked(&self.engine.sync_faults);
            if faults.busy_remaining > 0 {
                faults.busy_remaining -= 1;
                return Err(EngineError::Busy);
            }
        }
        let results: HashMap<String, Result<(), EngineError>> = {
            let faults = locked(&self.engine.sync_faults);
            devices
                .iter()
                .map(|device| {
                    let outcome = faults
                        .device_results
                        .get(device)
                        .map_or(Ok(()), |err| Err(err.clone()));
                    (device.clone(), outcome)
                })
                .collect()
        };
        // Single-process engine: the exchange completes immediately, on the
        // caller's thread.
        completion(results);
        Ok(())
    }

    fn remove_device_data(&self, device_id: &str) -> EngineResult<()> {
        let mut change = ChangeNotification::default();
        {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            let doomed: Vec<Vec<u8>> = state
                .origins
                .iter()
                .filter(|(_, origin)| origin.as_str() == device_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                if let Some(value) = state.data.remove(&key) {
                    change.deleted.push(Entry::new(key.clone(), value));
                }
                state.origins.remove(&key);
            }
        }
        self.store.notify(&change);
        Ok(())
    }

    fn rekey(&self, key: &[u8]) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        state.cipher_fingerprint = Some(key_fingerprint(key));
        Ok(())
    }

    fn export(&self, path: &Path, key: &[u8]) -> EngineResult<()> {
        let snapshot = {
            let mut state = locked(&self.store.state);
            state.guard_ready()?;
            if state.fail_next_export {
                state.fail_next_export = false;
                return Err(EngineError::Db("export failed".to_string()));
            }
            ExportFile {
                key_fingerprint: if key.is_empty() {
                    None
                } else {
                    Some(key_fingerprint(key))
                },
                entries: state
                    .data
                    .iter()
                    .map(|(k, v)| Entry::new(k.clone(), v.clone()))
                    .collect(),
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EngineError::Db(err.to_string()))?;
        }
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|err| EngineError::Db(err.to_string()))?;
        fs::write(path, bytes).map_err(|err| EngineError::Db(err.to_string()))
    }

    fn import(&self, path: &Path, key: &[u8]) -> EngineResult<()> {
        let bytes = fs::read(path).map_err(|err| EngineError::Db(err.to_string()))?;
        let snapshot: ExportFile =
            serde_json::from_slice(&bytes).map_err(|err| EngineError::Db(err.to_string()))?;
        let provided = if key.is_empty() {
            None
        } else {
            Some(key_fingerprint(key))
        };
        if snapshot.key_fingerprint != provided {
            return Err(EngineError::CorruptedOrBadKey);
        }
        let mut state = locked(&self.store.state);
        state.data = snapshot
            .entries
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        state.origins.clear();
        state.transaction = None;
        state.corrupted = false;
        Ok(())
    }

    fn get_security_option(&self) -> EngineResult<SecurityOption> {
        locked(&self.store.state)
            .security
            .ok_or(EngineError::NotSupported)
    }

    fn set_auto_sync(&self, enabled: bool) -> EngineResult<()> {
        locked(&self.store.state).auto_sync = enabled;
        Ok(())
    }

    fn put_local(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        state.local.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get_local(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let state = locked(&self.store.state);
        state.guard_ready()?;
        state.local.get(key).cloned().ok_or(EngineError::NotFound)
    }

    fn delete_local(&self, key: &[u8]) -> EngineResult<()> {
        let mut state = locked(&self.store.state);
        state.guard_ready()?;
        state.local.remove(key);
        Ok(())
    }
}
