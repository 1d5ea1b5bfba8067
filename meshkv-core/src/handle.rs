//! Single-store facade.
//!
//! A [`StoreHandle`] wraps one open engine delegate behind a uniform,
//! rate-limited, status-normalized contract. Every operation passes the
//! same gates in order: flow-control admission, argument validation,
//! delegate access under the handle lock, the engine call, status
//! translation. The engine's "wrong password or corrupted database"
//! status is intercepted everywhere: the handle imports the last good
//! backup and reports [`StoreError::RecoverSucceeded`] or
//! [`StoreError::RecoverFailed`] instead of the raw error, without
//! retrying the triggering operation.
//!
//! The delegate pointer and identity live under a reader/writer lock:
//! data operations share it, structural operations (`force_close`,
//! `migrate_to`, `rekey`, `restore`) take it exclusively and therefore
//! never interleave with data traffic on the same handle. One handle is
//! shared across all logical opens of the same identity and torn down
//! when its open count reaches zero.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use meshkv_engine::{
    ConflictPolicy, DelegateManager, EngineError, EngineResult, Entry, KvObserver, KvResultSet,
    KvStoreDelegate, ObserverMode, OpenOptions, Query, SyncMode,
};
use tracing::{debug, info, warn};

use crate::backup::BackupCoordinator;
use crate::codec;
use crate::error::{StoreError, StoreResult};
use crate::flow::FlowController;
use crate::meta::MetaStore;
use crate::observer::{CollaborationObserver, PlainObserver, StoreObserver};
use crate::paths::ServicePaths;
use crate::provider::DeviceProvider;
use crate::scheduler::TaskScheduler;
use crate::sync::{
    effective_delay, SyncCallback, SyncOutcome, SyncSignature, SyncState, MAX_SYNC_BUSY_RETRIES,
    SYNC_DELAY_DEFAULT,
};
use crate::types::{
    trim_key, KvStoreType, Options, PathType, SecurityLevel, StoreIdentity, SubscribeType,
    MAX_KEY_LENGTH, MAX_VALUE_LENGTH,
};

static SCHEDULER_KEYS: AtomicU64 = AtomicU64::new(1);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entries read from one remote device's keyspace.
#[derive(Debug, Clone)]
pub struct DeviceEntries {
    /// Origin device of the batch.
    pub device_id: String,
    /// Entries with logical keys.
    pub entries: Vec<Entry>,
}

/// A live snapshot cursor handed to a caller.
///
/// The inner engine result set is swapped during account migration, so a
/// caller-held cursor stays usable across it.
pub struct StoreResultSet {
    prefix: Vec<u8>,
    decode: bool,
    inner: RwLock<Arc<dyn KvResultSet>>,
}

impl StoreResultSet {
    fn new(prefix: Vec<u8>, decode: bool, inner: Arc<dyn KvResultSet>) -> Self {
        Self {
            prefix,
            decode,
            inner: RwLock::new(inner),
        }
    }

    fn engine_set(&self) -> Arc<dyn KvResultSet> {
        Arc::clone(
            &self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn swap(&self, inner: Arc<dyn KvResultSet>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = inner;
    }

    /// Number of entries visible to this cursor.
    #[must_use]
    pub fn count(&self) -> usize {
        self.engine_set().count()
    }

    /// Returns the entry at `index`, or `None` past the end.
    ///
    /// Device-collaboration cursors surface logical keys.
    #[must_use]
    pub fn entry_at(&self, index: usize) -> Option<Entry> {
        let entry = self.engine_set().entry_at(index)?;
        if !self.decode {
            return Some(entry);
        }
        match codec::decode(&entry.key) {
            Ok((_, logical)) => Some(Entry::new(logical, entry.value)),
            Err(err) => {
                warn!(error = %err, "undecodable key in result set");
                None
            }
        }
    }
}

struct ObserverEntry {
    caller: Arc<dyn StoreObserver>,
    wrapper: Arc<dyn KvObserver>,
    mode: ObserverMode,
}

struct HandleState {
    identity: StoreIdentity,
    manager: Arc<dyn DelegateManager>,
    delegate: Option<Arc<dyn KvStoreDelegate>>,
}

/// Everything a new handle is built from.
pub(crate) struct HandleInit {
    pub identity: StoreIdentity,
    pub options: Options,
    pub path_type: PathType,
    pub manager: Arc<dyn DelegateManager>,
    pub delegate: Arc<dyn KvStoreDelegate>,
    pub meta: Arc<MetaStore>,
    pub backup: Arc<BackupCoordinator>,
    pub devices: Arc<dyn DeviceProvider>,
    pub paths: ServicePaths,
    pub scheduler: Arc<TaskScheduler>,
    pub burst_capacity: u16,
    pub sustained_capacity: u16,
}

/// One open store.
pub struct StoreHandle {
    options: Options,
    path_type: PathType,
    local_device_id: String,
    open_count: AtomicU32,
    state: RwLock<HandleState>,
    observers: Mutex<Vec<ObserverEntry>>,
    result_sets: Mutex<Vec<Arc<StoreResultSet>>>,
    flow: FlowController,
    sync_state: Mutex<SyncState>,
    sync_callback: Mutex<Option<Arc<dyn SyncCallback>>>,
    default_delay_ms: AtomicU64,
    meta: Arc<MetaStore>,
    backup: Arc<BackupCoordinator>,
    devices: Arc<dyn DeviceProvider>,
    paths: ServicePaths,
    scheduler: Arc<TaskScheduler>,
    scheduler_key: u64,
}

impl StoreHandle {
    pub(crate) fn new(init: HandleInit) -> Arc<Self> {
        Arc::new(Self {
            local_device_id: init.devices.local_device_id(),
            options: init.options,
            path_type: init.path_type,
            open_count: AtomicU32::new(1),
            state: RwLock::new(HandleState {
                identity: init.identity,
                manager: init.manager,
                delegate: Some(init.delegate),
            }),
            observers: Mutex::new(Vec::new()),
            result_sets: Mutex::new(Vec::new()),
            flow: FlowController::new(init.burst_capacity, init.sustained_capacity),
            sync_state: Mutex::new(SyncState::default()),
            sync_callback: Mutex::new(None),
            default_delay_ms: AtomicU64::new(0),
            meta: init.meta,
            backup: init.backup,
            devices: init.devices,
            paths: init.paths,
            scheduler: init.scheduler,
            scheduler_key: SCHEDULER_KEYS.fetch_add(1, Ordering::Relaxed),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Returns the identity the handle is currently registered under.
    #[must_use]
    pub fn identity(&self) -> StoreIdentity {
        self.read_state().identity.clone()
    }

    /// Returns the immutable options the store was opened with.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the physical path type the store lives under.
    #[must_use]
    pub const fn path_type(&self) -> PathType {
        self.path_type
    }

    /// Number of logical opens currently sharing this handle.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Returns true while the handle holds an engine delegate.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.read_state().delegate.is_some()
    }

    // ── Gates ───────────────────────────────────────────────────────────

    fn admit(&self) -> StoreResult<()> {
        if self.flow.admit() {
            Ok(())
        } else {
            Err(StoreError::RateLimited)
        }
    }

    fn is_collaboration(&self) -> bool {
        self.options.kv_store_type == KvStoreType::DeviceCollaboration
    }

    fn validated_key(key: &[u8]) -> StoreResult<&[u8]> {
        let trimmed = trim_key(key);
        if trimmed.is_empty() {
            return Err(StoreError::InvalidArgument("empty key".to_string()));
        }
        if trimmed.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument(format!(
                "key exceeds {MAX_KEY_LENGTH} bytes"
            )));
        }
        Ok(trimmed)
    }

    fn validated_value(value: &[u8]) -> StoreResult<()> {
        if value.len() > MAX_VALUE_LENGTH {
            return Err(StoreError::InvalidArgument(format!(
                "value exceeds {MAX_VALUE_LENGTH} bytes"
            )));
        }
        Ok(())
    }

    /// Trims, validates and (for device-collaboration stores) namespaces
    /// one key for `device_id`.
    fn physical_key(&self, key: &[u8], device_id: &str) -> StoreResult<Vec<u8>> {
        let trimmed = Self::validated_key(key)?;
        if self.is_collaboration() {
            Ok(codec::encode(device_id, trimmed))
        } else {
            Ok(trimmed.to_vec())
        }
    }

    fn physical_prefix(&self, prefix: &[u8], device_id: &str) -> Vec<u8> {
        if self.is_collaboration() {
            let mut physical = Vec::with_capacity(device_id.len() + prefix.len());
            physical.extend_from_slice(device_id.as_bytes());
            physical.extend_from_slice(prefix);
            physical
        } else {
            prefix.to_vec()
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, HandleState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, HandleState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Status translation & recovery ───────────────────────────────────

    /// Translates an engine result, routing corruption into the recovery
    /// path.
    fn translate<T>(
        &self,
        result: EngineResult<T>,
        delegate: &Arc<dyn KvStoreDelegate>,
        identity: &StoreIdentity,
    ) -> StoreResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(EngineError::CorruptedOrBadKey) => Err(self.recover(delegate, identity)),
            Err(err) => Err(StoreError::from_engine(err)),
        }
    }

    /// Imports the last good backup after the engine reported corruption.
    ///
    /// Only the recovery outcome is surfaced; the triggering operation is
    /// not retried.
    fn recover(
        &self,
        delegate: &Arc<dyn KvStoreDelegate>,
        identity: &StoreIdentity,
    ) -> StoreError {
        warn!(store = %identity.store_id, "engine reported corruption, recovering from backup");
        match self.backup.import_with_delegate(
            self.path_type,
            identity,
            self.options.encrypt,
            delegate,
        ) {
            Ok(()) => StoreError::RecoverSucceeded,
            Err(err) => {
                warn!(store = %identity.store_id, error = %err, "backup recovery failed");
                StoreError::RecoverFailed
            }
        }
    }

    // ── Data operations ─────────────────────────────────────────────────

    /// Writes one key/value pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RateLimited`] or
    /// [`StoreError::InvalidArgument`] before any engine work, otherwise
    /// the translated engine status.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.admit()?;
        Self::validated_value(value)?;
        let physical = self.physical_key(key, &self.local_device_id)?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.put(&physical, value), delegate, &state.identity)
    }

    /// Reads the value stored under `key`.
    ///
    /// Device-collaboration stores read the local device's keyspace; use
    /// [`StoreHandle::get_by_device`] for a peer's.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent.
    pub fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.admit()?;
        let physical = self.physical_key(key, &self.local_device_id)?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.get(&physical), delegate, &state.identity)
    }

    /// Reads `key` from the keyspace of the device behind `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotSupported`] on non-collaboration stores
    /// and [`StoreError::NotFound`] when the node cannot be resolved to a
    /// device.
    pub fn get_by_device(&self, node_id: &str, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.admit()?;
        if !self.is_collaboration() {
            return Err(StoreError::NotSupported);
        }
        let device_id = self
            .devices
            .device_id_by_node(node_id)
            .ok_or(StoreError::NotFound)?;
        let physical = self.physical_key(key, &device_id)?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.get(&physical), delegate, &state.identity)
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.admit()?;
        let physical = self.physical_key(key, &self.local_device_id)?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.delete(&physical), delegate, &state.identity)
    }

    /// Writes a batch of entries atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] when any entry fails
    /// validation; no entry is written then.
    pub fn put_batch(&self, entries: &[Entry]) -> StoreResult<()> {
        self.admit()?;
        let mut physical = Vec::with_capacity(entries.len());
        for entry in entries {
            Self::validated_value(&entry.value)?;
            physical.push(Entry::new(
                self.physical_key(&entry.key, &self.local_device_id)?,
                entry.value.clone(),
            ));
        }
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.put_batch(&physical), delegate, &state.identity)
    }

    /// Removes a batch of keys atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] when any key fails
    /// validation; no key is removed then.
    pub fn delete_batch(&self, keys: &[Vec<u8>]) -> StoreResult<()> {
        self.admit()?;
        let mut physical = Vec::with_capacity(keys.len());
        for key in keys {
            physical.push(self.physical_key(key, &self.local_device_id)?);
        }
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.delete_batch(&physical), delegate, &state.identity)
    }

    /// Removes every entry of the store.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn clear(&self) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.clear(), delegate, &state.identity)
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn start_transaction(&self) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.start_transaction(), delegate, &state.identity)
    }

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn commit(&self) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.commit(), delegate, &state.identity)
    }

    /// Rolls the open transaction back.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn rollback(&self) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.rollback(), delegate, &state.identity)
    }

    /// Returns every entry whose logical key starts with `prefix`.
    ///
    /// Device-collaboration stores enumerate the local device's keyspace
    /// and surface logical keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing matches.
    pub fn get_entries(&self, prefix: &[u8]) -> StoreResult<Vec<Entry>> {
        self.admit()?;
        let physical = self.physical_prefix(prefix, &self.local_device_id);
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        let entries =
            self.translate(delegate.get_entries(&physical), delegate, &state.identity)?;
        if self.is_collaboration() {
            Ok(Self::decode_entries(entries).entries)
        } else {
            Ok(entries)
        }
    }

    /// Returns every entry of the device behind `node_id` whose logical
    /// key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotSupported`] on non-collaboration stores
    /// and [`StoreError::NotFound`] when the node cannot be resolved or
    /// nothing matches.
    pub fn get_entries_by_device(
        &self,
        node_id: &str,
        prefix: &[u8],
    ) -> StoreResult<DeviceEntries> {
        self.admit()?;
        if !self.is_collaboration() {
            return Err(StoreError::NotSupported);
        }
        let device_id = self
            .devices
            .device_id_by_node(node_id)
            .ok_or(StoreError::NotFound)?;
        let physical = self.physical_prefix(prefix, &device_id);
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        let entries =
            self.translate(delegate.get_entries(&physical), delegate, &state.identity)?;
        let mut decoded = Self::decode_entries(entries);
        if decoded.device_id.is_empty() {
            decoded.device_id = device_id;
        }
        Ok(decoded)
    }

    /// The batch's effective device id is the first entry's origin.
    fn decode_entries(entries: Vec<Entry>) -> DeviceEntries {
        let mut device_id = String::new();
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            match codec::decode(&entry.key) {
                Ok((origin, logical)) => {
                    if device_id.is_empty() {
                        device_id = origin;
                    }
                    decoded.push(Entry::new(logical, entry.value));
                }
                Err(err) => warn!(error = %err, "skipping undecodable key in enumeration"),
            }
        }
        DeviceEntries {
            device_id,
            entries: decoded,
        }
    }

    /// Returns every entry matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing matches.
    pub fn get_entries_by_query(&self, query: &Query) -> StoreResult<Vec<Entry>> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(
            delegate.get_entries_by_query(query),
            delegate,
            &state.identity,
        )
    }

    /// Counts the entries matching `query`.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn get_count(&self, query: &Query) -> StoreResult<usize> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(delegate.get_count(query), delegate, &state.identity)
    }

    // ── Result sets ─────────────────────────────────────────────────────

    /// Opens a snapshot cursor over `prefix`.
    ///
    /// The cursor stays registered with the handle until closed and is
    /// rebuilt against the new delegate during account migration.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn open_result_set(&self, prefix: &[u8]) -> StoreResult<Arc<StoreResultSet>> {
        self.admit()?;
        let physical = self.physical_prefix(prefix, &self.local_device_id);
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        let inner =
            self.translate(delegate.open_result_set(&physical), delegate, &state.identity)?;
        let result_set = Arc::new(StoreResultSet::new(
            physical,
            self.is_collaboration(),
            inner,
        ));
        locked(&self.result_sets).push(Arc::clone(&result_set));
        Ok(result_set)
    }

    /// Releases a cursor produced by this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the cursor is not registered
    /// here.
    pub fn close_result_set(&self, result_set: &Arc<StoreResultSet>) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let mut result_sets = locked(&self.result_sets);
        let position = result_sets
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, result_set))
            .ok_or(StoreError::NotFound)?;
        if let Some(delegate) = &state.delegate {
            delegate
                .close_result_set(&result_set.engine_set())
                .map_err(StoreError::from_engine)?;
        }
        result_sets.remove(position);
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Registers `observer` for changes matching `subscribe_type`.
    ///
    /// Device-collaboration stores deliver logical keys and a resolved
    /// origin device id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadySubscribed`] when the same observer
    /// is already registered.
    pub fn subscribe(
        &self,
        subscribe_type: SubscribeType,
        observer: Arc<dyn StoreObserver>,
    ) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        let mut observers = locked(&self.observers);
        if observers
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.caller, &observer))
        {
            return Err(StoreError::AlreadySubscribed);
        }
        let mode = match subscribe_type {
            SubscribeType::Local => ObserverMode::Native,
            SubscribeType::Remote => ObserverMode::Foreign,
            SubscribeType::All => ObserverMode::Both,
        };
        let wrapper: Arc<dyn KvObserver> = if self.is_collaboration() {
            Arc::new(CollaborationObserver::new(
                Arc::clone(&observer),
                self.local_device_id.clone(),
            ))
        } else {
            Arc::new(PlainObserver::new(Arc::clone(&observer)))
        };
        self.translate(
            delegate.register_observer(mode, Arc::clone(&wrapper)),
            delegate,
            &state.identity,
        )?;
        observers.push(ObserverEntry {
            caller: observer,
            wrapper,
            mode,
        });
        Ok(())
    }

    /// Removes a subscription registered through this handle.
    ///
    /// Unsubscribing an observer that has no subscription is a no-op
    /// success.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status when unregistering fails.
    pub fn unsubscribe(&self, observer: &Arc<dyn StoreObserver>) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let mut observers = locked(&self.observers);
        let Some(position) = observers
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.caller, observer))
        else {
            debug!("unsubscribe without matching subscription");
            return Ok(());
        };
        if let Some(delegate) = &state.delegate {
            delegate
                .unregister_observer(&observers[position].wrapper)
                .map_err(StoreError::from_engine)?;
        }
        observers.remove(position);
        Ok(())
    }

    // ── Sync ────────────────────────────────────────────────────────────

    /// Registers the completion receiver for sync exchanges of this
    /// store, replacing any previous one.
    pub fn register_sync_callback(&self, callback: Arc<dyn SyncCallback>) {
        *locked(&self.sync_callback) = Some(callback);
    }

    /// Removes the completion receiver.
    pub fn unregister_sync_callback(&self) {
        *locked(&self.sync_callback) = None;
    }

    /// Sets the default allowed delay applied when [`StoreHandle::sync`]
    /// is called without one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] when the delay is outside
    /// the accepted range and not zero (zero clears the default).
    pub fn set_sync_param(&self, allowed_delay: Duration) -> StoreResult<()> {
        if !allowed_delay.is_zero()
            && !(crate::sync::SYNC_DELAY_MIN..=crate::sync::SYNC_DELAY_MAX)
                .contains(&allowed_delay)
        {
            return Err(StoreError::InvalidArgument(
                "sync delay out of range".to_string(),
            ));
        }
        let millis = u64::try_from(allowed_delay.as_millis()).unwrap_or(u64::MAX);
        self.default_delay_ms.store(millis, Ordering::Release);
        Ok(())
    }

    /// Returns the configured default allowed delay; zero when unset.
    #[must_use]
    pub fn get_sync_param(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms.load(Ordering::Acquire))
    }

    /// Enqueues a sync exchange with the devices behind `node_ids`.
    ///
    /// Never blocks: the exchange runs later on the scheduler and its
    /// outcome arrives through the registered sync callback. A second
    /// call with identical targets, mode and delay while one is pending
    /// coalesces into it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for an empty target list,
    /// [`StoreError::NotFound`] when a node cannot be resolved to a
    /// device and [`StoreError::PermissionDenied`] when a strategy record
    /// forbids the exchange.
    pub fn sync(
        self: &Arc<Self>,
        node_ids: &[String],
        mode: SyncMode,
        allowed_delay: Option<Duration>,
    ) -> StoreResult<()> {
        self.admit()?;
        if node_ids.is_empty() {
            return Err(StoreError::InvalidArgument("no sync targets".to_string()));
        }
        let mut devices = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            devices.push(
                self.devices
                    .device_id_by_node(node_id)
                    .ok_or(StoreError::NotFound)?,
            );
        }
        let identity = self.identity();
        for device in &devices {
            self.meta.check_sync_permission(&identity, device)?;
        }

        let configured = self.get_sync_param();
        let explicit = allowed_delay.or_else(|| (!configured.is_zero()).then_some(configured));
        let delay = effective_delay(explicit, self.devices.caller_is_background());

        let signature = SyncSignature {
            devices,
            mode,
            delay,
        };
        {
            let mut sync_state = locked(&self.sync_state);
            if sync_state.pending.as_ref() == Some(&signature) {
                debug!(store = %identity.store_id, "coalescing duplicate sync request");
                return Ok(());
            }
            sync_state.pending = Some(signature.clone());
            sync_state.busy_retries = 0;
        }
        self.schedule_sync(signature, delay);
        Ok(())
    }

    fn schedule_sync(self: &Arc<Self>, signature: SyncSignature, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(self.scheduler_key, delay, move || {
            if let Some(handle) = weak.upgrade() {
                handle.run_scheduled_sync(&signature);
            }
        });
    }

    fn run_scheduled_sync(self: &Arc<Self>, signature: &SyncSignature) {
        {
            let mut sync_state = locked(&self.sync_state);
            if sync_state.pending.as_ref() == Some(signature) {
                sync_state.pending = None;
            }
        }
        let state = self.read_state();
        let Some(delegate) = state.delegate.clone() else {
            self.deliver_failure(&state.identity.store_id, &signature.devices, &StoreError::NotOpen);
            return;
        };
        let store_id = state.identity.store_id.clone();
        let callback = locked(&self.sync_callback).clone();
        let completion_store_id = store_id.clone();
        let outcome = delegate.sync(
            &signature.devices,
            signature.mode,
            Box::new(move |results| {
                let mapped: SyncOutcome = results
                    .into_iter()
                    .map(|(device, result)| {
                        (device, result.map_err(StoreError::from_engine))
                    })
                    .collect();
                if let Some(callback) = callback {
                    callback.on_complete(&completion_store_id, &mapped);
                }
            }),
        );
        drop(state);

        match outcome {
            Ok(()) => {}
            Err(EngineError::Busy) => {
                let retry = {
                    let mut sync_state = locked(&self.sync_state);
                    if sync_state.busy_retries < MAX_SYNC_BUSY_RETRIES {
                        sync_state.busy_retries += 1;
                        sync_state.pending = Some(signature.clone());
                        true
                    } else {
                        sync_state.busy_retries = 0;
                        false
                    }
                };
                if retry {
                    debug!(store = %store_id, "engine busy, re-enqueueing sync");
                    self.schedule_sync(signature.clone(), SYNC_DELAY_DEFAULT);
                } else {
                    self.deliver_failure(
                        &store_id,
                        &signature.devices,
                        &StoreError::DbError("engine busy".to_string()),
                    );
                }
            }
            Err(err) => {
                self.deliver_failure(&store_id, &signature.devices, &StoreError::from_engine(err));
            }
        }
    }

    /// Reports one failure for every targeted device, once.
    fn deliver_failure(&self, store_id: &str, devices: &[String], error: &StoreError) {
        let Some(callback) = locked(&self.sync_callback).clone() else {
            warn!(store = %store_id, error = %error, "sync failed with no callback registered");
            return;
        };
        let outcome: SyncOutcome = devices
            .iter()
            .map(|device| (device.clone(), Err(error.clone())))
            .collect();
        callback.on_complete(store_id, &outcome);
    }

    // ── Capability / security ───────────────────────────────────────────

    /// Switches cross-device sync capability for this store on or off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the strategy record cannot be
    /// written.
    pub fn set_capability_enabled(&self, enabled: bool) -> StoreResult<()> {
        let identity = self.identity();
        self.meta
            .save_strategy_enabled(&self.local_device_id, &identity, enabled)
    }

    /// Publishes the capability label ranges gating which devices may
    /// sync this store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the strategy record cannot be
    /// written.
    pub fn set_capability_range(
        &self,
        local_labels: Vec<String>,
        remote_support_labels: Vec<String>,
    ) -> StoreResult<()> {
        let identity = self.identity();
        self.meta.save_strategy_labels(
            &self.local_device_id,
            &identity,
            local_labels,
            remote_support_labels,
        )
    }

    /// Reads the security level the engine holds for this store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotSupported`] when the engine carries no
    /// security metadata.
    pub fn get_security_level(&self) -> StoreResult<SecurityLevel> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        let option =
            self.translate(delegate.get_security_option(), delegate, &state.identity)?;
        Ok(SecurityLevel::from_engine(option))
    }

    /// Drops all data that originated from `device_id`.
    ///
    /// # Errors
    ///
    /// Returns the translated engine status on failure.
    pub fn remove_device_data(&self, device_id: &str) -> StoreResult<()> {
        self.admit()?;
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.translate(
            delegate.remove_device_data(device_id),
            delegate,
            &state.identity,
        )
    }

    // ── Backup / restore ────────────────────────────────────────────────

    /// Exports the store to its backup file immediately, outside the
    /// periodic sweep.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's failure; the previous backup survives.
    pub fn backup_now(&self) -> StoreResult<()> {
        let state = self.read_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.backup.export_with_delegate(
            self.path_type,
            &state.identity,
            self.options.encrypt,
            delegate,
        )
    }

    /// Replaces the store contents from its most recent backup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no backup exists.
    pub fn restore(&self) -> StoreResult<()> {
        let state = self.write_state();
        let delegate = state.delegate.as_ref().ok_or(StoreError::NotOpen)?;
        self.backup.import_with_delegate(
            self.path_type,
            &state.identity,
            self.options.encrypt,
            delegate,
        )
    }

    // ── Rekey ───────────────────────────────────────────────────────────

    /// Rotates the store's secret key.
    ///
    /// The fresh key reaches the meta record before the engine adopts it
    /// and the redundant key file only afterwards, so the file never
    /// holds a key the engine has not committed to.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotSupported`] on unencrypted stores,
    /// otherwise the first failing step's error.
    pub fn rekey(&self) -> StoreResult<()> {
        if !self.options.encrypt {
            return Err(StoreError::NotSupported);
        }
        let state = self.write_state();
        let delegate = state.delegate.clone().ok_or(StoreError::NotOpen)?;
        let identity = state.identity.clone();
        let key_file = self.paths.secret_key_file(
            &identity.device_account_id,
            &identity.bundle_name,
            &identity.store_id,
        );
        self.meta.rotate_secret_key(
            &identity,
            self.options.kv_store_type,
            &key_file,
            &|key| delegate.rekey(key).map_err(StoreError::from_engine),
        )
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Records one additional logical open of the same identity.
    pub fn increase_open_count(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Closes one logical open.
    ///
    /// Returns true when this was the last open and the handle has been
    /// torn down; closing an already-closed handle is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the final teardown fails; the
    /// handle then stays open for a retry.
    pub fn close(&self) -> StoreResult<bool> {
        loop {
            let current = self.open_count.load(Ordering::Acquire);
            match current {
                0 => return Ok(true),
                1 => {
                    self.force_close()?;
                    return Ok(true);
                }
                _ => {
                    if self
                        .open_count
                        .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Tears the handle down regardless of its open count.
    ///
    /// Ordered teardown: pending scheduled work is dropped, every
    /// observer is unregistered, every live cursor released, then the
    /// delegate is returned to its manager. A failing release aborts the
    /// close with the remaining state intact for a retry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when a release or the delegate
    /// close fails.
    pub fn force_close(&self) -> StoreResult<()> {
        let mut state = self.write_state();
        let Some(delegate) = state.delegate.clone() else {
            self.open_count.store(0, Ordering::Release);
            return Ok(());
        };
        self.scheduler.remove(self.scheduler_key);

        {
            let mut observers = locked(&self.observers);
            while let Some(entry) = observers.last() {
                match delegate.unregister_observer(&entry.wrapper) {
                    Ok(()) | Err(EngineError::NotFound) => {
                        observers.pop();
                    }
                    Err(err) => {
                        return Err(StoreError::DbError(format!(
                            "unregister observer: {err}"
                        )));
                    }
                }
            }
        }
        {
            let mut result_sets = locked(&self.result_sets);
            while let Some(result_set) = result_sets.last() {
                match delegate.close_result_set(&result_set.engine_set()) {
                    Ok(()) | Err(EngineError::NotFound) => {
                        result_sets.pop();
                    }
                    Err(err) => {
                        return Err(StoreError::DbError(format!("close result set: {err}")));
                    }
                }
            }
        }

        state
            .manager
            .close(delegate)
            .map_err(|err| StoreError::DbError(format!("close delegate: {err}")))?;
        state.delegate = None;
        self.open_count.store(0, Ordering::Release);
        info!(store = %state.identity.store_id, "store closed");
        Ok(())
    }

    // ── Migration ───────────────────────────────────────────────────────

    /// Relocates the store under `new_manager` for `new_account_id`.
    ///
    /// The store is re-opened under the new delegate manager with the
    /// same options, live observers and cursors are rebuilt against the
    /// new delegate (best-effort: a single rebuild failure is logged and
    /// that subscription or cursor dropped), then the old delegate is
    /// closed and the handle's active delegate swapped. Failure to close
    /// the old delegate after the new one is live is logged but does not
    /// roll back the swap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when the secret key of an
    /// encrypted store cannot be obtained, or the translated open
    /// failure. The handle keeps its old delegate then.
    pub fn migrate_to(
        &self,
        new_account_id: &str,
        new_manager: Arc<dyn DelegateManager>,
    ) -> StoreResult<()> {
        let mut state = self.write_state();
        let Some(old_delegate) = state.delegate.clone() else {
            // Nothing live to rebuild; just adopt the new identity.
            state.identity.account_id = new_account_id.to_string();
            state.manager = new_manager;
            return Ok(());
        };

        let cipher_key = if self.options.encrypt {
            let (key, _) = self
                .meta
                .secret_key_from_meta(&state.identity)
                .map_err(|_| StoreError::CryptError)?;
            key.to_vec()
        } else {
            Vec::new()
        };
        let open_options = OpenOptions {
            create_if_missing: true,
            encrypted: self.options.encrypt,
            cipher_key,
            schema: self.options.schema.clone(),
            conflict_policy: if self.is_collaboration() {
                ConflictPolicy::DeviceCollaboration
            } else {
                ConflictPolicy::LastWin
            },
            security: self.options.security_level.to_engine(),
            dir_by_store_id_only: self.options.data_ownership,
        };
        let new_delegate = new_manager
            .open(&state.identity.store_id, &open_options)
            .map_err(StoreError::from_engine)?;

        {
            let mut observers = locked(&self.observers);
            observers.retain(|entry| {
                match new_delegate.register_observer(entry.mode, Arc::clone(&entry.wrapper)) {
                    Ok(()) => {
                        if let Err(err) = old_delegate.unregister_observer(&entry.wrapper) {
                            debug!(error = %err, "unregistering observer from old delegate");
                        }
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "observer rebuild failed, dropping subscription");
                        false
                    }
                }
            });
        }
        {
            let mut result_sets = locked(&self.result_sets);
            result_sets.retain(|result_set| {
                match new_delegate.open_result_set(&result_set.prefix) {
                    Ok(inner) => {
                        if let Err(err) = old_delegate.close_result_set(&result_set.engine_set())
                        {
                            debug!(error = %err, "closing cursor on old delegate");
                        }
                        result_set.swap(inner);
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "cursor rebuild failed, dropping cursor");
                        false
                    }
                }
            });
        }

        // Forward-only from here: the new delegate is live.
        if let Err(err) = state.manager.close(old_delegate) {
            warn!(error = %err, "closing migrated-from delegate failed");
        }
        state.manager = new_manager;
        state.delegate = Some(new_delegate);
        state.identity.account_id = new_account_id.to_string();

        match self.meta.get_meta(&state.identity) {
            Ok(mut record) => {
                record.user_id = new_account_id.to_string();
                if let Err(err) = self.meta.put_meta(&record) {
                    warn!(error = %err, "updating meta record after migration failed");
                }
            }
            Err(err) => debug!(error = %err, "no meta record to update after migration"),
        }
        info!(
            store = %state.identity.store_id,
            account = %new_account_id,
            "store migrated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::keystore::SoftwareKeystore;
    use crate::provider::FixedProviders;
    use meshkv_engine::{Engine, MemoryEngine};

    struct Fixture {
        handle: Arc<StoreHandle>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with_capacities(1000, 10000)
    }

    fn fixture_with_capacities(burst: u16, sustained: u16) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServiceConfig::new(dir.path().join("de"), dir.path().join("ce"));
        let paths = ServicePaths::new(&config);
        let engine = Arc::new(MemoryEngine::new());
        let providers = Arc::new(FixedProviders::new("local-device"));
        let meta = Arc::new(MetaStore::new(
            Arc::clone(&engine) as _,
            paths.clone(),
            Arc::clone(&providers) as _,
            Arc::new(SoftwareKeystore::ephemeral()),
            "0",
        ));
        let backup = Arc::new(BackupCoordinator::new(
            Arc::clone(&engine) as _,
            Arc::clone(&meta),
            paths.clone(),
        ));
        let identity = StoreIdentity {
            device_account_id: "0".to_string(),
            account_id: "default".to_string(),
            bundle_name: "com.example.notes".to_string(),
            store_id: "notes".to_string(),
        };
        let data_dir = paths.store_dir(PathType::De, "0", &identity.bundle_name);
        let manager = engine
            .delegate_manager(&identity.bundle_name, &identity.account_id, &data_dir)
            .expect("manager");
        let delegate = manager
            .open(&identity.store_id, &OpenOptions::default())
            .expect("open");
        let handle = StoreHandle::new(HandleInit {
            identity,
            options: Options::default(),
            path_type: PathType::De,
            manager,
            delegate,
            meta,
            backup,
            devices: providers,
            paths,
            scheduler: Arc::new(TaskScheduler::new()),
            burst_capacity: burst,
            sustained_capacity: sustained,
        });
        Fixture { handle, _dir: dir }
    }

    #[test]
    fn test_invalid_keys_are_rejected_before_the_engine() {
        let fixture = fixture();
        assert!(matches!(
            fixture.handle.put(b"   ", b"v"),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            fixture.handle.get(&vec![b'k'; MAX_KEY_LENGTH + 1]),
            Err(StoreError::InvalidArgument(_))
        ));
        // The rejected writes left nothing behind.
        assert_eq!(fixture.handle.get_entries(b""), Err(StoreError::NotFound));
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        let fixture = fixture();
        let oversized = vec![0u8; MAX_VALUE_LENGTH + 1];
        assert!(matches!(
            fixture.handle.put(b"k", &oversized),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_round_trip_and_delete() {
        let fixture = fixture();
        fixture.handle.put(b"alpha", b"1").expect("put");
        assert_eq!(fixture.handle.get(b"alpha").expect("get"), b"1".to_vec());
        fixture.handle.delete(b"alpha").expect("delete");
        assert_eq!(fixture.handle.get(b"alpha"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_keys_are_trimmed_before_storage() {
        let fixture = fixture();
        fixture.handle.put(b"  padded  ", b"1").expect("put");
        assert_eq!(fixture.handle.get(b"padded").expect("get"), b"1".to_vec());
    }

    #[test]
    fn test_exhausted_flow_control_rejects_without_engine_work() {
        let fixture = fixture_with_capacities(2, 2);
        fixture.handle.put(b"a", b"1").expect("put");
        fixture.handle.put(b"b", b"2").expect("put");
        assert_eq!(fixture.handle.put(b"c", b"3"), Err(StoreError::RateLimited));
        assert_eq!(fixture.handle.get(b"c"), Err(StoreError::RateLimited));
    }

    #[test]
    fn test_close_counts_down_and_tears_down_once() {
        let fixture = fixture();
        fixture.handle.increase_open_count();
        assert!(!fixture.handle.close().expect("close"));
        assert!(fixture.handle.is_open());
        assert!(fixture.handle.close().expect("close"));
        assert!(!fixture.handle.is_open());
        // Idempotent once fully closed.
        assert!(fixture.handle.close().expect("close"));
        assert_eq!(fixture.handle.get(b"k"), Err(StoreError::NotOpen));
    }

    #[test]
    fn test_duplicate_subscribe_is_reported() {
        struct Quiet;
        impl StoreObserver for Quiet {
            fn on_change(&self, _change: &crate::observer::StoreChange) {}
        }

        let fixture = fixture();
        let observer: Arc<dyn StoreObserver> = Arc::new(Quiet);
        fixture
            .handle
            .subscribe(SubscribeType::All, Arc::clone(&observer))
            .expect("subscribe");
        assert_eq!(
            fixture
                .handle
                .subscribe(SubscribeType::All, Arc::clone(&observer)),
            Err(StoreError::AlreadySubscribed)
        );
        fixture.handle.unsubscribe(&observer).expect("unsubscribe");
        // No matching subscription left: still a success.
        fixture.handle.unsubscribe(&observer).expect("unsubscribe");
    }

    #[test]
    fn test_sync_param_validation() {
        let fixture = fixture();
        assert!(matches!(
            fixture.handle.set_sync_param(Duration::from_millis(10)),
            Err(StoreError::InvalidArgument(_))
        ));
        fixture
            .handle
            .set_sync_param(Duration::from_millis(500))
            .expect("set");
        assert_eq!(fixture.handle.get_sync_param(), Duration::from_millis(500));
    }
}
