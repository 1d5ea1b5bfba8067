//! Metadata and secret-key bookkeeping.
//!
//! One reserved, always-device-scoped engine store (`service_meta`) holds
//! three record families, addressed by composite `###`-separated keys:
//!
//! * `KvStoreMetaData` — one synced record per store, created on first
//!   successful open and removed only by explicit delete.
//! * `SecretKey` — device-local records holding each store's sealed
//!   secret key and its creation time. The same payload is mirrored into
//!   a per-store key file so an encrypted store stays recoverable when
//!   the meta store itself is lost.
//! * `StrategyMetaData` — synced capability-label records gating which
//!   device pairs may sync a store.
//!
//! Every mutation is followed by a best-effort export of the meta store
//! to the backup directory and a best-effort full-device sync; neither
//! failure is surfaced to the caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshkv_engine::{
    DelegateManager, Engine, EngineError, KvStoreDelegate, OpenOptions, SyncMode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{StoreError, StoreResult};
use crate::keystore::{DeviceKeystore, SECRET_KEY_AD};
use crate::paths::ServicePaths;
use crate::provider::DeviceProvider;
use crate::types::{
    KvStoreType, PathType, SecurityLevel, StoreIdentity, DEFAULT_GROUP_ID, KEY_SEPARATOR,
};

/// App id the reserved meta store is registered under.
pub const META_APP_ID: &str = "meshkv.meta";

/// Store id of the reserved meta store.
pub const META_STORE_ID: &str = "service_meta";

/// Key prefix of store metadata records.
pub const META_RECORD_PREFIX: &str = "KvStoreMetaData";

/// Key prefix of secret-key records.
pub const SECRET_RECORD_PREFIX: &str = "SecretKey";

/// Key prefix of sync-permission strategy records.
pub const STRATEGY_RECORD_PREFIX: &str = "StrategyMetaData";

/// Key-purpose suffix of single-version store secret keys.
pub const SINGLE_KEY_PURPOSE: &str = "SINGLE_KEY";

/// Secret keys older than one year must be rotated before trusted use.
pub const SECRET_KEY_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const CREATED_AT_BYTES: usize = 8;

/// Persisted record describing one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvStoreMetaData {
    /// Local device the record was written on.
    pub device_id: String,
    /// Signed-in account id at creation time.
    pub user_id: String,
    /// Resolved application id.
    pub app_id: String,
    /// Store id within the bundle.
    pub store_id: String,
    /// Owning bundle name.
    pub bundle_name: String,
    /// Versioning and conflict behavior of the store.
    pub kv_store_type: KvStoreType,
    /// Whether the store is encrypted.
    pub is_encrypt: bool,
    /// Whether the store takes part in the backup sweep.
    pub is_backup: bool,
    /// Whether the engine schedules syncs on its own.
    pub is_auto_sync: bool,
    /// Schema of the store, empty for schemaless.
    pub schema: String,
    /// Physical data directory of the store.
    pub data_dir: PathBuf,
    /// Application type tag.
    pub app_type: String,
    /// Device account owning the store.
    pub device_account_id: String,
    /// Uid of the creating process; `-1` when unknown.
    pub uid: i32,
    /// Record format version.
    pub version: u32,
    /// Security level the store was created with.
    pub security_level: SecurityLevel,
    /// Set while the store's on-disk state is known bad.
    pub is_dirty: bool,
}

/// Device-local record holding one store's sealed secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyMetaData {
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Secret key sealed by the device keystore.
    pub sealed_key: Vec<u8>,
    /// Store type the key belongs to.
    pub kv_store_type: KvStoreType,
}

impl SecretKeyMetaData {
    /// Returns true when the key is past its one-year lifetime at `now`
    /// (seconds since the Unix epoch).
    #[must_use]
    pub const fn is_outdated(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) >= SECRET_KEY_LIFETIME.as_secs()
    }
}

/// Sync-permission strategy for one store on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMeta {
    /// Capability switch; `None` when never set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_enabled: Option<bool>,
    /// Labels this device offers.
    #[serde(default)]
    pub local_labels: Vec<String>,
    /// Labels of remote devices this device accepts.
    #[serde(default)]
    pub remote_support_labels: Vec<String>,
}

/// Returns the current time in seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn joined(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

/// Builds the synced metadata record key for one store.
#[must_use]
pub fn meta_record_key(local_device_id: &str, identity: &StoreIdentity) -> Vec<u8> {
    joined(&[
        META_RECORD_PREFIX,
        local_device_id,
        &identity.device_account_id,
        DEFAULT_GROUP_ID,
        &identity.bundle_name,
        &identity.store_id,
    ])
    .into_bytes()
}

/// Builds the device-local secret-key record key for one store.
#[must_use]
pub fn secret_record_key(identity: &StoreIdentity, purpose: &str) -> Vec<u8> {
    joined(&[
        SECRET_RECORD_PREFIX,
        &identity.device_account_id,
        DEFAULT_GROUP_ID,
        &identity.bundle_name,
        &identity.store_id,
        purpose,
    ])
    .into_bytes()
}

/// Builds the strategy record key for one store on one device.
#[must_use]
pub fn strategy_record_key(device_id: &str, identity: &StoreIdentity) -> Vec<u8> {
    joined(&[
        STRATEGY_RECORD_PREFIX,
        device_id,
        &identity.device_account_id,
        DEFAULT_GROUP_ID,
        &identity.bundle_name,
        &identity.store_id,
    ])
    .into_bytes()
}

/// Owner of the reserved metadata store.
pub struct MetaStore {
    engine: Arc<dyn Engine>,
    paths: ServicePaths,
    device: Arc<dyn DeviceProvider>,
    keystore: Arc<dyn DeviceKeystore>,
    device_account_id: String,
    state: Mutex<MetaState>,
}

#[derive(Default)]
struct MetaState {
    manager: Option<Arc<dyn DelegateManager>>,
    delegate: Option<Arc<dyn KvStoreDelegate>>,
}

impl MetaStore {
    /// Builds the meta store owner; the engine store opens lazily.
    #[must_use]
    pub fn new(
        engine: Arc<dyn Engine>,
        paths: ServicePaths,
        device: Arc<dyn DeviceProvider>,
        keystore: Arc<dyn DeviceKeystore>,
        device_account_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            paths,
            device,
            keystore,
            device_account_id: device_account_id.into(),
            state: Mutex::new(MetaState::default()),
        }
    }

    /// Returns the cached meta delegate, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the reserved store cannot be
    /// opened.
    pub fn delegate(&self) -> StoreResult<Arc<dyn KvStoreDelegate>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delegate) = &state.delegate {
            return Ok(Arc::clone(delegate));
        }
        let meta_dir = self.paths.meta_dir();
        fs::create_dir_all(&meta_dir)
            .map_err(|err| StoreError::DbError(format!("create meta dir: {err}")))?;
        let manager = self
            .engine
            .delegate_manager(META_APP_ID, DEFAULT_GROUP_ID, &meta_dir)
            .map_err(|err| StoreError::DbError(err.to_string()))?;
        let options = OpenOptions::default();
        let delegate = manager
            .open(META_STORE_ID, &options)
            .map_err(|err| StoreError::DbError(err.to_string()))?;
        state.manager = Some(manager);
        state.delegate = Some(Arc::clone(&delegate));
        Ok(delegate)
    }

    /// Best-effort export plus full-device sync after a mutation.
    fn finish_mutation(&self) {
        if let Ok(delegate) = self.delegate() {
            let backup_file = self.paths.backup_file(
                PathType::De,
                &self.device_account_id,
                DEFAULT_GROUP_ID,
                META_APP_ID,
                META_STORE_ID,
            );
            if let Err(err) = delegate.export(&backup_file, &[]) {
                warn!(error = %err, "meta backup export failed");
            }
        }
        self.sync_meta();
    }

    /// Pushes the meta store to every reachable device; failures are
    /// logged only.
    pub fn sync_meta(&self) {
        let devices = self.device.device_list();
        if devices.is_empty() {
            debug!("meta sync skipped, no reachable devices");
            return;
        }
        let Ok(delegate) = self.delegate() else {
            warn!("meta sync skipped, meta store unavailable");
            return;
        };
        let outcome = delegate.sync(
            &devices,
            SyncMode::PushPull,
            Box::new(|results| {
                debug!(devices = results.len(), "meta sync complete");
            }),
        );
        if let Err(err) = outcome {
            warn!(error = %err, "meta sync failed");
        }
    }

    // ── Store metadata records ──────────────────────────────────────────

    /// Writes (or overwrites) the metadata record for one store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the write fails.
    pub fn put_meta(&self, record: &KvStoreMetaData) -> StoreResult<()> {
        let identity = StoreIdentity {
            device_account_id: record.device_account_id.clone(),
            account_id: record.user_id.clone(),
            bundle_name: record.bundle_name.clone(),
            store_id: record.store_id.clone(),
        };
        let key = meta_record_key(&self.device.local_device_id(), &identity);
        let value = serde_json::to_vec(record)
            .map_err(|err| StoreError::DbError(format!("marshal meta: {err}")))?;
        let result = self
            .delegate()?
            .put(&key, &value)
            .map_err(|err| StoreError::DbError(err.to_string()));
        self.finish_mutation();
        result
    }

    /// Reads the metadata record for one store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    pub fn get_meta(&self, identity: &StoreIdentity) -> StoreResult<KvStoreMetaData> {
        let key = meta_record_key(&self.device.local_device_id(), identity);
        let value = self.delegate()?.get(&key).map_err(|err| match err {
            EngineError::NotFound => StoreError::NotFound,
            other => StoreError::DbError(other.to_string()),
        })?;
        serde_json::from_slice(&value)
            .map_err(|err| StoreError::DbError(format!("unmarshal meta: {err}")))
    }

    /// Deletes the metadata record for one store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the delete fails.
    pub fn delete_meta(&self, identity: &StoreIdentity) -> StoreResult<()> {
        let key = meta_record_key(&self.device.local_device_id(), identity);
        let result = self
            .delegate()?
            .delete(&key)
            .map_err(|err| StoreError::DbError(err.to_string()));
        self.finish_mutation();
        result
    }

    /// Returns every store metadata record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the scan fails.
    pub fn all_meta_records(&self) -> StoreResult<Vec<KvStoreMetaData>> {
        let entries = match self.delegate()?.get_entries(META_RECORD_PREFIX.as_bytes()) {
            Ok(entries) => entries,
            Err(EngineError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::DbError(err.to_string())),
        };
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_slice::<KvStoreMetaData>(&entry.value) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "skipping unreadable meta record"),
            }
        }
        Ok(records)
    }

    /// Returns the store ids recorded for one bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the scan fails.
    pub fn store_ids_for_bundle(
        &self,
        device_account_id: &str,
        bundle_name: &str,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .all_meta_records()?
            .into_iter()
            .filter(|record| {
                record.device_account_id == device_account_id
                    && record.bundle_name == bundle_name
            })
            .map(|record| record.store_id)
            .collect())
    }

    // ── Secret keys ─────────────────────────────────────────────────────

    /// Seals `key` and stores it as the device-local secret record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when sealing fails and
    /// [`StoreError::DbError`] when the write fails.
    pub fn write_secret_key_to_meta(
        &self,
        identity: &StoreIdentity,
        kv_store_type: KvStoreType,
        key: &[u8],
    ) -> StoreResult<()> {
        let record = SecretKeyMetaData {
            created_at: unix_now(),
            sealed_key: self.keystore.seal(SECRET_KEY_AD, key)?,
            kv_store_type,
        };
        self.write_secret_record(identity, &record)
    }

    fn write_secret_record(
        &self,
        identity: &StoreIdentity,
        record: &SecretKeyMetaData,
    ) -> StoreResult<()> {
        let meta_key = secret_record_key(identity, SINGLE_KEY_PURPOSE);
        let value = serde_json::to_vec(record)
            .map_err(|err| StoreError::DbError(format!("marshal secret record: {err}")))?;
        let result = self
            .delegate()?
            .put_local(&meta_key, &value)
            .map_err(|err| StoreError::DbError(err.to_string()));
        self.finish_mutation();
        result
    }

    /// Mirrors `key` into the redundant per-store key file,
    /// `{8-byte creation time}{sealed key}`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when sealing fails and
    /// [`StoreError::DbError`] on filesystem failure.
    pub fn write_secret_key_to_file(&self, key_file: &Path, key: &[u8]) -> StoreResult<()> {
        let sealed = self.keystore.seal(SECRET_KEY_AD, key)?;
        if let Some(parent) = key_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::DbError(format!("create key dir: {err}")))?;
        }
        let mut bytes = Vec::with_capacity(CREATED_AT_BYTES + sealed.len());
        bytes.extend_from_slice(&unix_now().to_le_bytes());
        bytes.extend_from_slice(&sealed);
        fs::write(key_file, bytes)
            .map_err(|err| StoreError::DbError(format!("write key file: {err}")))
    }

    /// Returns whether a secret record exists for the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the meta store is
    /// unavailable.
    pub fn has_secret_key(&self, identity: &StoreIdentity) -> StoreResult<bool> {
        let meta_key = secret_record_key(identity, SINGLE_KEY_PURPOSE);
        match self.delegate()?.get_local(&meta_key) {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound) => Ok(false),
            Err(err) => Err(StoreError::DbError(err.to_string())),
        }
    }

    /// Reads and opens the store's secret key from the meta record.
    ///
    /// Returns the key and whether it is past its lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists and
    /// [`StoreError::CryptError`] when the sealed key cannot be opened.
    pub fn secret_key_from_meta(
        &self,
        identity: &StoreIdentity,
    ) -> StoreResult<(Zeroizing<Vec<u8>>, bool)> {
        let meta_key = secret_record_key(identity, SINGLE_KEY_PURPOSE);
        let value = self.delegate()?.get_local(&meta_key).map_err(|err| match err {
            EngineError::NotFound => StoreError::NotFound,
            other => StoreError::DbError(other.to_string()),
        })?;
        let record: SecretKeyMetaData = serde_json::from_slice(&value)
            .map_err(|err| StoreError::DbError(format!("unmarshal secret record: {err}")))?;
        let key = Zeroizing::new(self.keystore.open_sealed(SECRET_KEY_AD, &record.sealed_key)?);
        Ok((key, record.is_outdated(unix_now())))
    }

    /// Recovers the secret key from the redundant key file and restores
    /// the meta record from it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the file is missing or too
    /// short and [`StoreError::CryptError`] when the sealed key cannot be
    /// opened.
    pub fn recover_secret_key_from_file(
        &self,
        identity: &StoreIdentity,
        kv_store_type: KvStoreType,
        key_file: &Path,
    ) -> StoreResult<(Zeroizing<Vec<u8>>, bool)> {
        let bytes = fs::read(key_file).map_err(|_| StoreError::NotFound)?;
        if bytes.len() <= CREATED_AT_BYTES {
            return Err(StoreError::NotFound);
        }
        let (stamp, sealed) = bytes.split_at(CREATED_AT_BYTES);
        let mut stamp_bytes = [0u8; CREATED_AT_BYTES];
        stamp_bytes.copy_from_slice(stamp);
        let created_at = u64::from_le_bytes(stamp_bytes);
        let key = Zeroizing::new(self.keystore.open_sealed(SECRET_KEY_AD, sealed)?);

        let record = SecretKeyMetaData {
            created_at,
            sealed_key: sealed.to_vec(),
            kv_store_type,
        };
        self.write_secret_record(identity, &record)?;
        Ok((key, record.is_outdated(unix_now())))
    }

    /// Removes the secret record and key file of one store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when any removal fails; all
    /// removals are attempted regardless.
    pub fn remove_secret_key(
        &self,
        identity: &StoreIdentity,
        key_file: &Path,
    ) -> StoreResult<()> {
        let mut failed = false;
        let meta_key = secret_record_key(identity, SINGLE_KEY_PURPOSE);
        if let Err(err) = self.delegate()?.delete_local(&meta_key) {
            warn!(error = %err, "delete secret record failed");
            failed = true;
        }
        if key_file.exists() {
            if let Err(err) = fs::remove_file(key_file) {
                warn!(error = %err, "remove key file failed");
                failed = true;
            }
        }
        self.finish_mutation();
        if failed {
            return Err(StoreError::DbError("secret key removal failed".to_string()));
        }
        Ok(())
    }

    /// Rotates a store's secret key.
    ///
    /// The fresh key is persisted to the meta record first, then handed
    /// to `apply` (the engine rekey); only after a successful adoption is
    /// it mirrored into the key file, so the file never holds a key the
    /// engine has not committed to.
    ///
    /// # Errors
    ///
    /// Returns the `apply` failure, or [`StoreError::DbError`] /
    /// [`StoreError::CryptError`] from persisting the key.
    pub fn rotate_secret_key(
        &self,
        identity: &StoreIdentity,
        kv_store_type: KvStoreType,
        key_file: &Path,
        apply: &dyn Fn(&[u8]) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let key = crate::keystore::random_secret_key();
        self.write_secret_key_to_meta(identity, kv_store_type, &key)?;
        apply(&key)?;
        self.write_secret_key_to_file(key_file, &key)
    }

    // ── Strategy (sync permission) records ──────────────────────────────

    fn update_strategy(
        &self,
        key: &[u8],
        update: impl FnOnce(&mut StrategyMeta),
    ) -> StoreResult<()> {
        let delegate = self.delegate()?;
        let mut strategy = match delegate.get(key) {
            Ok(value) => serde_json::from_slice(&value)
                .map_err(|err| StoreError::DbError(format!("unmarshal strategy: {err}")))?,
            Err(EngineError::NotFound) => StrategyMeta::default(),
            Err(err) => return Err(StoreError::DbError(err.to_string())),
        };
        update(&mut strategy);
        let value = serde_json::to_vec(&strategy)
            .map_err(|err| StoreError::DbError(format!("marshal strategy: {err}")))?;
        let result = delegate
            .put(key, &value)
            .map_err(|err| StoreError::DbError(err.to_string()));
        self.finish_mutation();
        result
    }

    /// Sets the capability switch of one store's strategy record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the write fails.
    pub fn save_strategy_enabled(
        &self,
        device_id: &str,
        identity: &StoreIdentity,
        enabled: bool,
    ) -> StoreResult<()> {
        let key = strategy_record_key(device_id, identity);
        self.update_strategy(&key, |strategy| {
            strategy.capability_enabled = Some(enabled);
        })
    }

    /// Sets the label ranges of one store's strategy record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the write fails.
    pub fn save_strategy_labels(
        &self,
        device_id: &str,
        identity: &StoreIdentity,
        local_labels: Vec<String>,
        remote_support_labels: Vec<String>,
    ) -> StoreResult<()> {
        let key = strategy_record_key(device_id, identity);
        self.update_strategy(&key, |strategy| {
            strategy.local_labels = local_labels;
            strategy.remote_support_labels = remote_support_labels;
        })
    }

    /// Reads one store's strategy record for `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    pub fn get_strategy(
        &self,
        device_id: &str,
        identity: &StoreIdentity,
    ) -> StoreResult<StrategyMeta> {
        let key = strategy_record_key(device_id, identity);
        let value = self.delegate()?.get(&key).map_err(|err| match err {
            EngineError::NotFound => StoreError::NotFound,
            other => StoreError::DbError(other.to_string()),
        })?;
        serde_json::from_slice(&value)
            .map_err(|err| StoreError::DbError(format!("unmarshal strategy: {err}")))
    }

    /// Deletes one store's strategy record for the local device.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the delete fails.
    pub fn delete_strategy(&self, identity: &StoreIdentity) -> StoreResult<()> {
        let key = strategy_record_key(&self.device.local_device_id(), identity);
        let result = self
            .delegate()?
            .delete(&key)
            .map_err(|err| StoreError::DbError(err.to_string()));
        self.finish_mutation();
        result
    }

    /// Decides whether the local device may sync `identity` with
    /// `remote_device_id`.
    ///
    /// Stores without strategy records on either side are unrestricted.
    /// Otherwise one of the labels this device accepts must appear among
    /// the labels the remote offers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PermissionDenied`] when the label ranges do
    /// not intersect.
    pub fn check_sync_permission(
        &self,
        identity: &StoreIdentity,
        remote_device_id: &str,
    ) -> StoreResult<()> {
        let local = self
            .get_strategy(&self.device.local_device_id(), identity)
            .unwrap_or_default();
        let remote = self
            .get_strategy(remote_device_id, identity)
            .unwrap_or_default();
        if local.remote_support_labels.is_empty() || remote.local_labels.is_empty() {
            debug!("no strategy range, sync permitted");
            return Ok(());
        }
        let permitted = local
            .remote_support_labels
            .iter()
            .any(|label| remote.local_labels.contains(label));
        if permitted {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied)
        }
    }

    /// Registers `notify` to run for every metadata record that turns
    /// dirty, so the service can retire stores another component marked
    /// bad.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] when the observer cannot be
    /// registered.
    pub fn watch_dirty(
        &self,
        notify: Box<dyn Fn(&KvStoreMetaData) + Send + Sync>,
    ) -> StoreResult<()> {
        let observer = Arc::new(DirtyRecordObserver { notify });
        self.delegate()?
            .register_observer(meshkv_engine::ObserverMode::Both, observer)
            .map_err(|err| StoreError::DbError(err.to_string()))
    }
}

struct DirtyRecordObserver {
    notify: Box<dyn Fn(&KvStoreMetaData) + Send + Sync>,
}

impl meshkv_engine::KvObserver for DirtyRecordObserver {
    fn on_change(&self, change: &meshkv_engine::ChangeNotification) {
        for entry in change.inserted.iter().chain(change.updated.iter()) {
            if !entry.key.starts_with(META_RECORD_PREFIX.as_bytes()) {
                continue;
            }
            match serde_json::from_slice::<KvStoreMetaData>(&entry.value) {
                Ok(record) if record.is_dirty => (self.notify)(&record),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "unreadable meta record in change batch"),
            }
        }
    }
}
