//! Service facade and account-migration orchestration.
//!
//! [`KvStoreService`] is the entry point a daemon exposes to callers: it
//! validates identifiers, gates requests while an account migration is in
//! flight, runs the secret-key protocol around every encrypted open, and
//! routes to the per-device-account [`UserManager`] registries. Account
//! and device events enter here as well: an account change drives the
//! [`MigrationCoordinator`] across every registry, a device change
//! triggers a best-effort resync of the metadata store.
//!
//! The secret-key protocol on the open path follows the bookkeeping rules
//! of [`crate::meta`]: a fresh key is minted and persisted (meta record
//! first, then the redundant key file) on the first encrypted open; a
//! later open reads the key back from the meta record and falls back to
//! the key file when the record is lost; a key past its lifetime is
//! rotated right after the store opens. When the engine still reports
//! corruption after the key fallback, the damaged database is removed and
//! rebuilt from its last backup, and only the recovery outcome
//! ([`StoreError::RecoverSucceeded`] or [`StoreError::RecoverFailed`]) is
//! surfaced; the open is not retried automatically.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshkv_engine::Engine;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::app::{convert_path_type, AppManager};
use crate::backup::BackupCoordinator;
use crate::config::ServiceConfig;
use crate::error::{StoreError, StoreResult};
use crate::handle::StoreHandle;
use crate::keystore::{random_secret_key, DeviceKeystore};
use crate::meta::{KvStoreMetaData, MetaStore};
use crate::migration::MigrationStatus;
use crate::paths::{rotation_path, ServicePaths};
use crate::provider::{AccountProvider, AppIdResolver, DeviceProvider};
use crate::scheduler::TaskScheduler;
use crate::types::{
    is_valid_bundle_name, is_valid_store_id, Options, StoreIdentity, STORE_META_VERSION,
};
use crate::user::UserManager;

/// Shared collaborators handed down to every registry level.
#[derive(Clone)]
pub(crate) struct ServiceDeps {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) paths: ServicePaths,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) backup: Arc<BackupCoordinator>,
    pub(crate) devices: Arc<dyn DeviceProvider>,
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) burst_capacity: u16,
    pub(crate) sustained_capacity: u16,
}

/// Relocates every open store when the signed-in account changes.
///
/// The in-flight marker is an explicitly shared [`MigrationStatus`]
/// handle, observable by anyone holding a clone; new open and delete
/// requests are rejected with [`StoreError::MigrationInProgress`] while
/// it is set.
pub struct MigrationCoordinator {
    status: MigrationStatus,
}

impl MigrationCoordinator {
    fn new() -> Self {
        Self {
            status: MigrationStatus::new(),
        }
    }

    /// Returns the shared in-flight status handle.
    #[must_use]
    pub fn status(&self) -> &MigrationStatus {
        &self.status
    }

    /// Walks every registry and migrates its open stores to
    /// `new_account_id`.
    ///
    /// A failing registry is counted but does not stop the remaining
    /// ones.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationFailed`] when at least one store
    /// failed to migrate.
    pub(crate) fn migrate(
        &self,
        users: &[Arc<UserManager>],
        new_account_id: &str,
    ) -> StoreResult<()> {
        let _guard = self.status.begin();
        info!(account = %new_account_id, "account migration begin");
        let mut failed = false;
        for user in users {
            if user.migrate_all(new_account_id).is_err() {
                failed = true;
            }
        }
        info!(account = %new_account_id, failed, "account migration end");
        if failed {
            Err(StoreError::MigrationFailed)
        } else {
            Ok(())
        }
    }
}

/// The per-device management service.
pub struct KvStoreService {
    deps: ServiceDeps,
    account: Arc<dyn AccountProvider>,
    bundles: Arc<dyn AppIdResolver>,
    migration: MigrationCoordinator,
    users: Mutex<HashMap<String, Arc<UserManager>>>,
}

impl KvStoreService {
    /// Builds the service and starts the periodic backup sweep.
    #[must_use]
    pub fn new(
        config: &ServiceConfig,
        engine: Arc<dyn Engine>,
        account: Arc<dyn AccountProvider>,
        devices: Arc<dyn DeviceProvider>,
        bundles: Arc<dyn AppIdResolver>,
        keystore: Arc<dyn DeviceKeystore>,
    ) -> Self {
        let paths = ServicePaths::new(config);
        let meta = Arc::new(MetaStore::new(
            Arc::clone(&engine),
            paths.clone(),
            Arc::clone(&devices),
            keystore,
            account.device_account_id(),
        ));
        let backup = Arc::new(BackupCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&meta),
            paths.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new());
        backup.schedule_sweep(&scheduler, config.backup_interval);
        Self {
            deps: ServiceDeps {
                engine,
                paths,
                meta,
                backup,
                devices,
                scheduler,
                burst_capacity: config.burst_capacity,
                sustained_capacity: config.sustained_capacity,
            },
            account,
            bundles,
            migration: MigrationCoordinator::new(),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the metadata store owner.
    #[must_use]
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.deps.meta
    }

    /// Returns the backup coordinator.
    #[must_use]
    pub fn backup(&self) -> &Arc<BackupCoordinator> {
        &self.deps.backup
    }

    /// Returns a clone of the shared migration in-flight handle.
    #[must_use]
    pub fn migration_status(&self) -> MigrationStatus {
        self.migration.status().clone()
    }

    fn locked_users(&self) -> MutexGuard<'_, HashMap<String, Arc<UserManager>>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user_manager(&self, device_account_id: &str) -> Arc<UserManager> {
        let mut users = self.locked_users();
        if let Some(user) = users.get(device_account_id) {
            return Arc::clone(user);
        }
        let user = Arc::new(UserManager::new(device_account_id, self.deps.clone()));
        users.insert(device_account_id.to_string(), Arc::clone(&user));
        user
    }

    fn prune_user(&self, device_account_id: &str) {
        let mut users = self.locked_users();
        if users
            .get(device_account_id)
            .is_some_and(|user| user.total_open() == 0)
        {
            users.remove(device_account_id);
        }
    }

    /// Resolves and validates the caller-supplied naming.
    fn resolve(&self, bundle_name: &str, store_id: &str) -> StoreResult<ResolvedRequest> {
        let bundle_name = bundle_name.trim();
        let store_id = store_id.trim();
        if !is_valid_bundle_name(bundle_name) {
            return Err(StoreError::InvalidArgument("invalid bundle name".to_string()));
        }
        if !is_valid_store_id(store_id) {
            return Err(StoreError::InvalidArgument("invalid store id".to_string()));
        }
        let true_app_id = self
            .bundles
            .app_id_for_bundle(bundle_name)
            .ok_or(StoreError::PermissionDenied)?;
        let device_account_id = self.account.device_account_id();
        let account_id = self.account.current_account_id();
        Ok(ResolvedRequest {
            identity: StoreIdentity {
                device_account_id,
                account_id,
                bundle_name: bundle_name.to_string(),
                store_id: store_id.to_string(),
            },
            true_app_id,
            system_service: self.bundles.is_system_service(bundle_name),
        })
    }

    /// Compares the request against the store's persisted record.
    fn check_options(&self, options: &Options, identity: &StoreIdentity) -> StoreResult<()> {
        let record = match self.deps.meta.get_meta(identity) {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        if record.is_encrypt != options.encrypt {
            return Err(StoreError::InvalidArgument(
                "encrypt option differs from the existing store".to_string(),
            ));
        }
        if record.version != 0 && record.kv_store_type != options.kv_store_type {
            return Err(StoreError::InvalidArgument(
                "store type differs from the existing store".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens (or shares) one store for a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationInProgress`] while an account
    /// migration is running, [`StoreError::InvalidArgument`] for bad
    /// naming or an options mismatch with the existing store,
    /// [`StoreError::PermissionDenied`] when the bundle cannot be
    /// resolved, [`StoreError::ResourceExhausted`] at the open-store cap,
    /// [`StoreError::CryptError`] when the secret key is unavailable, and
    /// [`StoreError::RecoverSucceeded`] / [`StoreError::RecoverFailed`]
    /// when a corrupted store was rebuilt from backup instead of opened.
    pub fn get_kv_store(
        &self,
        bundle_name: &str,
        store_id: &str,
        options: &Options,
    ) -> StoreResult<Arc<StoreHandle>> {
        if self.migration.status().in_progress() {
            return Err(StoreError::MigrationInProgress);
        }
        let request = self.resolve(bundle_name, store_id)?;
        self.check_options(options, &request.identity)?;

        let key_file = self.deps.paths.secret_key_file(
            &request.identity.device_account_id,
            &request.identity.bundle_name,
            &request.identity.store_id,
        );
        let already_created = self
            .deps
            .meta
            .has_secret_key(&request.identity)
            .unwrap_or(false);

        let mut outdated = false;
        let mut secret_key = Zeroizing::new(Vec::new());
        if options.encrypt {
            if already_created {
                let recovered = self
                    .deps
                    .meta
                    .secret_key_from_meta(&request.identity)
                    .or_else(|err| {
                        debug!(error = %err, "secret record unavailable, recovering from file");
                        self.deps.meta.recover_secret_key_from_file(
                            &request.identity,
                            options.kv_store_type,
                            &key_file,
                        )
                    })
                    .map_err(|_| StoreError::CryptError)?;
                secret_key = recovered.0;
                outdated = recovered.1;
            } else {
                secret_key = random_secret_key();
                self.deps.meta.write_secret_key_to_meta(
                    &request.identity,
                    options.kv_store_type,
                    &secret_key,
                )?;
                self.deps
                    .meta
                    .write_secret_key_to_file(&key_file, &secret_key)?;
            }
        } else if already_created || key_file.exists() {
            warn!(store = %request.identity.store_id, "unencrypted open of an encrypted store");
            return Err(StoreError::CryptError);
        }

        let user = self.user_manager(&request.identity.device_account_id);
        let app = user.app_manager(
            &request.identity.bundle_name,
            &request.true_app_id,
            &request.identity.account_id,
            request.system_service,
        );
        match app.get_store(&request.identity.store_id, options, &secret_key) {
            Ok(handle) => {
                self.finish_open(&handle, &request, options, outdated);
                Ok(handle)
            }
            Err(StoreError::CryptError) => self.open_after_corruption(
                &app,
                &request,
                options,
                &key_file,
                already_created,
                secret_key,
            ),
            Err(err) => {
                if options.encrypt && !already_created {
                    // The key was minted for this attempt; drop it so the
                    // next attempt starts from scratch.
                    if let Err(cleanup) =
                        self.deps.meta.remove_secret_key(&request.identity, &key_file)
                    {
                        warn!(error = %cleanup, "removing unused secret key failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Post-open bookkeeping: rotate an outdated key and refresh the
    /// store's metadata record. Both are best-effort.
    fn finish_open(
        &self,
        handle: &Arc<StoreHandle>,
        request: &ResolvedRequest,
        options: &Options,
        outdated: bool,
    ) {
        if outdated {
            info!(store = %request.identity.store_id, "secret key outdated, rotating");
            if let Err(err) = handle.rekey() {
                warn!(store = %request.identity.store_id, error = %err, "key rotation failed");
            }
        }
        let path_type = convert_path_type(options.security_level, request.system_service);
        let record = KvStoreMetaData {
            device_id: self.deps.devices.local_device_id(),
            user_id: request.identity.account_id.clone(),
            app_id: request.true_app_id.clone(),
            store_id: request.identity.store_id.clone(),
            bundle_name: request.identity.bundle_name.clone(),
            kv_store_type: options.kv_store_type,
            is_encrypt: options.encrypt,
            is_backup: options.backup,
            is_auto_sync: options.auto_sync,
            schema: options.schema.clone(),
            data_dir: self.deps.paths.store_dir(
                path_type,
                &request.identity.device_account_id,
                &request.identity.bundle_name,
            ),
            app_type: if request.system_service {
                "system".to_string()
            } else {
                "application".to_string()
            },
            device_account_id: request.identity.device_account_id.clone(),
            uid: -1,
            version: STORE_META_VERSION,
            security_level: options.security_level,
            is_dirty: false,
        };
        if let Err(err) = self.deps.meta.put_meta(&record) {
            warn!(store = %request.identity.store_id, error = %err, "meta record update failed");
        }
    }

    /// Fallback after the engine reported a bad key or corruption on
    /// open: retry with the file key, then rebuild from the last backup.
    fn open_after_corruption(
        &self,
        app: &Arc<AppManager>,
        request: &ResolvedRequest,
        options: &Options,
        key_file: &Path,
        already_created: bool,
        secret_key: Zeroizing<Vec<u8>>,
    ) -> StoreResult<Arc<StoreHandle>> {
        if options.encrypt && !already_created {
            // The store never existed with this key; drop the minted key
            // so the next attempt starts from scratch.
            if let Err(err) = self.deps.meta.remove_secret_key(&request.identity, key_file) {
                warn!(error = %err, "removing unused secret key failed");
            }
            return Err(StoreError::DbError(
                "creating encrypted store failed".to_string(),
            ));
        }

        let mut cipher_key = secret_key;
        if options.encrypt {
            let (file_key, outdated) = self
                .deps
                .meta
                .recover_secret_key_from_file(&request.identity, options.kv_store_type, key_file)
                .map_err(|_| StoreError::CryptError)?;
            match app.get_store(&request.identity.store_id, options, &file_key) {
                Ok(handle) => {
                    info!(store = %request.identity.store_id, "opened with the file key");
                    self.finish_open(&handle, request, options, outdated);
                    return Ok(handle);
                }
                Err(StoreError::CryptError) => cipher_key = file_key,
                Err(err) => return Err(err),
            }
        }

        let path_type = convert_path_type(options.security_level, request.system_service);
        let backup_file = self.deps.paths.backup_file(
            path_type,
            &request.identity.device_account_id,
            &request.identity.account_id,
            &request.identity.bundle_name,
            &request.identity.store_id,
        );
        if !backup_file.exists() && !rotation_path(&backup_file).exists() {
            warn!(store = %request.identity.store_id, "store corrupted and no backup exists");
            return Err(StoreError::CryptError);
        }

        warn!(store = %request.identity.store_id, "removing corrupted store for recovery");
        app.delete_store(&request.identity.store_id)
            .map_err(|err| StoreError::DbError(format!("remove corrupted store: {err}")))?;
        let mut recreate = options.clone();
        recreate.create_if_missing = true;
        let handle = app
            .get_store(&request.identity.store_id, &recreate, &cipher_key)
            .map_err(|err| StoreError::DbError(format!("recreate store: {err}")))?;
        let restored = handle.restore();
        if let Err(err) = app.close_store(&request.identity.store_id) {
            warn!(store = %request.identity.store_id, error = %err, "closing recovered store failed");
        }
        match restored {
            Ok(()) => Err(StoreError::RecoverSucceeded),
            Err(err) => {
                warn!(store = %request.identity.store_id, error = %err, "backup recovery failed");
                Err(StoreError::RecoverFailed)
            }
        }
    }

    /// Closes one logical open of a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when nothing is open under the
    /// naming.
    pub fn close_kv_store(&self, bundle_name: &str, store_id: &str) -> StoreResult<()> {
        let request = self.resolve(bundle_name, store_id)?;
        let Some(user) = self
            .locked_users()
            .get(&request.identity.device_account_id)
            .cloned()
        else {
            return Err(StoreError::NotOpen);
        };
        let result = user.close_store(&request.identity.bundle_name, &request.identity.store_id);
        self.prune_user(&request.identity.device_account_id);
        result
    }

    /// Force-closes every open store of a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when the bundle has nothing open.
    pub fn close_all_kv_store(&self, bundle_name: &str) -> StoreResult<()> {
        let bundle_name = bundle_name.trim();
        if !is_valid_bundle_name(bundle_name) {
            return Err(StoreError::InvalidArgument("invalid bundle name".to_string()));
        }
        let device_account_id = self.account.device_account_id();
        let Some(user) = self.locked_users().get(&device_account_id).cloned() else {
            return Err(StoreError::NotOpen);
        };
        let result = user.close_all(bundle_name);
        self.prune_user(&device_account_id);
        result
    }

    /// Deletes one physical store and its bookkeeping: metadata record,
    /// secret key (record and file) and strategy record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationInProgress`] while an account
    /// migration is running and [`StoreError::StoreNotFound`] when the
    /// store does not exist.
    pub fn delete_kv_store(&self, bundle_name: &str, store_id: &str) -> StoreResult<()> {
        if self.migration.status().in_progress() {
            return Err(StoreError::MigrationInProgress);
        }
        let request = self.resolve(bundle_name, store_id)?;
        let user = self.user_manager(&request.identity.device_account_id);
        user.delete_store(
            &request.identity.bundle_name,
            &request.true_app_id,
            &request.identity.account_id,
            request.system_service,
            &request.identity.store_id,
        )?;
        self.remove_bookkeeping(&request.identity);
        self.prune_user(&request.identity.device_account_id);
        Ok(())
    }

    /// Deletes every store of a bundle and its bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when the bundle has nothing open.
    pub fn delete_all_kv_store(&self, bundle_name: &str) -> StoreResult<()> {
        if self.migration.status().in_progress() {
            return Err(StoreError::MigrationInProgress);
        }
        let bundle_name = bundle_name.trim();
        if !is_valid_bundle_name(bundle_name) {
            return Err(StoreError::InvalidArgument("invalid bundle name".to_string()));
        }
        let device_account_id = self.account.device_account_id();
        let Some(user) = self.locked_users().get(&device_account_id).cloned() else {
            return Err(StoreError::NotOpen);
        };
        let store_ids = self
            .deps
            .meta
            .store_ids_for_bundle(&device_account_id, bundle_name)
            .unwrap_or_default();
        user.delete_all(bundle_name)?;
        let account_id = self.account.current_account_id();
        for store_id in store_ids {
            self.remove_bookkeeping(&StoreIdentity {
                device_account_id: device_account_id.clone(),
                account_id: account_id.clone(),
                bundle_name: bundle_name.to_string(),
                store_id,
            });
        }
        self.prune_user(&device_account_id);
        Ok(())
    }

    fn remove_bookkeeping(&self, identity: &StoreIdentity) {
        if let Err(err) = self.deps.meta.delete_meta(identity) {
            warn!(store = %identity.store_id, error = %err, "removing meta record failed");
        }
        let key_file = self.deps.paths.secret_key_file(
            &identity.device_account_id,
            &identity.bundle_name,
            &identity.store_id,
        );
        if let Err(err) = self.deps.meta.remove_secret_key(identity, &key_file) {
            debug!(store = %identity.store_id, error = %err, "removing secret key failed");
        }
        if let Err(err) = self.deps.meta.delete_strategy(identity) {
            debug!(store = %identity.store_id, error = %err, "removing strategy record failed");
        }
    }

    /// Handles a signed-in account change: migrates every open store of
    /// every device account to the new account identity.
    ///
    /// Open and delete requests arriving while this runs are rejected
    /// with [`StoreError::MigrationInProgress`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationFailed`] when at least one store
    /// failed; the remaining stores are still migrated.
    pub fn on_account_changed(&self) -> StoreResult<()> {
        let new_account_id = self.account.current_account_id();
        let users: Vec<Arc<UserManager>> = self.locked_users().values().cloned().collect();
        self.migration.migrate(&users, &new_account_id)
    }

    /// Handles removal of a device account: deletes every store it owned
    /// and clears its directories under both roots.
    pub fn on_device_account_removed(&self, device_account_id: &str) {
        let user = self.locked_users().remove(device_account_id);
        if let Some(user) = user {
            user.delete_all_stores();
        }
        for path_type in crate::types::PathType::ALL {
            let dir = self.deps.paths.root(path_type).join(device_account_id);
            if dir.exists() {
                if let Err(err) = fs::remove_dir_all(&dir) {
                    warn!(error = %err, "removing device account dir failed");
                }
            }
        }
    }

    /// Handles a device-topology change with a best-effort resync of the
    /// metadata store.
    pub fn on_device_changed(&self) {
        self.deps.meta.sync_meta();
    }
}

struct ResolvedRequest {
    identity: StoreIdentity,
    true_app_id: String,
    system_service: bool,
}
