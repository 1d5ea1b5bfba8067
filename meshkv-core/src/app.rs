//! Per-bundle store registry.
//!
//! One [`AppManager`] owns every open store of one bundle under one device
//! account. Stores are partitioned by physical path type: device-encrypted
//! (reachable before unlock) or credential-encrypted, selected from the
//! requested security level and whether the bundle is a trusted system
//! service. Each path type carries its own lazily constructed engine
//! delegate manager; the delegate manager is torn down again when the last
//! store of its path type is deleted, so a later open re-creates it
//! cleanly.
//!
//! The registry enforces the hard cap on concurrently open stores across
//! both path types and never constructs a second physical delegate for an
//! identity that is already open; a repeated open shares the existing
//! handle and bumps its open count. The store map has its own mutex,
//! scoped to lookup/insert/erase and never held across an engine call;
//! the delegate-manager slots are guarded separately.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshkv_engine::{ConflictPolicy, DelegateManager, Engine, OpenOptions};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::flow::FlowController;
use crate::handle::{HandleInit, StoreHandle};
use crate::service::ServiceDeps;
use crate::types::{KvStoreType, Options, PathType, SecurityLevel, StoreIdentity, MAX_OPEN_STORES};

/// Selects the physical path type for one open request.
///
/// Low-sensitivity data lives on the device-encrypted path; unlabeled
/// stores only qualify when the bundle is a trusted system service.
/// Everything else goes to the credential-encrypted path.
#[must_use]
pub fn convert_path_type(security_level: SecurityLevel, system_service: bool) -> PathType {
    match security_level {
        SecurityLevel::S0 | SecurityLevel::S1 => PathType::De,
        SecurityLevel::NoLabel if system_service => PathType::De,
        _ => PathType::Ce,
    }
}

type StoreMaps = [HashMap<String, Arc<StoreHandle>>; 2];
type ManagerSlots = [Option<Arc<dyn DelegateManager>>; 2];

/// Registry of open stores for one `(device account, bundle)` pair.
pub struct AppManager {
    device_account_id: String,
    bundle_name: String,
    true_app_id: String,
    system_service: bool,
    account_id: Mutex<String>,
    deps: ServiceDeps,
    flow: FlowController,
    stores: Mutex<StoreMaps>,
    managers: Mutex<ManagerSlots>,
}

impl AppManager {
    pub(crate) fn new(
        device_account_id: impl Into<String>,
        account_id: impl Into<String>,
        bundle_name: impl Into<String>,
        true_app_id: impl Into<String>,
        system_service: bool,
        deps: ServiceDeps,
    ) -> Self {
        let flow = FlowController::new(deps.burst_capacity, deps.sustained_capacity);
        Self {
            device_account_id: device_account_id.into(),
            bundle_name: bundle_name.into(),
            true_app_id: true_app_id.into(),
            system_service,
            account_id: Mutex::new(account_id.into()),
            deps,
            flow,
            stores: Mutex::new([HashMap::new(), HashMap::new()]),
            managers: Mutex::new([None, None]),
        }
    }

    fn stores_locked(&self) -> MutexGuard<'_, StoreMaps> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn managers_locked(&self) -> MutexGuard<'_, ManagerSlots> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_id(&self) -> String {
        self.account_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn admit(&self) -> StoreResult<()> {
        if self.flow.admit() {
            Ok(())
        } else {
            Err(StoreError::RateLimited)
        }
    }

    /// Number of open stores across both path types.
    #[must_use]
    pub fn total_open(&self) -> usize {
        let stores = self.stores_locked();
        stores.iter().map(HashMap::len).sum()
    }

    /// Returns the already-open handle for `store_id`, if any.
    #[must_use]
    pub fn find(&self, store_id: &str) -> Option<Arc<StoreHandle>> {
        let stores = self.stores_locked();
        stores.iter().find_map(|map| map.get(store_id).cloned())
    }

    fn path_type_for(&self, options: &Options) -> PathType {
        convert_path_type(options.security_level, self.system_service)
    }

    /// Returns the path type's delegate manager, constructing it on first
    /// use.
    fn delegate_manager(&self, path_type: PathType) -> StoreResult<Arc<dyn DelegateManager>> {
        let mut managers = self.managers_locked();
        if let Some(manager) = &managers[path_type.index()] {
            return Ok(Arc::clone(manager));
        }
        let directory =
            self.deps
                .paths
                .store_dir(path_type, &self.device_account_id, &self.bundle_name);
        fs::create_dir_all(&directory)
            .map_err(|err| StoreError::DbError(format!("create store dir: {err}")))?;
        let manager = self
            .deps
            .engine
            .delegate_manager(&self.true_app_id, &self.account_id(), &directory)
            .map_err(|err| StoreError::DbError(err.to_string()))?;
        managers[path_type.index()] = Some(Arc::clone(&manager));
        Ok(manager)
    }

    fn open_options(options: &Options, cipher_key: &[u8]) -> OpenOptions {
        OpenOptions {
            create_if_missing: options.create_if_missing,
            encrypted: options.encrypt,
            cipher_key: cipher_key.to_vec(),
            schema: options.schema.clone(),
            conflict_policy: match options.kv_store_type {
                KvStoreType::SingleVersion | KvStoreType::MultiVersion => ConflictPolicy::LastWin,
                KvStoreType::DeviceCollaboration => ConflictPolicy::DeviceCollaboration,
            },
            security: options.security_level.to_engine(),
            dir_by_store_id_only: options.data_ownership,
        }
    }

    /// Opens (or shares) the store named `store_id`.
    ///
    /// An already-open identity returns the existing handle with its open
    /// count bumped; a fresh open first checks the cap across both path
    /// types, then constructs the delegate through the path type's
    /// manager.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RateLimited`] when flow control denies the
    /// request, [`StoreError::ResourceExhausted`] at the open-store cap,
    /// [`StoreError::CryptError`] when the engine rejects the cipher key
    /// or reports corruption, otherwise the translated open failure.
    pub fn get_store(
        &self,
        store_id: &str,
        options: &Options,
        cipher_key: &[u8],
    ) -> StoreResult<Arc<StoreHandle>> {
        self.admit()?;
        let path_type = self.path_type_for(options);
        {
            let stores = self.stores_locked();
            if let Some(handle) = stores[path_type.index()].get(store_id) {
                handle.increase_open_count();
                return Ok(Arc::clone(handle));
            }
            let total: usize = stores.iter().map(HashMap::len).sum();
            if total >= MAX_OPEN_STORES {
                warn!(
                    bundle = %self.bundle_name,
                    limit = MAX_OPEN_STORES,
                    "open store cap reached"
                );
                return Err(StoreError::ResourceExhausted);
            }
        }

        let manager = self.delegate_manager(path_type)?;
        let delegate = manager
            .open(store_id, &Self::open_options(options, cipher_key))
            .map_err(|err| StoreError::from_engine_open(err, options.create_if_missing))?;
        if let Err(err) = delegate.set_auto_sync(options.auto_sync) {
            warn!(store = %store_id, error = %err, "setting auto sync failed");
        }

        let identity = StoreIdentity {
            device_account_id: self.device_account_id.clone(),
            account_id: self.account_id(),
            bundle_name: self.bundle_name.clone(),
            store_id: store_id.to_string(),
        };
        let handle = StoreHandle::new(HandleInit {
            identity,
            options: options.clone(),
            path_type,
            manager,
            delegate,
            meta: Arc::clone(&self.deps.meta),
            backup: Arc::clone(&self.deps.backup),
            devices: Arc::clone(&self.deps.devices),
            paths: self.deps.paths.clone(),
            scheduler: Arc::clone(&self.deps.scheduler),
            burst_capacity: self.deps.burst_capacity,
            sustained_capacity: self.deps.sustained_capacity,
        });

        let mut stores = self.stores_locked();
        if let Some(existing) = stores[path_type.index()].get(store_id) {
            // Lost the race to another opener: share theirs, fold ours.
            existing.increase_open_count();
            let existing = Arc::clone(existing);
            drop(stores);
            if let Err(err) = handle.force_close() {
                warn!(store = %store_id, error = %err, "closing raced duplicate failed");
            }
            return Ok(existing);
        }
        let total: usize = stores.iter().map(HashMap::len).sum();
        if total >= MAX_OPEN_STORES {
            drop(stores);
            if let Err(err) = handle.force_close() {
                warn!(store = %store_id, error = %err, "closing capped open failed");
            }
            return Err(StoreError::ResourceExhausted);
        }
        stores[path_type.index()].insert(store_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Closes one logical open of `store_id`.
    ///
    /// The handle leaves the registry only when its open count reaches
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when the store is not in the
    /// registry and [`StoreError::DbError`] when the final teardown fails
    /// (the store then stays registered for a retry).
    pub fn close_store(&self, store_id: &str) -> StoreResult<()> {
        let found = {
            let stores = self.stores_locked();
            PathType::ALL.iter().find_map(|path_type| {
                stores[path_type.index()]
                    .get(store_id)
                    .map(|handle| (*path_type, Arc::clone(handle)))
            })
        };
        let Some((path_type, handle)) = found else {
            return Err(StoreError::NotOpen);
        };
        if handle.close()? {
            self.stores_locked()[path_type.index()].remove(store_id);
        }
        Ok(())
    }

    /// Force-closes every open store of the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DbError`] on the first failing teardown; the
    /// remaining stores stay registered.
    pub fn close_all(&self) -> StoreResult<()> {
        for path_type in PathType::ALL {
            let handles: Vec<(String, Arc<StoreHandle>)> = {
                let stores = self.stores_locked();
                stores[path_type.index()]
                    .iter()
                    .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                    .collect()
            };
            for (store_id, handle) in handles {
                handle.force_close()?;
                self.stores_locked()[path_type.index()].remove(&store_id);
            }
        }
        Ok(())
    }

    fn delete_store_in(&self, path_type: PathType, store_id: &str) -> StoreResult<()> {
        let open_handle = {
            let stores = self.stores_locked();
            stores[path_type.index()].get(store_id).cloned()
        };
        if let Some(handle) = open_handle {
            handle.force_close()?;
            self.stores_locked()[path_type.index()].remove(store_id);
        }
        let manager = self.delegate_manager(path_type)?;
        let result = manager.delete_store(store_id).map_err(|err| match err {
            meshkv_engine::EngineError::NotFound => StoreError::StoreNotFound,
            other => StoreError::DbError(other.to_string()),
        });
        if self.stores_locked()[path_type.index()].is_empty() {
            self.managers_locked()[path_type.index()] = None;
        }
        result
    }

    /// Deletes the physical store named `store_id` from whichever path
    /// type holds it, force-closing it first when open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StoreNotFound`] when neither path type knows
    /// the store, otherwise the first hard failure.
    pub fn delete_store(&self, store_id: &str) -> StoreResult<()> {
        self.admit()?;
        let mut deleted = false;
        for path_type in PathType::ALL {
            match self.delete_store_in(path_type, store_id) {
                Ok(()) => deleted = true,
                Err(StoreError::StoreNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if deleted {
            info!(bundle = %self.bundle_name, store = %store_id, "store deleted");
            Ok(())
        } else {
            Err(StoreError::StoreNotFound)
        }
    }

    /// Deletes every store of the bundle, open or not, and tears the
    /// delegate managers down.
    ///
    /// # Errors
    ///
    /// Returns the first hard failure; remaining stores are left in
    /// place.
    pub fn delete_all(&self) -> StoreResult<()> {
        for path_type in PathType::ALL {
            let store_ids: Vec<String> = {
                let stores = self.stores_locked();
                stores[path_type.index()].keys().cloned().collect()
            };
            for store_id in store_ids {
                self.delete_store_in(path_type, &store_id)?;
            }
            self.managers_locked()[path_type.index()] = None;
        }
        Ok(())
    }

    /// Relocates every open store under delegate managers for
    /// `new_account_id`.
    ///
    /// A per-store failure is counted but does not stop the remaining
    /// stores; the new delegate manager for a path type is constructed
    /// lazily, only when that path type has open stores.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationFailed`] when at least one store
    /// failed to migrate.
    pub fn migrate_all(&self, new_account_id: &str) -> StoreResult<()> {
        let mut failures = 0usize;
        for path_type in PathType::ALL {
            let handles: Vec<Arc<StoreHandle>> = {
                let stores = self.stores_locked();
                stores[path_type.index()].values().cloned().collect()
            };
            if handles.is_empty() {
                continue;
            }
            let directory = self.deps.paths.store_dir(
                path_type,
                &self.device_account_id,
                &self.bundle_name,
            );
            let new_manager = match self
                .deps
                .engine
                .delegate_manager(&self.true_app_id, new_account_id, &directory)
            {
                Ok(manager) => manager,
                Err(err) => {
                    warn!(
                        bundle = %self.bundle_name,
                        error = %err,
                        "delegate manager for migration target failed"
                    );
                    failures += handles.len();
                    continue;
                }
            };
            for handle in handles {
                if let Err(err) = handle.migrate_to(new_account_id, Arc::clone(&new_manager)) {
                    warn!(
                        bundle = %self.bundle_name,
                        store = %handle.identity().store_id,
                        error = %err,
                        "store migration failed, continuing with the rest"
                    );
                    failures += 1;
                }
            }
            self.managers_locked()[path_type.index()] = Some(new_manager);
        }
        *self
            .account_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = new_account_id.to_string();
        if failures > 0 {
            Err(StoreError::MigrationFailed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SecurityLevel::S0, false, PathType::De; "s0 app")]
    #[test_case(SecurityLevel::S1, false, PathType::De; "s1 app")]
    #[test_case(SecurityLevel::NoLabel, true, PathType::De; "unlabeled system service")]
    #[test_case(SecurityLevel::NoLabel, false, PathType::Ce; "unlabeled app")]
    #[test_case(SecurityLevel::S2, true, PathType::Ce; "s2 system service")]
    #[test_case(SecurityLevel::S4, false, PathType::Ce; "s4 app")]
    fn test_convert_path_type(level: SecurityLevel, system: bool, expected: PathType) {
        assert_eq!(convert_path_type(level, system), expected);
    }
}
