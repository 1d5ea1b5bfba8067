//! Per-device-account registry of bundle managers.
//!
//! One [`UserManager`] exists per device account and maps each bundle
//! name to its [`AppManager`]. Entries are created lazily on first open
//! and pruned again when a bundle's last store closes, so an idle bundle
//! costs nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::app::AppManager;
use crate::error::{StoreError, StoreResult};
use crate::service::ServiceDeps;

/// Registry of [`AppManager`]s for one device account.
pub struct UserManager {
    device_account_id: String,
    deps: ServiceDeps,
    apps: Mutex<HashMap<String, Arc<AppManager>>>,
}

impl UserManager {
    pub(crate) fn new(device_account_id: impl Into<String>, deps: ServiceDeps) -> Self {
        Self {
            device_account_id: device_account_id.into(),
            deps,
            apps: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, Arc<AppManager>>> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the bundle's manager, creating it on first use.
    pub(crate) fn app_manager(
        &self,
        bundle_name: &str,
        true_app_id: &str,
        account_id: &str,
        system_service: bool,
    ) -> Arc<AppManager> {
        let mut apps = self.locked();
        if let Some(app) = apps.get(bundle_name) {
            return Arc::clone(app);
        }
        let app = Arc::new(AppManager::new(
            self.device_account_id.clone(),
            account_id,
            bundle_name,
            true_app_id,
            system_service,
            self.deps.clone(),
        ));
        apps.insert(bundle_name.to_string(), Arc::clone(&app));
        app
    }

    /// Returns the bundle's manager without creating one.
    #[must_use]
    pub fn find(&self, bundle_name: &str) -> Option<Arc<AppManager>> {
        self.locked().get(bundle_name).cloned()
    }

    /// Number of open stores across every bundle.
    #[must_use]
    pub fn total_open(&self) -> usize {
        let apps: Vec<Arc<AppManager>> = self.locked().values().cloned().collect();
        apps.iter().map(|app| app.total_open()).sum()
    }

    fn prune(&self, bundle_name: &str) {
        let mut apps = self.locked();
        if apps
            .get(bundle_name)
            .is_some_and(|app| app.total_open() == 0)
        {
            apps.remove(bundle_name);
        }
    }

    /// Closes one logical open of `store_id` in `bundle_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when the bundle has no such open
    /// store.
    pub fn close_store(&self, bundle_name: &str, store_id: &str) -> StoreResult<()> {
        let Some(app) = self.find(bundle_name) else {
            return Err(StoreError::NotOpen);
        };
        let result = app.close_store(store_id);
        self.prune(bundle_name);
        result
    }

    /// Force-closes every open store of `bundle_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] when the bundle has nothing open
    /// and [`StoreError::DbError`] on a failing teardown.
    pub fn close_all(&self, bundle_name: &str) -> StoreResult<()> {
        let Some(app) = self.find(bundle_name) else {
            return Err(StoreError::NotOpen);
        };
        let result = app.close_all();
        self.prune(bundle_name);
        result
    }

    /// Deletes the physical store `store_id` of `bundle_name`.
    ///
    /// The bundle manager is consulted even when the store is not open,
    /// so a cold store can still be deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StoreNotFound`] when no path type holds the
    /// store.
    pub fn delete_store(
        &self,
        bundle_name: &str,
        true_app_id: &str,
        account_id: &str,
        system_service: bool,
        store_id: &str,
    ) -> StoreResult<()> {
        let app = self.app_manager(bundle_name, true_app_id, account_id, system_service);
        let result = app.delete_store(store_id);
        self.prune(bundle_name);
        result
    }

    /// Deletes every store of `bundle_name`.
    ///
    /// # Errors
    ///
    /// Returns the first hard failure.
    pub fn delete_all(&self, bundle_name: &str) -> StoreResult<()> {
        let Some(app) = self.find(bundle_name) else {
            return Err(StoreError::NotOpen);
        };
        let result = app.delete_all();
        self.prune(bundle_name);
        result
    }

    /// Deletes every store of every bundle; used when the device account
    /// itself is removed.
    ///
    /// Per-bundle failures are logged and do not stop the sweep.
    pub fn delete_all_stores(&self) {
        let apps: Vec<(String, Arc<AppManager>)> = self
            .locked()
            .iter()
            .map(|(bundle, app)| (bundle.clone(), Arc::clone(app)))
            .collect();
        for (bundle, app) in apps {
            if let Err(err) = app.delete_all() {
                warn!(bundle = %bundle, error = %err, "deleting bundle stores failed");
            }
        }
        self.locked().clear();
    }

    /// Migrates every bundle's open stores to `new_account_id`.
    ///
    /// A failing bundle is counted but does not stop the remaining
    /// bundles.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationFailed`] when at least one bundle
    /// reported a failure.
    pub fn migrate_all(&self, new_account_id: &str) -> StoreResult<()> {
        let apps: Vec<(String, Arc<AppManager>)> = self
            .locked()
            .iter()
            .map(|(bundle, app)| (bundle.clone(), Arc::clone(app)))
            .collect();
        let mut failed = false;
        for (bundle, app) in apps {
            if let Err(err) = app.migrate_all(new_account_id) {
                warn!(bundle = %bundle, error = %err, "bundle migration failed, continuing");
                failed = true;
            }
        }
        if failed {
            Err(StoreError::MigrationFailed)
        } else {
            Ok(())
        }
    }
}
