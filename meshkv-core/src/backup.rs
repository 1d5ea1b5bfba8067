//! Scheduled export and corruption-triggered import of store backups.
//!
//! Every backup-eligible store is exported on a fixed-period sweep, and
//! re-imported on demand when the engine reports corruption (the handle's
//! self-heal path). The export protocol never leaves a store without a
//! recoverable snapshot: the previous backup is renamed to `<name>.backup`
//! while the fresh export is in flight and only deleted once the export
//! reports success; a failed export renames it back into place.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use meshkv_engine::{ConflictPolicy, Engine, KvStoreDelegate, OpenOptions};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{StoreError, StoreResult};
use crate::meta::{KvStoreMetaData, MetaStore};
use crate::paths::{rotation_path, ServicePaths};
use crate::scheduler::TaskScheduler;
use crate::types::{KvStoreType, PathType, StoreIdentity};

/// Scheduler key reserved for the periodic sweep.
pub(crate) const BACKUP_SWEEP_TASK_KEY: u64 = 0;

/// Exports and imports store backups.
pub struct BackupCoordinator {
    engine: Arc<dyn Engine>,
    meta: Arc<MetaStore>,
    paths: ServicePaths,
}

impl BackupCoordinator {
    /// Builds the coordinator; sweeps start via
    /// [`BackupCoordinator::schedule_sweep`].
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, meta: Arc<MetaStore>, paths: ServicePaths) -> Self {
        Self {
            engine,
            meta,
            paths,
        }
    }

    /// Enqueues the recurring sweep on `scheduler`, first firing after
    /// `interval`.
    pub fn schedule_sweep(
        self: &Arc<Self>,
        scheduler: &Arc<TaskScheduler>,
        interval: Duration,
    ) {
        let coordinator = Arc::downgrade(self);
        let rearm = Arc::downgrade(scheduler);
        scheduler.schedule(BACKUP_SWEEP_TASK_KEY, interval, move || {
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            coordinator.run_sweep();
            if let Some(scheduler) = rearm.upgrade() {
                coordinator.schedule_sweep(&scheduler, interval);
            }
        });
    }

    /// Exports every backup-eligible store once.
    ///
    /// Dirty and backup-ineligible stores are skipped; per-store failures
    /// are logged and do not stop the sweep.
    pub fn run_sweep(&self) {
        let records = match self.meta.all_meta_records() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "backup sweep skipped, meta store unavailable");
                return;
            }
        };
        for record in records {
            if !record.is_backup || record.is_dirty {
                debug!(store = %record.store_id, "skipping store in backup sweep");
                continue;
            }
            if let Err(err) = self.export_record(&record) {
                warn!(store = %record.store_id, error = %err, "backup export failed");
            }
        }
    }

    fn export_record(&self, record: &KvStoreMetaData) -> StoreResult<()> {
        let Some(path_type) = self.paths.path_type_of(&record.data_dir) else {
            return Err(StoreError::IllegalState(
                "store data dir outside the service roots".to_string(),
            ));
        };
        let identity = StoreIdentity {
            device_account_id: record.device_account_id.clone(),
            account_id: record.user_id.clone(),
            bundle_name: record.bundle_name.clone(),
            store_id: record.store_id.clone(),
        };
        let key = self.export_key(&identity, record.is_encrypt)?;

        let manager = self
            .engine
            .delegate_manager(&record.app_id, &record.user_id, &record.data_dir)
            .map_err(|err| StoreError::DbError(err.to_string()))?;
        let options = OpenOptions {
            create_if_missing: false,
            encrypted: record.is_encrypt,
            cipher_key: key.to_vec(),
            schema: record.schema.clone(),
            conflict_policy: conflict_policy_for(record.kv_store_type),
            security: record.security_level.to_engine(),
            dir_by_store_id_only: true,
        };
        let delegate = manager
            .open(&record.store_id, &options)
            .map_err(StoreError::from_engine)?;
        let result = self.export_with_delegate(path_type, &identity, record.is_encrypt, &delegate);
        if let Err(err) = manager.close(delegate) {
            warn!(store = %record.store_id, error = %err, "closing swept store failed");
        }
        result
    }

    /// Exports one open store through the rotation protocol.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CryptError`] when the store is encrypted and
    /// its secret key cannot be obtained, [`StoreError::DbError`] when the
    /// export or a rename fails. The previous backup survives every
    /// failure mode.
    pub fn export_with_delegate(
        &self,
        path_type: PathType,
        identity: &StoreIdentity,
        encrypted: bool,
        delegate: &Arc<dyn KvStoreDelegate>,
    ) -> StoreResult<()> {
        let key = self.export_key(identity, encrypted)?;
        let backup_file = self.backup_file(path_type, identity);
        if let Some(parent) = backup_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::DbError(format!("create backup dir: {err}")))?;
        }

        let rotation = rotation_path(&backup_file);
        let had_previous = backup_file.exists();
        if had_previous {
            fs::rename(&backup_file, &rotation)
                .map_err(|err| StoreError::DbError(format!("rotate backup: {err}")))?;
        }
        match delegate.export(&backup_file, &key) {
            Ok(()) => {
                if had_previous {
                    if let Err(err) = fs::remove_file(&rotation) {
                        warn!(error = %err, "removing rotated backup failed");
                    }
                }
                Ok(())
            }
            Err(err) => {
                if had_previous {
                    if let Err(restore) = fs::rename(&rotation, &backup_file) {
                        warn!(error = %restore, "restoring rotated backup failed");
                    }
                }
                Err(StoreError::from_engine(err))
            }
        }
    }

    /// Imports the most recent backup into one open store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no backup exists for the
    /// store, [`StoreError::CryptError`] when the secret key cannot be
    /// obtained, or the translated engine failure.
    pub fn import_with_delegate(
        &self,
        path_type: PathType,
        identity: &StoreIdentity,
        encrypted: bool,
        delegate: &Arc<dyn KvStoreDelegate>,
    ) -> StoreResult<()> {
        let backup_file = self.backup_file(path_type, identity);
        let source = Self::latest_backup(&backup_file).ok_or(StoreError::NotFound)?;
        let key = self.export_key(identity, encrypted)?;
        delegate
            .import(&source, &key)
            .map_err(StoreError::from_engine)?;
        info!(store = %identity.store_id, "store recovered from backup");
        Ok(())
    }

    /// Picks the newest recoverable snapshot by the rotation naming rule.
    fn latest_backup(backup_file: &Path) -> Option<PathBuf> {
        if backup_file.exists() {
            return Some(backup_file.to_path_buf());
        }
        let rotation = rotation_path(backup_file);
        rotation.exists().then_some(rotation)
    }

    fn backup_file(&self, path_type: PathType, identity: &StoreIdentity) -> PathBuf {
        self.paths.backup_file(
            path_type,
            &identity.device_account_id,
            &identity.account_id,
            &identity.bundle_name,
            &identity.store_id,
        )
    }

    fn export_key(
        &self,
        identity: &StoreIdentity,
        encrypted: bool,
    ) -> StoreResult<Zeroizing<Vec<u8>>> {
        if !encrypted {
            return Ok(Zeroizing::new(Vec::new()));
        }
        // An outdated key still opens the store; rotation happens on open,
        // not here.
        let (key, _) = self
            .meta
            .secret_key_from_meta(identity)
            .map_err(|_| StoreError::CryptError)?;
        Ok(key)
    }
}

const fn conflict_policy_for(kv_store_type: KvStoreType) -> ConflictPolicy {
    match kv_store_type {
        KvStoreType::SingleVersion | KvStoreType::MultiVersion => ConflictPolicy::LastWin,
        KvStoreType::DeviceCollaboration => ConflictPolicy::DeviceCollaboration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::keystore::SoftwareKeystore;
    use crate::provider::FixedProviders;
    use meshkv_engine::MemoryEngine;

    struct Fixture {
        engine: MemoryEngine,
        coordinator: BackupCoordinator,
        paths: ServicePaths,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServiceConfig::new(dir.path().join("de"), dir.path().join("ce"));
        let paths = ServicePaths::new(&config);
        let engine = MemoryEngine::new();
        let providers = Arc::new(FixedProviders::new("local-device"));
        let meta = Arc::new(MetaStore::new(
            Arc::new(engine.clone()),
            paths.clone(),
            Arc::clone(&providers) as _,
            Arc::new(SoftwareKeystore::ephemeral()),
            "0",
        ));
        let coordinator =
            BackupCoordinator::new(Arc::new(engine.clone()), meta, paths.clone());
        Fixture {
            engine,
            coordinator,
            paths,
            _dir: dir,
        }
    }

    fn identity() -> StoreIdentity {
        StoreIdentity {
            device_account_id: "0".to_string(),
            account_id: "default".to_string(),
            bundle_name: "com.example.notes".to_string(),
            store_id: "notes".to_string(),
        }
    }

    fn open_store(fixture: &Fixture, data_dir: &Path) -> Arc<dyn KvStoreDelegate> {
        let manager = fixture
            .engine
            .delegate_manager("com.example.notes", "default", data_dir)
            .expect("manager");
        manager
            .open("notes", &OpenOptions::default())
            .expect("open")
    }

    #[test]
    fn test_successful_export_leaves_no_rotation_file() {
        let fixture = fixture();
        let identity = identity();
        let data_dir = fixture.paths.store_dir(PathType::De, "0", &identity.bundle_name);
        let delegate = open_store(&fixture, &data_dir);
        delegate.put(b"k", b"v1").expect("put");

        fixture
            .coordinator
            .export_with_delegate(PathType::De, &identity, false, &delegate)
            .expect("first export");
        delegate.put(b"k", b"v2").expect("put");
        fixture
            .coordinator
            .export_with_delegate(PathType::De, &identity, false, &delegate)
            .expect("second export");

        let backup_file = fixture.coordinator.backup_file(PathType::De, &identity);
        assert!(backup_file.exists());
        assert!(!rotation_path(&backup_file).exists());
    }

    #[test]
    fn test_failed_export_restores_previous_backup() {
        let fixture = fixture();
        let identity = identity();
        let data_dir = fixture.paths.store_dir(PathType::De, "0", &identity.bundle_name);
        let delegate = open_store(&fixture, &data_dir);
        delegate.put(b"k", b"v1").expect("put");

        fixture
            .coordinator
            .export_with_delegate(PathType::De, &identity, false, &delegate)
            .expect("first export");
        let backup_file = fixture.coordinator.backup_file(PathType::De, &identity);
        let before = fs::read(&backup_file).expect("read backup");

        fixture.engine.fail_next_export(&data_dir, "notes");
        let outcome = fixture
            .coordinator
            .export_with_delegate(PathType::De, &identity, false, &delegate);
        assert!(outcome.is_err());
        assert_eq!(fs::read(&backup_file).expect("read backup"), before);
        assert!(!rotation_path(&backup_file).exists());
    }

    #[test]
    fn test_import_restores_exported_data() {
        let fixture = fixture();
        let identity = identity();
        let data_dir = fixture.paths.store_dir(PathType::De, "0", &identity.bundle_name);
        let delegate = open_store(&fixture, &data_dir);
        delegate.put(b"k", b"saved").expect("put");

        fixture
            .coordinator
            .export_with_delegate(PathType::De, &identity, false, &delegate)
            .expect("export");
        delegate.clear().expect("clear");

        fixture
            .coordinator
            .import_with_delegate(PathType::De, &identity, false, &delegate)
            .expect("import");
        assert_eq!(delegate.get(b"k").expect("get"), b"saved".to_vec());
    }

    #[test]
    fn test_import_without_backup_reports_not_found() {
        let fixture = fixture();
        let identity = identity();
        let data_dir = fixture.paths.store_dir(PathType::De, "0", &identity.bundle_name);
        let delegate = open_store(&fixture, &data_dir);

        assert_eq!(
            fixture
                .coordinator
                .import_with_delegate(PathType::De, &identity, false, &delegate),
            Err(StoreError::NotFound)
        );
    }
}
