//! Directory layout owned by the service.
//!
//! Layout under each root:
//!
//! ```text
//! <root>/<service>/<device account>/<account>/<bundle>/   per-bundle stores
//! <root>/<service>/meta/                                  reserved meta store
//! <root>/<service>/backup/<device account>/               backup exports
//! ```
//!
//! Backup files are named by a hash of `account_bundle_store` so the name
//! leaks nothing about the store; the rotation protocol appends
//! `.backup` while a fresh export is in flight. Secret-key files sit next
//! to the store data, named by a hash of the store id.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::ServiceConfig;
use crate::types::{PathType, DEFAULT_ACCOUNT_ID};

const META_DIR_NAME: &str = "meta";
const BACKUP_DIR_NAME: &str = "backup";
const SECRET_KEY_SUFFIX: &str = ".sig.key";

/// Suffix carried by the rotation copy of a backup file.
pub const BACKUP_ROTATION_SUFFIX: &str = ".backup";

/// Path helpers derived from one [`ServiceConfig`].
#[derive(Debug, Clone)]
pub struct ServicePaths {
    de_root: PathBuf,
    ce_root: PathBuf,
}

impl ServicePaths {
    /// Builds the layout for `config`.
    #[must_use]
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            de_root: config.de_root.join(&config.service_name),
            ce_root: config.ce_root.join(&config.service_name),
        }
    }

    /// Returns the service root for `path_type`.
    #[must_use]
    pub fn root(&self, path_type: PathType) -> &Path {
        match path_type {
            PathType::De => &self.de_root,
            PathType::Ce => &self.ce_root,
        }
    }

    /// Returns which service root a data directory lives under, or
    /// `None` for directories the service does not own.
    #[must_use]
    pub fn path_type_of(&self, dir: &Path) -> Option<PathType> {
        if dir.starts_with(&self.de_root) {
            Some(PathType::De)
        } else if dir.starts_with(&self.ce_root) {
            Some(PathType::Ce)
        } else {
            None
        }
    }

    /// Returns the directory of the reserved metadata store (always
    /// device-scoped).
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.de_root.join(META_DIR_NAME)
    }

    /// Returns the data directory for one bundle's stores.
    #[must_use]
    pub fn store_dir(
        &self,
        path_type: PathType,
        device_account_id: &str,
        bundle_name: &str,
    ) -> PathBuf {
        self.root(path_type)
            .join(device_account_id)
            .join(DEFAULT_ACCOUNT_ID)
            .join(bundle_name)
    }

    /// Returns the backup directory for one device account.
    #[must_use]
    pub fn backup_dir(&self, path_type: PathType, device_account_id: &str) -> PathBuf {
        self.root(path_type)
            .join(BACKUP_DIR_NAME)
            .join(device_account_id)
    }

    /// Returns the backup file path for one store.
    #[must_use]
    pub fn backup_file(
        &self,
        path_type: PathType,
        device_account_id: &str,
        account_id: &str,
        bundle_name: &str,
        store_id: &str,
    ) -> PathBuf {
        let name = hashed_backup_name(account_id, bundle_name, store_id);
        self.backup_dir(path_type, device_account_id).join(name)
    }

    /// Returns the redundant secret-key file path for one store.
    ///
    /// Key files always live under the device-encrypted root so they are
    /// reachable before the user unlocks.
    #[must_use]
    pub fn secret_key_file(
        &self,
        device_account_id: &str,
        bundle_name: &str,
        store_id: &str,
    ) -> PathBuf {
        let hashed = hashed_store_name(store_id);
        self.store_dir(PathType::De, device_account_id, bundle_name)
            .join(format!("{hashed}{SECRET_KEY_SUFFIX}"))
    }
}

/// Hashed backup file name for `account_bundle_store`.
#[must_use]
pub fn hashed_backup_name(account_id: &str, bundle_name: &str, store_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"_");
    hasher.update(bundle_name.as_bytes());
    hasher.update(b"_");
    hasher.update(store_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashed on-disk name for a store id.
#[must_use]
pub fn hashed_store_name(store_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(store_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the rotation path (`<file>.backup`) for a backup file.
#[must_use]
pub fn rotation_path(backup_file: &Path) -> PathBuf {
    let mut name = backup_file
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    name.push_str(BACKUP_ROTATION_SUFFIX);
    backup_file.with_file_name(name)
}
