//! Engine-level value and option types.

use serde::{Deserialize, Serialize};

/// One key/value pair as stored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Raw key bytes.
    pub key: Vec<u8>,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

impl Entry {
    /// Builds an entry from raw key and value bytes.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Which change sources an observer wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverMode {
    /// Changes written through this device only.
    Native,
    /// Changes synced in from other devices only.
    Foreign,
    /// Both local and remote changes.
    Both,
}

impl ObserverMode {
    /// Returns true if locally-written changes match this mode.
    #[must_use]
    pub const fn includes_native(self) -> bool {
        matches!(self, Self::Native | Self::Both)
    }

    /// Returns true if changes synced from other devices match this mode.
    #[must_use]
    pub const fn includes_foreign(self) -> bool {
        matches!(self, Self::Foreign | Self::Both)
    }
}

/// Direction of a cross-device sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Send local changes to the listed devices.
    Push,
    /// Fetch the listed devices' changes.
    Pull,
    /// Exchange in both directions.
    PushPull,
}

/// Conflict resolution policy selected when a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Timestamp-ordered last writer wins.
    LastWin,
    /// Each device keeps its own namespaced copy of every key.
    DeviceCollaboration,
}

/// Security label of a store, mirrored from the platform data classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLabel {
    /// No label set.
    NotSet,
    /// Public data.
    S0,
    /// Low-sensitivity data.
    S1,
    /// Medium-sensitivity data.
    S2,
    /// High-sensitivity data.
    S3,
    /// Critical data.
    S4,
}

/// Security option attached to an open store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityOption {
    /// Data class label.
    pub label: SecurityLabel,
    /// Whether the store is readable while the device is locked.
    pub accessible_when_locked: bool,
}

/// Options passed to [`crate::DelegateManager::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Create the store when it does not exist yet.
    pub create_if_missing: bool,
    /// Encrypt the store with `cipher_key`.
    pub encrypted: bool,
    /// Cipher key; required when `encrypted` is set.
    pub cipher_key: Vec<u8>,
    /// Schema the store's values must conform to; empty for schemaless.
    pub schema: String,
    /// Conflict resolution policy.
    pub conflict_policy: ConflictPolicy,
    /// Security option; `None` leaves the engine default.
    pub security: Option<SecurityOption>,
    /// Derive the on-disk directory from the store id alone, so the same
    /// physical files are found regardless of the opening identity.
    pub dir_by_store_id_only: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            encrypted: false,
            cipher_key: Vec::new(),
            schema: String::new(),
            conflict_policy: ConflictPolicy::LastWin,
            security: None,
            dir_by_store_id_only: true,
        }
    }
}

/// A compiled query handed to the engine.
///
/// Query compilation is owned by the caller side; the engine only consumes
/// this narrow filter shape.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Restrict results to keys starting with this prefix.
    pub prefix: Vec<u8>,
    /// Stop after this many entries; `0` means unlimited.
    pub limit: usize,
}

impl Query {
    /// Builds a query matching keys under `prefix`.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            limit: 0,
        }
    }
}

/// A batch of changes delivered to a registered observer.
#[derive(Debug, Clone, Default)]
pub struct ChangeNotification {
    /// Entries created by the batch.
    pub inserted: Vec<Entry>,
    /// Entries overwritten by the batch.
    pub updated: Vec<Entry>,
    /// Entries removed by the batch.
    pub deleted: Vec<Entry>,
    /// Device the batch originated from; empty for local writes.
    pub device_id: String,
}

impl ChangeNotification {
    /// Returns true if the batch carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
