//! Store options, identities and shared constants.

use meshkv_engine::{SecurityLabel, SecurityOption};
use serde::{Deserialize, Serialize};

/// Maximum accepted key length in bytes, after trimming.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Maximum accepted value length in bytes (4 MiB).
pub const MAX_VALUE_LENGTH: usize = 4 * 1024 * 1024;

/// Maximum accepted store id length.
pub const MAX_STORE_ID_LENGTH: usize = 128;

/// Maximum accepted bundle name length.
pub const MAX_BUNDLE_NAME_LENGTH: usize = 256;

/// Hard cap on concurrently open stores per bundle, across both path
/// types.
pub const MAX_OPEN_STORES: usize = 16;

/// Length in bytes of a store secret key.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Separator used in composite metadata keys.
pub const KEY_SEPARATOR: &str = "###";

/// Group id recorded in metadata when no grouping applies.
pub const DEFAULT_GROUP_ID: &str = "default";

/// Account id used while no account is signed in.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Versioning tag of new store metadata records.
pub const STORE_META_VERSION: u32 = 1;

/// Versioning and conflict behavior of a store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub enum KvStoreType {
    /// One timestamp-ordered version per key, last writer wins.
    #[default]
    SingleVersion,
    /// Multi-version history kept by the engine.
    MultiVersion,
    /// One logical keyspace per device multiplexed onto one store.
    DeviceCollaboration,
}

/// Data class of a store; drives the DE-vs-CE physical path choice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum SecurityLevel {
    /// Caller declared nothing.
    #[default]
    NoLabel,
    /// Public data.
    S0,
    /// Low-sensitivity data.
    S1,
    /// Medium-sensitivity data.
    S2,
    /// High-sensitivity data.
    S3Ex,
    /// High-sensitivity data, inaccessible while locked.
    S3,
    /// Critical data.
    S4,
}

impl SecurityLevel {
    /// Converts the level to the engine's security option; `NoLabel`
    /// leaves the engine default in place.
    #[must_use]
    pub const fn to_engine(self) -> Option<SecurityOption> {
        let (label, accessible_when_locked) = match self {
            Self::NoLabel => return None,
            Self::S0 => (SecurityLabel::S0, true),
            Self::S1 => (SecurityLabel::S1, true),
            Self::S2 => (SecurityLabel::S2, true),
            Self::S3Ex => (SecurityLabel::S3, true),
            Self::S3 => (SecurityLabel::S3, false),
            Self::S4 => (SecurityLabel::S4, false),
        };
        Some(SecurityOption {
            label,
            accessible_when_locked,
        })
    }

    /// Recovers the level from an engine security option.
    #[must_use]
    pub const fn from_engine(option: SecurityOption) -> Self {
        match option.label {
            SecurityLabel::NotSet => Self::NoLabel,
            SecurityLabel::S0 => Self::S0,
            SecurityLabel::S1 => Self::S1,
            SecurityLabel::S2 => Self::S2,
            SecurityLabel::S3 => {
                if option.accessible_when_locked {
                    Self::S3Ex
                } else {
                    Self::S3
                }
            }
            SecurityLabel::S4 => Self::S4,
        }
    }
}

/// Device-scoped vs account-credential-scoped physical storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathType {
    /// Device-encrypted path: available before the user unlocks.
    De,
    /// Credential-encrypted path: available after unlock only.
    Ce,
}

impl PathType {
    /// Both path types, in the order bookkeeping walks them.
    pub const ALL: [Self; 2] = [Self::De, Self::Ce];

    /// Index used for per-path-type bookkeeping arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::De => 0,
            Self::Ce => 1,
        }
    }
}

/// Which change sources a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeType {
    /// Changes written through this device.
    Local,
    /// Changes synced in from other devices.
    Remote,
    /// Both.
    All,
}

/// Caller-supplied store configuration; immutable for the lifetime of a
/// handle.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the store if it does not exist yet.
    pub create_if_missing: bool,
    /// Encrypt the store with a managed secret key.
    pub encrypt: bool,
    /// Let the engine schedule syncs on its own.
    pub auto_sync: bool,
    /// Include the store in the periodic backup sweep.
    pub backup: bool,
    /// Derive the physical directory from the store id alone.
    pub data_ownership: bool,
    /// Versioning and conflict behavior.
    pub kv_store_type: KvStoreType,
    /// Data class driving the physical path selection.
    pub security_level: SecurityLevel,
    /// Schema values must conform to; empty for schemaless.
    pub schema: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            encrypt: false,
            auto_sync: false,
            backup: true,
            data_ownership: true,
            kv_store_type: KvStoreType::SingleVersion,
            security_level: SecurityLevel::NoLabel,
            schema: String::new(),
        }
    }
}

/// Addresses one logical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreIdentity {
    /// Device account owning the data.
    pub device_account_id: String,
    /// Signed-in account id, or [`DEFAULT_ACCOUNT_ID`].
    pub account_id: String,
    /// Owning application bundle.
    pub bundle_name: String,
    /// Store name within the bundle.
    pub store_id: String,
}

/// Returns `bytes` with surrounding ASCII whitespace removed.
#[must_use]
pub fn trim_key(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

/// Checks a store id: non-empty, bounded, `[A-Za-z0-9_]` only.
#[must_use]
pub fn is_valid_store_id(store_id: &str) -> bool {
    !store_id.is_empty()
        && store_id.len() <= MAX_STORE_ID_LENGTH
        && store_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Checks a bundle name: non-empty, bounded, no separator collisions.
#[must_use]
pub fn is_valid_bundle_name(bundle_name: &str) -> bool {
    !bundle_name.is_empty()
        && bundle_name.len() <= MAX_BUNDLE_NAME_LENGTH
        && !bundle_name.contains(KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"  spaced  ", b"spaced"; "surrounding spaces")]
    #[test_case(b"\tkey\n", b"key"; "tabs and newlines")]
    #[test_case(b"   ", b""; "all whitespace")]
    #[test_case(b"", b""; "empty")]
    #[test_case(b"inner space", b"inner space"; "inner kept")]
    fn test_trim_key(input: &[u8], expected: &[u8]) {
        assert_eq!(trim_key(input), expected);
    }

    #[test]
    fn test_store_id_validation() {
        assert!(is_valid_store_id("student_db_1"));
        assert!(!is_valid_store_id(""));
        assert!(!is_valid_store_id("has space"));
        assert!(!is_valid_store_id(&"x".repeat(MAX_STORE_ID_LENGTH + 1)));
    }
}
