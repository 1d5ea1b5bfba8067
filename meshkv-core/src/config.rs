//! Service-level configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default capacity of the short-window burst bucket.
pub const DEFAULT_BURST_CAPACITY: u16 = 1000;

/// Default capacity of the long-window sustained bucket.
pub const DEFAULT_SUSTAINED_CAPACITY: u16 = 10000;

/// Default interval between backup sweeps.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Configuration of one service instance.
///
/// The two roots mirror the platform's device-encrypted and
/// credential-encrypted storage areas; everything the service persists
/// lives underneath them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Device-encrypted data root.
    pub de_root: PathBuf,
    /// Credential-encrypted data root.
    pub ce_root: PathBuf,
    /// Directory name the service claims under each root.
    pub service_name: String,
    /// Interval between periodic backup sweeps.
    pub backup_interval: Duration,
    /// Burst bucket capacity for every rate-limited facade.
    pub burst_capacity: u16,
    /// Sustained bucket capacity for every rate-limited facade.
    pub sustained_capacity: u16,
}

impl ServiceConfig {
    /// Builds a configuration rooted at `de_root` and `ce_root` with
    /// default limits.
    #[must_use]
    pub fn new(de_root: impl Into<PathBuf>, ce_root: impl Into<PathBuf>) -> Self {
        Self {
            de_root: de_root.into(),
            ce_root: ce_root.into(),
            service_name: "meshkv".to_string(),
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            burst_capacity: DEFAULT_BURST_CAPACITY,
            sustained_capacity: DEFAULT_SUSTAINED_CAPACITY,
        }
    }
}
