//! Shared account-migration status.
//!
//! While an account switch is relocating stores, new open requests are
//! rejected with [`crate::StoreError::MigrationInProgress`]. The flag is
//! an explicitly injected handle rather than ambient process state:
//! every component that needs to know "migration in flight" receives a
//! clone of the same [`MigrationStatus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observable in-flight marker for an account migration.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    flag: Arc<AtomicBool>,
}

impl MigrationStatus {
    /// Builds an idle status handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a migration is being processed.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks a migration as in flight until the guard drops.
    pub(crate) fn begin(&self) -> MigrationGuard {
        self.flag.store(true, Ordering::Release);
        MigrationGuard {
            flag: Arc::clone(&self.flag),
        }
    }
}

/// Clears the in-flight marker on drop, including on unwind.
pub(crate) struct MigrationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
