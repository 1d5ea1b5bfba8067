//! Scheduling policy for cross-device sync requests.
//!
//! `Sync` never blocks the caller: the handle resolves the targets,
//! computes an effective delay and enqueues a coalescible task on the
//! shared scheduler. The pure policy pieces live here: delay selection,
//! request signatures for coalescing, the bounded busy-retry budget and
//! the per-device outcome map. The handle owns the lock choreography
//! around the actual engine call.

use std::collections::HashMap;
use std::time::Duration;

use meshkv_engine::SyncMode;

use crate::error::StoreError;

/// Smallest delay a caller may request explicitly.
pub const SYNC_DELAY_MIN: Duration = Duration::from_millis(100);

/// Largest delay a caller may request explicitly.
pub const SYNC_DELAY_MAX: Duration = Duration::from_secs(3600);

/// Delay applied to deferred requests and busy re-enqueues.
pub const SYNC_DELAY_DEFAULT: Duration = Duration::from_millis(1000);

/// Upper bound on automatic re-enqueues after the engine reports busy.
pub const MAX_SYNC_BUSY_RETRIES: u32 = 3;

/// Per-device outcome of one sync exchange.
pub type SyncOutcome = HashMap<String, Result<(), StoreError>>;

/// Per-store receiver for sync completion reports.
pub trait SyncCallback: Send + Sync {
    /// Called once per finished exchange with the per-device outcome.
    fn on_complete(&self, store_id: &str, outcome: &SyncOutcome);
}

/// Identity of one enqueued sync request.
///
/// Two requests with the same signature coalesce: while one is pending,
/// enqueueing its twin is a no-op success rather than a duplicate task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyncSignature {
    pub devices: Vec<String>,
    pub mode: SyncMode,
    pub delay: Duration,
}

/// Pending-request bookkeeping guarded by the handle.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub pending: Option<SyncSignature>,
    pub busy_retries: u32,
}

/// Selects the delay a request is scheduled with.
///
/// An explicit delay wins when it falls inside the accepted range; an
/// unspecified or out-of-range delay falls back to the deferred default
/// for backgrounded callers and to immediate execution otherwise.
#[must_use]
pub fn effective_delay(explicit: Option<Duration>, caller_is_background: bool) -> Duration {
    if let Some(delay) = explicit {
        if (SYNC_DELAY_MIN..=SYNC_DELAY_MAX).contains(&delay) {
            return delay;
        }
    }
    if caller_is_background {
        SYNC_DELAY_DEFAULT
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(Duration::from_millis(500)), false, Duration::from_millis(500); "in range wins")]
    #[test_case(Some(Duration::from_millis(50)), false, Duration::ZERO; "below range foreground")]
    #[test_case(Some(Duration::from_secs(7200)), true, SYNC_DELAY_DEFAULT; "above range background")]
    #[test_case(None, true, SYNC_DELAY_DEFAULT; "unspecified background")]
    #[test_case(None, false, Duration::ZERO; "unspecified foreground")]
    fn test_effective_delay(explicit: Option<Duration>, background: bool, expected: Duration) {
        assert_eq!(effective_delay(explicit, background), expected);
    }

    #[test]
    fn test_signatures_coalesce_on_equality() {
        let first = SyncSignature {
            devices: vec!["a".to_string()],
            mode: SyncMode::PushPull,
            delay: Duration::from_millis(200),
        };
        assert_eq!(first, first.clone());
        assert_ne!(
            first,
            SyncSignature {
                delay: Duration::from_millis(300),
                ..first.clone()
            }
        );
    }
}
