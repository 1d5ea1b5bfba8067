//! Two-tier token-bucket admission control.
//!
//! Every rate-limited facade carries one [`FlowController`]: a short
//! burst bucket and a long sustained bucket. A call is admitted only when
//! both buckets hold a token, and consumption is all-or-nothing: when
//! the second bucket is empty the token already reserved from the first
//! is returned, so a rejected call never drains either bucket.
//!
//! Buckets refill lazily: the first admission check after a bucket's
//! window has elapsed restores it to full capacity and always succeeds
//! for that bucket. Rejected calls are not buffered or retried here.
//!
//! Counters live in packed atomics so admission checks never contend
//! with the handle's data-path locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Window of the burst bucket.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Window of the sustained bucket.
pub const SUSTAINED_WINDOW: Duration = Duration::from_secs(60);

const STAMP_BITS: u32 = 48;
const STAMP_MASK: u64 = (1 << STAMP_BITS) - 1;

/// One lazily refilled token bucket.
///
/// State packs `(left_tokens, last_refresh_ms)` into a single atomic;
/// `last_refresh_ms == 0` marks a bucket that has never been used.
struct TokenBucket {
    state: AtomicU64,
    capacity: u16,
    window_ms: u64,
}

impl TokenBucket {
    fn new(capacity: u16, window: Duration) -> Self {
        Self {
            state: AtomicU64::new(0),
            capacity,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    const fn pack(left: u16, stamp_ms: u64) -> u64 {
        ((left as u64) << STAMP_BITS) | (stamp_ms & STAMP_MASK)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn unpack(state: u64) -> (u16, u64) {
        ((state >> STAMP_BITS) as u16, state & STAMP_MASK)
    }

    /// Reserves one token, refilling first when the window has elapsed.
    fn try_take(&self, now_ms: u64) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (left, stamp) = Self::unpack(current);
            let next = if stamp == 0 || now_ms.saturating_sub(stamp) >= self.window_ms {
                Self::pack(self.capacity - 1, now_ms)
            } else if left >= 1 {
                Self::pack(left - 1, stamp)
            } else {
                return false;
            };
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns a reserved token after the paired bucket denied the call.
    fn give_back(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (left, stamp) = Self::unpack(current);
            let next = Self::pack(left.saturating_add(1).min(self.capacity), stamp);
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Admission controller pairing a burst and a sustained bucket.
pub struct FlowController {
    burst: TokenBucket,
    sustained: TokenBucket,
    epoch: Instant,
}

impl FlowController {
    /// Builds a controller with the given bucket capacities.
    #[must_use]
    pub fn new(burst_capacity: u16, sustained_capacity: u16) -> Self {
        Self {
            burst: TokenBucket::new(burst_capacity, BURST_WINDOW),
            sustained: TokenBucket::new(sustained_capacity, SUSTAINED_WINDOW),
            epoch: Instant::now(),
        }
    }

    /// Checks and consumes one token from each bucket.
    ///
    /// Returns false without consuming anything when either bucket is
    /// empty.
    #[must_use]
    pub fn admit(&self) -> bool {
        let now_ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        // Shift by one so a stamp of zero stays the never-used marker.
        self.admit_at(now_ms + 1)
    }

    fn admit_at(&self, now_ms: u64) -> bool {
        if !self.burst.try_take(now_ms) {
            return false;
        }
        if !self.sustained.try_take(now_ms) {
            self.burst.give_back();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u64 = 60_000;

    #[test]
    fn test_sustained_exhaustion_denies_then_window_restores() {
        let flow = FlowController::new(100, 3);
        for _ in 0..3 {
            assert!(flow.admit_at(1));
        }
        assert!(!flow.admit_at(1));

        // One full sustained window later the next call succeeds again.
        assert!(flow.admit_at(1 + MINUTE_MS));
    }

    #[test]
    fn test_burst_exhaustion_leaves_sustained_untouched() {
        let flow = FlowController::new(2, 4);
        assert!(flow.admit_at(1));
        assert!(flow.admit_at(1));
        // Burst is dry; the denial must not consume sustained tokens.
        assert!(!flow.admit_at(1));
        assert!(!flow.admit_at(1));

        // Burst window elapses; the two remaining sustained tokens are
        // still there.
        assert!(flow.admit_at(1 + 1000));
        assert!(flow.admit_at(1 + 1000 + 1000));
        assert!(!flow.admit_at(1 + 1000 + 1000));
    }

    #[test]
    fn test_refill_restores_full_capacity() {
        let flow = FlowController::new(2, 100);
        assert!(flow.admit_at(1));
        assert!(flow.admit_at(1));
        assert!(!flow.admit_at(1));

        assert!(flow.admit_at(1 + 1000));
        assert!(flow.admit_at(1 + 1000));
        assert!(!flow.admit_at(1 + 1000));
    }

    #[test]
    fn test_wall_clock_admission() {
        let flow = FlowController::new(1000, 10000);
        assert!(flow.admit());
    }
}
