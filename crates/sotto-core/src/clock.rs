//! Clock synchronization against a trusted time source.
//!
//! Message ordering (`timestamp` on messages, `last_timestamp` on
//! conversations) must reflect a shared notion of time even when the local
//! device clock is skewed.  [`Clock`] holds a single signed offset between
//! local and trusted time; every timestamp-producing call site takes a
//! `Clock` handle and uses [`Clock::now`] instead of reading the system
//! clock directly.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use sotto_shared::constants::CLOCK_DRIFT_WARN_MS;

/// Cheaply cloneable handle to the process-wide clock offset.
///
/// The offset starts at zero and is replaced wholesale by each
/// [`Clock::update_offset`] call: a single authoritative sample wins, with
/// no averaging or smoothing.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    /// trusted_time - local_time, in milliseconds.
    offset_ms: AtomicI64,
    /// Set while |offset| exceeds the drift threshold.
    drifted: AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                offset_ms: AtomicI64::new(0),
                drifted: AtomicBool::new(false),
            }),
        }
    }

    /// Re-anchor the offset from a trusted timestamp sample.
    ///
    /// Last writer wins.  A large offset is not an error -- the local
    /// clock may genuinely be wrong -- but it is surfaced as a diagnostic
    /// so the caller can alert the user or re-sync more aggressively.
    pub fn update_offset(&self, trusted: DateTime<Utc>) {
        let offset_ms = (trusted - Utc::now()).num_milliseconds();
        self.inner.offset_ms.store(offset_ms, Ordering::Relaxed);

        if offset_ms.abs() > CLOCK_DRIFT_WARN_MS {
            self.inner.drifted.store(true, Ordering::Relaxed);
            warn!(offset_ms, "local clock drifts from trusted time");
        } else {
            self.inner.drifted.store(false, Ordering::Relaxed);
            debug!(offset_ms, "clock offset updated");
        }
    }

    /// Current time, corrected by the stored offset.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.inner.offset_ms.load(Ordering::Relaxed))
    }

    /// The stored offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.inner.offset_ms.load(Ordering::Relaxed)
    }

    /// Whether the last sample exceeded the drift threshold.
    pub fn is_drifted(&self) -> bool {
        self.inner.drifted.load(Ordering::Relaxed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
