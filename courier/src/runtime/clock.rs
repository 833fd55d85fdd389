//! Clocks.
//!
//! The conductor reads time only through [`NanoClock`] and [`EpochClock`], so
//! liveness and reuse deadlines can be exercised in tests with a
//! [`CachedClock`] that only moves when told to.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use minstant::Instant;

/// Monotonic time in nanoseconds from an arbitrary origin.
pub trait NanoClock: Send {
    fn nano_time(&self) -> i64;
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub trait EpochClock: Send {
    fn time_millis(&self) -> i64;
}

/// TSC-backed monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemNanoClock {
    origin: Instant,
}

impl SystemNanoClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemNanoClock {
    #[inline]
    fn nano_time(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock implementing both clock traits.
///
/// Clones share the same time value, so a test can keep one handle and give
/// another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct CachedClock {
    nanos: Arc<AtomicI64>,
}

impl CachedClock {
    #[must_use]
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(nanos)),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    pub fn advance(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.nanos.load(Ordering::Acquire)
    }
}

impl NanoClock for CachedClock {
    #[inline]
    fn nano_time(&self) -> i64 {
        self.get()
    }
}

impl EpochClock for CachedClock {
    fn time_millis(&self) -> i64 {
        self.get() / 1_000_000
    }
}
