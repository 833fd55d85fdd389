//! Runtime utilities shared by the driver and clients.
//!
//! - `clock`: monotonic and wall clocks behind traits so tests can drive time.
//! - `idle`: idle strategies for duty-cycle loops that found no work.

pub mod clock;
pub mod idle;

pub use clock::{CachedClock, EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};
pub use idle::{BackoffIdle, BusySpinIdle, IdleStrategy, SleepingIdle, YieldingIdle};
