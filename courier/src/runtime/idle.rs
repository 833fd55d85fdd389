//! Idle strategies for duty-cycle loops.
//!
//! A loop calls [`IdleStrategy::idle`] with the amount of work its last pass
//! did. Any non-zero amount resets the strategy; zero lets it escalate.

use std::thread;
use std::time::Duration;

pub trait IdleStrategy: Send {
    fn idle(&mut self, work_count: usize);

    /// Returns to the least aggressive waiting state.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpinIdle;

impl IdleStrategy for BusySpinIdle {
    #[inline]
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            std::hint::spin_loop();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YieldingIdle;

impl IdleStrategy for YieldingIdle {
    #[inline]
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            thread::yield_now();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SleepingIdle {
    period: Duration,
}

impl SleepingIdle {
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for SleepingIdle {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl IdleStrategy for SleepingIdle {
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            thread::sleep(self.period);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffState {
    NotIdle,
    Spinning(u64),
    Yielding(u64),
    Parking(Duration),
}

/// Spins, then yields, then sleeps with exponentially growing periods.
#[derive(Debug, Clone)]
pub struct BackoffIdle {
    max_spins: u64,
    max_yields: u64,
    min_park: Duration,
    max_park: Duration,
    state: BackoffState,
}

impl BackoffIdle {
    #[must_use]
    pub const fn new(max_spins: u64, max_yields: u64, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            state: BackoffState::NotIdle,
        }
    }

    fn step(&mut self) {
        self.state = match self.state {
            BackoffState::NotIdle => BackoffState::Spinning(0),
            BackoffState::Spinning(n) if n + 1 < self.max_spins => BackoffState::Spinning(n + 1),
            BackoffState::Spinning(_) => BackoffState::Yielding(0),
            BackoffState::Yielding(n) if n + 1 < self.max_yields => BackoffState::Yielding(n + 1),
            BackoffState::Yielding(_) => BackoffState::Parking(self.min_park),
            BackoffState::Parking(period) => {
                BackoffState::Parking((period * 2).min(self.max_park))
            }
        };
    }
}

impl Default for BackoffIdle {
    fn default() -> Self {
        Self::new(10, 5, Duration::from_micros(1), Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdle {
    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        self.step();
        match self.state {
            BackoffState::NotIdle => {}
            BackoffState::Spinning(_) => std::hint::spin_loop(),
            BackoffState::Yielding(_) => thread::yield_now(),
            BackoffState::Parking(period) => thread::sleep(period),
        }
    }

    fn reset(&mut self) {
        self.state = BackoffState::NotIdle;
    }
}
