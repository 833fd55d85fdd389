//! Driver configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::transport::{ChannelTransport, NoOpTransport};
use crate::ipc::shmem::ShmPath;
use crate::runtime::idle::{BackoffIdle, BusySpinIdle, IdleStrategy, SleepingIdle, YieldingIdle};

/// Default name of the CnC shared memory object.
pub const DEFAULT_CNC_PATH: &str = "/courier-cnc";

pub const DEFAULT_TO_DRIVER_BUFFER_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_TO_CLIENTS_BUFFER_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_COUNTERS_VALUES_BUFFER_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_CLIENT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_COUNTER_FREE_TO_REUSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The default CnC path.
///
/// # Panics
///
/// Never: the static path is valid.
#[must_use]
pub fn default_cnc_path() -> ShmPath {
    ShmPath::new(DEFAULT_CNC_PATH).expect("static path is valid")
}

/// Decides whether a `TERMINATE_DRIVER` request is honoured.
pub trait TerminationValidator: Send + Sync {
    fn allow_termination(&self, token: &[u8]) -> bool;
}

impl<F> TerminationValidator for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn allow_termination(&self, token: &[u8]) -> bool {
        self(token)
    }
}

/// Rejects every termination request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyTermination;

impl TerminationValidator for DenyTermination {
    fn allow_termination(&self, _token: &[u8]) -> bool {
        false
    }
}

/// Accepts a termination request only with this exact token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTermination(pub Vec<u8>);

impl TerminationValidator for TokenTermination {
    fn allow_termination(&self, token: &[u8]) -> bool {
        self.0 == token
    }
}

/// How the conductor waits when a duty cycle found no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleStrategyKind {
    BusySpin,
    Yielding,
    Sleeping(Duration),
    #[default]
    Backoff,
}

impl IdleStrategyKind {
    #[must_use]
    pub fn build(self) -> Box<dyn IdleStrategy> {
        match self {
            Self::BusySpin => Box::new(BusySpinIdle),
            Self::Yielding => Box::new(YieldingIdle),
            Self::Sleeping(period) => Box::new(SleepingIdle::new(period)),
            Self::Backoff => Box::new(BackoffIdle::default()),
        }
    }
}

/// Configuration for the driver.
pub struct DriverConfig {
    /// Name of the CnC shared memory object clients connect to.
    pub cnc_path: ShmPath,
    /// Data capacity of the client → driver ring (power of two).
    pub to_driver_buffer_capacity: usize,
    /// Data capacity of the driver → clients broadcast (power of two).
    pub to_clients_buffer_capacity: usize,
    /// Length of the counters values buffer; metadata is sized from it.
    pub counters_values_buffer_length: usize,
    /// Clients silent for longer than this are evicted.
    pub client_liveness_timeout: Duration,
    /// Period of the conductor's liveness, unblock and reclaim checks.
    pub timer_interval: Duration,
    /// Minimum time before a freed counter id is handed out again.
    pub counter_free_to_reuse_timeout: Duration,
    pub idle_strategy: IdleStrategyKind,
    /// Core to pin the conductor thread to.
    pub conductor_core: Option<usize>,
    pub termination_validator: Arc<dyn TerminationValidator>,
    /// Receives endpoint lifecycle events.
    pub transport: Box<dyn ChannelTransport>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cnc_path: default_cnc_path(),
            to_driver_buffer_capacity: DEFAULT_TO_DRIVER_BUFFER_CAPACITY,
            to_clients_buffer_capacity: DEFAULT_TO_CLIENTS_BUFFER_CAPACITY,
            counters_values_buffer_length: DEFAULT_COUNTERS_VALUES_BUFFER_LENGTH,
            client_liveness_timeout: DEFAULT_CLIENT_LIVENESS_TIMEOUT,
            timer_interval: DEFAULT_TIMER_INTERVAL,
            counter_free_to_reuse_timeout: DEFAULT_COUNTER_FREE_TO_REUSE_TIMEOUT,
            idle_strategy: IdleStrategyKind::default(),
            conductor_core: None,
            termination_validator: Arc::new(DenyTermination),
            transport: Box::new(NoOpTransport),
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("cnc_path", &self.cnc_path)
            .field("to_driver_buffer_capacity", &self.to_driver_buffer_capacity)
            .field("to_clients_buffer_capacity", &self.to_clients_buffer_capacity)
            .field(
                "counters_values_buffer_length",
                &self.counters_values_buffer_length,
            )
            .field("client_liveness_timeout", &self.client_liveness_timeout)
            .field("timer_interval", &self.timer_interval)
            .field(
                "counter_free_to_reuse_timeout",
                &self.counter_free_to_reuse_timeout,
            )
            .field("idle_strategy", &self.idle_strategy)
            .field("conductor_core", &self.conductor_core)
            .finish_non_exhaustive()
    }
}

/// A configuration value that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid driver configuration: {field} {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl DriverConfig {
    /// # Errors
    ///
    /// [`ConfigError`] naming the first field that is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_capacity("to_driver_buffer_capacity", self.to_driver_buffer_capacity)?;
        check_capacity("to_clients_buffer_capacity", self.to_clients_buffer_capacity)?;

        if self.counters_values_buffer_length < crate::counters::COUNTER_LENGTH
            || self.counters_values_buffer_length % crate::counters::COUNTER_LENGTH != 0
        {
            return Err(ConfigError {
                field: "counters_values_buffer_length",
                reason: format!(
                    "must be a non-zero multiple of {}, got {}",
                    crate::counters::COUNTER_LENGTH,
                    self.counters_values_buffer_length
                ),
            });
        }

        for (field, value) in [
            ("client_liveness_timeout", self.client_liveness_timeout),
            ("timer_interval", self.timer_interval),
            (
                "counter_free_to_reuse_timeout",
                self.counter_free_to_reuse_timeout,
            ),
        ] {
            if value.is_zero() {
                return Err(ConfigError {
                    field,
                    reason: "must be non-zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn check_capacity(field: &'static str, capacity: usize) -> Result<(), ConfigError> {
    // Ring and broadcast lengths are stored as i32 in the CnC metadata.
    if !capacity.is_power_of_two() || capacity < 1024 || capacity > (1 << 30) {
        return Err(ConfigError {
            field,
            reason: format!("must be a power of two between 1 KiB and 1 GiB, got {capacity}"),
        });
    }
    Ok(())
}
