//! Driver runner: owns the CnC shared memory object and the conductor
//! thread.
//!
//! # Architecture
//!
//! ```text
//!  clients ──(to-driver ring)──> conductor thread ──(broadcast)──> clients
//!                                   │
//!                                   ├─ Registry (sessions, resources, endpoints)
//!                                   ├─ CountersManager (counters section of CnC)
//!                                   └─ ChannelTransport (data path seam)
//! ```
//!
//! One thread runs [`DriverConductor::do_work`] in a loop, idling with the
//! configured [`IdleStrategy`](crate::runtime::IdleStrategy) when a cycle
//! finds nothing to do. It stops when the shutdown flag is raised or a
//! client sends an accepted termination request.
//!
//! # Example
//!
//! ```no_run
//! use courier::driver::{Driver, DriverConfig};
//!
//! let driver = Driver::launch(DriverConfig::default())?;
//! // ... clients connect through the CnC object ...
//! driver.shutdown();
//! # Ok::<(), courier::driver::DriverError>(())
//! ```

pub mod client_proxy;
pub mod conductor;
pub mod config;
pub mod registry;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ipc::cnc::{self, CncBuffers, CncLayout, CncMetadata};
use crate::ipc::shmem::{self, ShmError, ShmPath};
use crate::runtime::{EpochClock, IdleStrategy, SystemEpochClock};
use crate::trace::{debug, error, info, warn};

pub use client_proxy::ClientProxy;
pub use conductor::{ConductorContext, ConductorState, DriverConductor};
pub use config::{
    ConfigError, DenyTermination, DriverConfig, IdleStrategyKind, TerminationValidator,
    TokenTermination,
};
pub use registry::Registry;
pub use transport::{ChannelTransport, NoOpTransport};

/// Error launching the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The CnC object could not be created.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// Another driver is heartbeating on the same CnC object.
    #[error("an active driver already owns {path}")]
    AlreadyActive { path: String },
    #[error("failed to spawn conductor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle to a running driver.
///
/// Dropping the handle raises the shutdown flag but does not wait for the
/// conductor. Use [`Driver::shutdown`] to join it.
pub struct Driver {
    cnc_path: ShmPath,
    cnc: CncBuffers,
    shutdown_flag: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    conductor_handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Creates the CnC object and starts the conductor thread.
    ///
    /// A CnC object left behind by a driver that stopped heartbeating is
    /// removed first.
    ///
    /// # Errors
    ///
    /// - [`DriverError::Config`] if `config` fails validation
    /// - [`DriverError::AlreadyActive`] if a live driver owns the CnC name
    /// - [`DriverError::Shm`] if the CnC object cannot be created
    /// - [`DriverError::Spawn`] if the thread cannot be started
    pub fn launch(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;

        let now_ms = SystemEpochClock.time_millis();
        let cnc_path = config.cnc_path.clone();
        info!(
            cnc_path = %cnc_path,
            to_driver_capacity = config.to_driver_buffer_capacity,
            to_clients_capacity = config.to_clients_buffer_capacity,
            client_liveness_timeout_ms = config.client_liveness_timeout.as_millis() as u64,
            "driver starting"
        );

        if let Ok(existing) = cnc::open(&cnc_path, Duration::ZERO)
            && existing.is_driver_active(now_ms)
        {
            return Err(DriverError::AlreadyActive {
                path: cnc_path.to_string(),
            });
        }
        shmem::unlink(&cnc_path);

        let layout = CncLayout::new(
            config.to_driver_buffer_capacity,
            config.to_clients_buffer_capacity,
            config.counters_values_buffer_length,
        );
        let metadata = CncMetadata {
            client_liveness_timeout_ns: i64::try_from(config.client_liveness_timeout.as_nanos())
                .unwrap_or(i64::MAX),
            start_timestamp_ms: now_ms,
            pid: i64::from(std::process::id()),
        };
        let cnc = cnc::create(&cnc_path, layout, metadata)?;
        debug!(cnc_path = %cnc_path, length = layout.total_length(), "CnC created");

        let idle = config.idle_strategy.build();
        let conductor_core = config.conductor_core;
        let conductor = DriverConductor::new(&cnc, ConductorContext::from_config(config));

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let runner = ConductorRunner {
            conductor,
            idle,
            shutdown_flag: Arc::clone(&shutdown_flag),
            terminated: Arc::clone(&terminated),
        };

        let conductor_handle = thread::Builder::new()
            .name("courier-conductor".into())
            .spawn(move || {
                if let Some(id) = conductor_core
                    && !core_affinity::set_for_current(core_affinity::CoreId { id })
                {
                    warn!(core = id, "failed to pin conductor thread");
                }
                info!("conductor thread started");
                runner.run();
                info!("conductor thread exiting");
            })
            .map_err(DriverError::Spawn)?;

        info!(cnc_path = %cnc_path, "driver started");

        Ok(Self {
            cnc_path,
            cnc,
            shutdown_flag,
            terminated,
            conductor_handle: Some(conductor_handle),
        })
    }

    #[must_use]
    pub const fn cnc_path(&self) -> &ShmPath {
        &self.cnc_path
    }

    /// The driver's own view of the CnC object.
    #[must_use]
    pub const fn cnc(&self) -> &CncBuffers {
        &self.cnc
    }

    /// True once a client's termination request was accepted.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// True while the conductor thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.conductor_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Stops the conductor and waits for it to exit. The CnC object is
    /// unlinked once the handle is dropped.
    pub fn shutdown(mut self) {
        info!("driver shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Release);

        if let Some(handle) = self.conductor_handle.take() {
            debug!("waiting for conductor thread to exit");
            if handle.join().is_err() {
                error!("conductor thread panicked");
            }
        }

        info!("driver shutdown complete");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
    }
}

struct ConductorRunner {
    conductor: DriverConductor,
    idle: Box<dyn IdleStrategy>,
    shutdown_flag: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl ConductorRunner {
    fn run(mut self) {
        while !self.shutdown_flag.load(Ordering::Acquire) {
            let work_count = self.conductor.do_work();
            if self.conductor.is_terminated() {
                self.terminated.store(true, Ordering::Release);
                break;
            }
            self.idle.idle(work_count);
        }
        self.conductor.close();
    }
}
