//! Control plane of a media driver: shared memory command and response
//! channels between clients and a driver conductor that tracks client
//! sessions, publications, subscriptions, counters and channel endpoints.
//!
//! # Layout
//!
//! - [`buffer`]: `AtomicBuffer` over heap or shared memory regions
//! - [`mpsc`]: many-to-one ring buffer carrying client commands
//! - [`broadcast`]: one-to-many buffer carrying driver responses
//! - [`counters`]: counter metadata and values sections
//! - [`protocol`]: command and response flyweights
//! - [`uri`]: channel URI parsing and UDP endpoint resolution
//! - [`ipc`]: POSIX shared memory and the CnC file layout
//! - [`control`]: client side proxy and listener adapter
//! - [`driver`]: the conductor and its runner
//! - [`runtime`]: clocks and idle strategies

#[cfg(target_endian = "big")]
compile_error!("courier stores shared memory fields little-endian and needs a little-endian target");

pub mod broadcast;
pub mod buffer;
pub mod control;
pub mod counters;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod mpsc;
pub mod protocol;
pub mod runtime;
pub mod trace;
pub mod uri;

pub use buffer::AtomicBuffer;
pub use control::{DriverConnection, DriverListener, DriverListenerAdapter, DriverProxy};
pub use driver::{Driver, DriverConfig, DriverError};
pub use error::{ControlError, Result};
pub use trace::init_tracing;
pub use uri::{ChannelUri, ResolvedEndpoint, UdpChannel};
