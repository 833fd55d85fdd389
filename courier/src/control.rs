//! Client side of the control plane.
//!
//! - `client`: [`DriverProxy`] writes commands into the to-driver ring and
//!   [`DriverConnection`] maps the driver's CnC region.
//! - `listener`: [`DriverListenerAdapter`] decodes broadcast responses into
//!   [`DriverListener`] calls.

pub mod client;
pub mod listener;

pub use client::{DriverConnection, DriverProxy};
pub use listener::{DriverListener, DriverListenerAdapter};
