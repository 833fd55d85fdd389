//! Logging for the driver and clients.
//!
//! Log statements go through the `tracing` crate when the `tracing` feature
//! is on. Without it the macros below expand to nothing and the crate has no
//! logging dependency at all.

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "courier=info";

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVE`].
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Like [`init_tracing`] with a caller supplied fallback filter.
///
/// Only the first subscriber installed in a process wins; later calls are
/// ignored so every test can call this freely.
#[cfg(feature = "tracing")]
pub fn init_tracing_with(default_directive: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_timer(fmt::time::uptime())
        .with_file(false)
        .with_line_number(false);

    if tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("subscriber already installed");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing_with(_default_directive: &str) {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {discard as debug, discard as error, discard as info, discard as trace, discard as warn};
