//! Shared memory plumbing between the driver and its clients.
//!
//! - `shmem`: POSIX shared memory regions with Creator/Opener typestate.
//! - `cnc`: layout of the command-and-control region both sides map.

pub mod cnc;
pub mod shmem;
