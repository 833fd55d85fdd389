//! POSIX shared memory regions with typestate-based cleanup.
//!
//! This module provides a safe wrapper over POSIX shared memory
//! (`shm_open`, `mmap`) sized at runtime, so the driver can lay out its
//! command-and-control region from configuration.
//!
//! # Overview
//!
//! - [`ShmRegion<Mode>`] - Mapped byte region, usable as a [`MemoryRegion`]
//! - [`ShmPath`] - Validated POSIX shared memory name
//! - [`Creator`] - Typestate marker: creates new shared memory, unlinks on drop
//! - [`Opener`] - Typestate marker: opens existing shared memory, no unlink on drop
//!
//! # Basic Usage
//!
//! ```no_run
//! use courier::buffer::AtomicBuffer;
//! use courier::ipc::shmem::*;
//! use std::sync::Arc;
//!
//! let path = ShmPath::new("/my-region")?;
//!
//! // Process A: create and write
//! let region = Arc::new(ShmRegion::<Creator>::create(&path, 4096)?);
//! let buffer = AtomicBuffer::new(region);
//! buffer.put_i64_ordered(0, 42);
//!
//! // Process B: open and read
//! let region = Arc::new(ShmRegion::<Opener>::open(&path)?);
//! let buffer = AtomicBuffer::new(region);
//! assert_eq!(buffer.get_i64_volatile(0), 42);
//! # Ok::<(), ShmError>(())
//! ```
//!
//! # Unsafety Encapsulation
//!
//! ```text
//! Unsafe POSIX operations:    Safe Rust wrappers:
//! ┌──────────────────┐        ┌──────────────────────┐
//! │ shm_open()       │───────>│ ShmRegion::create()  │
//! │ mmap()           │───────>│ ShmRegion::open()    │
//! │ munmap()         │───────>│ Drop::drop()         │
//! │ shm_unlink()     │───────>│ Drop::drop()         │
//! │ *mut u8          │───────>│ MemoryRegion         │
//! └──────────────────┘        └──────────────────────┘
//! ```
//!
//! # Cleanup and Crash Handling
//!
//! - **[`Creator`]**: Unmaps memory AND unlinks the name on drop
//! - **[`Opener`]**: Only unmaps (name persists for other processes)
//!
//! A crashed driver leaves its name behind; call [`unlink`] before creating.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{NonNull, null_mut};
use thiserror::Error;

use crate::buffer::MemoryRegion;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`ShmRegion`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object is smaller than its layout requires.
    #[error("shared memory `{path}` too small: need {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never published its initialization marker.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
    /// The region was written by an incompatible layout version.
    #[error("shared memory `{path}` has layout version {actual:#x}, expected {expected:#x}")]
    VersionMismatch {
        path: String,
        expected: i32,
        actual: i32,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// True when the failure is a permissions error (sandboxed environments).
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::PosixError { source, .. } if *source == io::Errno::ACCESS)
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// POSIX requires the name to start with `/`, contain no further `/`, and
/// not exceed `NAME_MAX` (255) bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if the name violates POSIX rules.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Removes a shared memory name, ignoring absence.
///
/// Used on driver startup to clear leftovers from a crashed session.
pub fn unlink(path: &ShmPath) {
    let _ = shm::unlink(path.as_ref());
}

/// Cleanup behavior for shared memory modes.
///
/// ```text
/// Creator          Opener
///    ↓                ↓
///   Drop            Drop
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates shared memory (the driver).
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that open existing shared memory (clients).
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// A mapped POSIX shared memory region.
///
/// # Safety Invariants
///
/// - **Allocated**: `ptr` points to `len` bytes mapped via `mmap()`
/// - **Mapped**: memory remains mapped for the lifetime of the value
/// - **Aligned**: `ptr` is page aligned
pub struct ShmRegion<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide; the pointer is not thread-local.
unsafe impl<Mode: ShmMode> Send for ShmRegion<Mode> {}

// SAFETY: all access to the bytes goes through AtomicBuffer.
unsafe impl<Mode: ShmMode> Sync for ShmRegion<Mode> {}

/// Maps `len` bytes of `fd` read-write and shared.
fn map_shared(fd: &rustix::fd::OwnedFd, path: &ShmPath, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: we create a fresh mapping that doesn't alias any Rust object:
    // - FD valid: shm_open succeeded
    // - Size valid: the object holds at least `len` bytes (ftruncate/fstat)
    // - Aligned: mmap returns page-aligned addresses
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path.as_ref(), err))?;

    // SAFETY: mmap never returns null on success.
    Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
}

impl ShmRegion<Creator> {
    /// Creates new zero-filled shared memory of `len` bytes.
    ///
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources),
    /// or mapping failure. On failure the name is unlinked again.
    pub fn create(path: &ShmPath, len: usize) -> Result<Self> {
        let name = path.as_ref();
        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", name, err))?;

        if let Err(e) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(ShmError::posix("ftruncate", name, e));
        }

        let ptr = match map_shared(&fd, path, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(name);
                return Err(err);
            }
        };

        Ok(Self {
            ptr,
            len,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl ShmRegion<Opener> {
    /// Opens existing shared memory, mapping its full current size.
    ///
    /// # Errors
    ///
    /// `ENOENT` (doesn't exist), `EACCES` (permissions), or mapping failure.
    pub fn open(path: &ShmPath) -> Result<Self> {
        let name = path.as_ref();
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", name, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", name, err))?;
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        if len == 0 {
            return Err(ShmError::SizeMismatch {
                path: name.to_string(),
                expected: 1,
                actual: stat.st_size,
            });
        }

        let ptr = map_shared(&fd, path, len)?;

        Ok(Self {
            ptr,
            len,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> ShmRegion<Mode> {
    /// The shared memory name backing this region.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<Mode: ShmMode> Drop for ShmRegion<Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created in create/open.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_ref());
        }
    }
}

// SAFETY: the mapping is valid for `len` bytes, page aligned, and lives until
// drop; shared mutation is the whole point of the mapping.
unsafe impl<Mode: ShmMode + Send + Sync> MemoryRegion for ShmRegion<Mode> {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}
