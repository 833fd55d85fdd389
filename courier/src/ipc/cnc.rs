//! Command-and-control ("CnC") region layout.
//!
//! One shared memory object carries everything a client needs to talk to the
//! driver:
//!
//! ```text
//! +-----------------------------+  0
//! | metadata (128 bytes)        |
//! +-----------------------------+  128
//! | to-driver ring + trailer    |
//! +-----------------------------+
//! | to-clients broadcast        |
//! | + trailer                   |
//! +-----------------------------+
//! | counters metadata           |
//! +-----------------------------+
//! | counters values             |
//! +-----------------------------+
//! ```
//!
//! # Metadata
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | layout version (i32), written last |
//! | 4 | to-driver buffer length (i32) |
//! | 8 | to-clients buffer length (i32) |
//! | 12 | counters metadata length (i32) |
//! | 16 | counters values length (i32) |
//! | 24 | client liveness timeout, ns (i64) |
//! | 32 | driver start timestamp, epoch ms (i64) |
//! | 40 | driver pid (i64) |
//!
//! A non-zero version is the creator's initialization marker: openers spin on
//! it before reading anything else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcast;
use crate::buffer::{AtomicBuffer, CACHE_LINE_LENGTH, MemoryRegion};
use crate::counters::{COUNTER_LENGTH, METADATA_LENGTH};
use crate::ipc::shmem::{Creator, Opener, Result, ShmError, ShmPath, ShmRegion};
use crate::mpsc::{self, ManyToOneRingBuffer};

/// Layout version. Bump on any incompatible change.
pub const CNC_VERSION: i32 = 0x0001_0000;

pub const VERSION_OFFSET: usize = 0;
pub const TO_DRIVER_LENGTH_OFFSET: usize = 4;
pub const TO_CLIENTS_LENGTH_OFFSET: usize = 8;
pub const COUNTERS_METADATA_LENGTH_OFFSET: usize = 12;
pub const COUNTERS_VALUES_LENGTH_OFFSET: usize = 16;
pub const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 24;
pub const START_TIMESTAMP_OFFSET: usize = 32;
pub const PID_OFFSET: usize = 40;

pub const META_DATA_LENGTH: usize = CACHE_LINE_LENGTH * 2;

/// How long [`open`] waits for the creator to publish the version.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Sizes of the four sections following the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CncLayout {
    pub to_driver_length: usize,
    pub to_clients_length: usize,
    pub counters_metadata_length: usize,
    pub counters_values_length: usize,
}

impl CncLayout {
    /// Layout for the given data capacities. Trailers are added here and the
    /// counters metadata section is sized to describe every values record.
    #[must_use]
    pub const fn new(
        to_driver_capacity: usize,
        to_clients_capacity: usize,
        counters_values_length: usize,
    ) -> Self {
        Self {
            to_driver_length: to_driver_capacity + mpsc::TRAILER_LENGTH,
            to_clients_length: to_clients_capacity + broadcast::TRAILER_LENGTH,
            counters_metadata_length: counters_values_length / COUNTER_LENGTH * METADATA_LENGTH,
            counters_values_length,
        }
    }

    #[must_use]
    pub const fn to_driver_offset(&self) -> usize {
        META_DATA_LENGTH
    }

    #[must_use]
    pub const fn to_clients_offset(&self) -> usize {
        self.to_driver_offset() + self.to_driver_length
    }

    #[must_use]
    pub const fn counters_metadata_offset(&self) -> usize {
        self.to_clients_offset() + self.to_clients_length
    }

    #[must_use]
    pub const fn counters_values_offset(&self) -> usize {
        self.counters_metadata_offset() + self.counters_metadata_length
    }

    #[must_use]
    pub const fn total_length(&self) -> usize {
        self.counters_values_offset() + self.counters_values_length
    }

    fn read_from(buffer: &AtomicBuffer) -> Self {
        let length = |offset| usize::try_from(buffer.get_i32(offset)).unwrap_or(0);
        Self {
            to_driver_length: length(TO_DRIVER_LENGTH_OFFSET),
            to_clients_length: length(TO_CLIENTS_LENGTH_OFFSET),
            counters_metadata_length: length(COUNTERS_METADATA_LENGTH_OFFSET),
            counters_values_length: length(COUNTERS_VALUES_LENGTH_OFFSET),
        }
    }
}

/// Driver identity written into the metadata section at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CncMetadata {
    pub client_liveness_timeout_ns: i64,
    pub start_timestamp_ms: i64,
    pub pid: i64,
}

/// Views over the sections of one CnC region.
#[derive(Debug, Clone)]
pub struct CncBuffers {
    cnc: AtomicBuffer,
    layout: CncLayout,
    to_driver: AtomicBuffer,
    to_clients: AtomicBuffer,
    counters_metadata: AtomicBuffer,
    counters_values: AtomicBuffer,
}

impl CncBuffers {
    fn new(cnc: AtomicBuffer, layout: CncLayout) -> Self {
        Self {
            to_driver: cnc.slice(layout.to_driver_offset(), layout.to_driver_length),
            to_clients: cnc.slice(layout.to_clients_offset(), layout.to_clients_length),
            counters_metadata: cnc.slice(
                layout.counters_metadata_offset(),
                layout.counters_metadata_length,
            ),
            counters_values: cnc.slice(
                layout.counters_values_offset(),
                layout.counters_values_length,
            ),
            layout,
            cnc,
        }
    }

    /// Initializes `cnc` with `layout` and `metadata`, publishing the version
    /// last.
    ///
    /// # Panics
    ///
    /// Panics if `cnc` is smaller than the layout or a section length does
    /// not fit the i32 metadata fields.
    fn initialize(cnc: AtomicBuffer, layout: CncLayout, metadata: CncMetadata) -> Self {
        assert!(
            cnc.capacity() >= layout.total_length(),
            "CnC buffer of {} bytes cannot hold layout of {} bytes",
            cnc.capacity(),
            layout.total_length()
        );
        let field = |len: usize| i32::try_from(len).expect("CnC section length exceeds i32");

        cnc.put_i32(TO_DRIVER_LENGTH_OFFSET, field(layout.to_driver_length));
        cnc.put_i32(TO_CLIENTS_LENGTH_OFFSET, field(layout.to_clients_length));
        cnc.put_i32(
            COUNTERS_METADATA_LENGTH_OFFSET,
            field(layout.counters_metadata_length),
        );
        cnc.put_i32(
            COUNTERS_VALUES_LENGTH_OFFSET,
            field(layout.counters_values_length),
        );
        cnc.put_i64(
            CLIENT_LIVENESS_TIMEOUT_OFFSET,
            metadata.client_liveness_timeout_ns,
        );
        cnc.put_i64(START_TIMESTAMP_OFFSET, metadata.start_timestamp_ms);
        cnc.put_i64(PID_OFFSET, metadata.pid);
        cnc.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);

        Self::new(cnc, layout)
    }

    /// Private, heap-backed CnC region for in-process drivers and tests.
    #[must_use]
    pub fn heap(layout: CncLayout, metadata: CncMetadata) -> Self {
        Self::initialize(
            AtomicBuffer::with_capacity(layout.total_length()),
            layout,
            metadata,
        )
    }

    /// Attaches to an already initialized region held in `cnc`.
    ///
    /// # Errors
    ///
    /// [`ShmError::VersionMismatch`] or [`ShmError::SizeMismatch`] when the
    /// region does not hold a compatible layout.
    pub fn attach(cnc: AtomicBuffer, name: &str) -> Result<Self> {
        let version = cnc.get_i32_volatile(VERSION_OFFSET);
        if version != CNC_VERSION {
            return Err(ShmError::VersionMismatch {
                path: name.to_string(),
                expected: CNC_VERSION,
                actual: version,
            });
        }

        let layout = CncLayout::read_from(&cnc);
        if layout.total_length() > cnc.capacity() {
            return Err(ShmError::SizeMismatch {
                path: name.to_string(),
                expected: layout.total_length(),
                actual: cnc.capacity() as i64,
            });
        }

        Ok(Self::new(cnc, layout))
    }

    #[must_use]
    pub const fn layout(&self) -> &CncLayout {
        &self.layout
    }

    #[must_use]
    pub fn to_driver_buffer(&self) -> &AtomicBuffer {
        &self.to_driver
    }

    #[must_use]
    pub fn to_clients_buffer(&self) -> &AtomicBuffer {
        &self.to_clients
    }

    #[must_use]
    pub fn counters_metadata_buffer(&self) -> &AtomicBuffer {
        &self.counters_metadata
    }

    #[must_use]
    pub fn counters_values_buffer(&self) -> &AtomicBuffer {
        &self.counters_values
    }

    #[must_use]
    pub fn metadata(&self) -> CncMetadata {
        CncMetadata {
            client_liveness_timeout_ns: self.cnc.get_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET),
            start_timestamp_ms: self.cnc.get_i64(START_TIMESTAMP_OFFSET),
            pid: self.cnc.get_i64(PID_OFFSET),
        }
    }

    /// Epoch ms of the driver conductor's last duty cycle.
    #[must_use]
    pub fn driver_heartbeat_ms(&self) -> i64 {
        ManyToOneRingBuffer::new(self.to_driver.clone()).consumer_heartbeat_time()
    }

    /// True if the driver heartbeat is no older than the client liveness
    /// timeout at `now_ms`.
    #[must_use]
    pub fn is_driver_active(&self, now_ms: i64) -> bool {
        let timeout_ms = self.metadata().client_liveness_timeout_ns / 1_000_000;
        now_ms - self.driver_heartbeat_ms() <= timeout_ms
    }
}

/// Creates and initializes a CnC shared memory object at `path`.
///
/// The object is unlinked when the last buffer referencing it is dropped.
///
/// # Errors
///
/// Any [`ShmError`] from creating the region, including `EEXIST` when the
/// name is taken.
pub fn create(path: &ShmPath, layout: CncLayout, metadata: CncMetadata) -> Result<CncBuffers> {
    let region = ShmRegion::<Creator>::create(path, layout.total_length())?;
    let cnc = AtomicBuffer::new(Arc::new(region));
    Ok(CncBuffers::initialize(cnc, layout, metadata))
}

/// Opens the CnC object at `path`, waiting up to `timeout` for its creator
/// to finish initializing it.
///
/// # Errors
///
/// [`ShmError::InitTimeout`] if the version never appears; otherwise as for
/// [`ShmRegion::open`] and [`CncBuffers::attach`].
pub fn open(path: &ShmPath, timeout: Duration) -> Result<CncBuffers> {
    let start = Instant::now();
    loop {
        match ShmRegion::<Opener>::open(path) {
            Ok(region) if region.len() >= META_DATA_LENGTH => {
                let cnc = AtomicBuffer::new(Arc::new(region));
                if cnc.get_i32_volatile(VERSION_OFFSET) != 0 {
                    return CncBuffers::attach(cnc, path.as_ref());
                }
            }
            Ok(_) | Err(ShmError::SizeMismatch { .. }) => {}
            Err(err) => return Err(err),
        }

        if start.elapsed() >= timeout {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            });
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::shmem::unlink;

    const METADATA: CncMetadata = CncMetadata {
        client_liveness_timeout_ns: 10_000_000_000,
        start_timestamp_ms: 1_700_000_000_000,
        pid: 42,
    };

    #[test]
    fn test_layout_offsets() {
        let layout = CncLayout::new(1024, 2048, 4 * COUNTER_LENGTH);
        assert_eq!(layout.to_driver_offset(), 128);
        assert_eq!(layout.to_driver_length, 1024 + mpsc::TRAILER_LENGTH);
        assert_eq!(layout.to_clients_offset(), 128 + 1024 + mpsc::TRAILER_LENGTH);
        assert_eq!(layout.counters_metadata_length, 4 * METADATA_LENGTH);
        assert_eq!(
            layout.total_length(),
            128 + 1024
                + mpsc::TRAILER_LENGTH
                + 2048
                + broadcast::TRAILER_LENGTH
                + 4 * METADATA_LENGTH
                + 4 * COUNTER_LENGTH
        );
    }

    #[test]
    fn test_heap_round_trip() {
        let layout = CncLayout::new(1024, 1024, 2 * COUNTER_LENGTH);
        let buffers = CncBuffers::heap(layout, METADATA);
        assert_eq!(buffers.metadata(), METADATA);
        assert_eq!(buffers.to_driver_buffer().capacity(), layout.to_driver_length);
        assert_eq!(buffers.counters_values_buffer().capacity(), 2 * COUNTER_LENGTH);

        let reattached = CncBuffers::attach(buffers.cnc.clone(), "heap").unwrap();
        assert_eq!(*reattached.layout(), layout);
    }

    #[test]
    fn test_attach_rejects_uninitialized() {
        let cnc = AtomicBuffer::with_capacity(4096);
        assert!(matches!(
            CncBuffers::attach(cnc, "blank"),
            Err(ShmError::VersionMismatch { actual: 0, .. })
        ));
    }

    #[test]
    fn test_driver_activity_follows_heartbeat() {
        let buffers = CncBuffers::heap(CncLayout::new(1024, 1024, COUNTER_LENGTH), METADATA);
        ManyToOneRingBuffer::new(buffers.to_driver_buffer().clone())
            .set_consumer_heartbeat_time(50_000);

        assert!(buffers.is_driver_active(55_000));
        assert!(!buffers.is_driver_active(50_000 + 10_001));
    }

    #[test]
    fn test_shm_create_then_open() -> Result<()> {
        let path = ShmPath::new(format!("/courier-cnc-test-{}", std::process::id()))?;
        unlink(&path);

        let layout = CncLayout::new(1024, 1024, 2 * COUNTER_LENGTH);
        let created = match create(&path, layout, METADATA) {
            Ok(buffers) => buffers,
            Err(err) if err.is_access_denied() => {
                eprintln!("Skipping test_shm_create_then_open: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let opened = open(&path, INIT_TIMEOUT)?;
        assert_eq!(*opened.layout(), layout);
        assert_eq!(opened.metadata().pid, 42);

        opened.to_driver_buffer().put_i64_ordered(0, 7);
        assert_eq!(created.to_driver_buffer().get_i64_volatile(0), 7);
        Ok(())
    }

    #[test]
    fn test_open_missing_fails_fast() {
        let path = ShmPath::new(format!("/courier-cnc-missing-{}", std::process::id())).unwrap();
        unlink(&path);
        assert!(matches!(
            open(&path, Duration::from_millis(10)),
            Err(ShmError::PosixError { .. })
        ));
    }
}
