//! Raw byte buffers with explicit memory ordering.
//!
//! [`AtomicBuffer`] is the primitive every control-plane structure is built
//! on: a view over a [`MemoryRegion`] (heap allocation or mapped shared
//! memory) exposing plain, acquire/release and read-modify-write accessors
//! at byte offsets.
//!
//! # Access Kinds
//!
//! | Method | Ordering | Use |
//! |--------|----------|-----|
//! | `get_*` / `put_*` | plain | fields guarded by a header word |
//! | `get_*_volatile` | `Acquire` | reading a header word / counter |
//! | `put_*_ordered` | `Release` | publishing a header word / counter |
//! | `get_and_add_i64`, `compare_and_set_i64` | `AcqRel` | claims |
//!
//! All multi-byte values are little-endian; the crate refuses to build on
//! big-endian targets so atomic and plain accesses agree on layout.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering, fence};

/// Cache line size assumed for padding shared structures.
pub const CACHE_LINE_LENGTH: usize = 64;

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Memory that can back an [`AtomicBuffer`].
///
/// # Safety
///
/// Implementers must guarantee that:
/// - `as_ptr()` is valid for reads and writes of `len()` bytes for as long as
///   the region is alive, and never changes
/// - the pointer is aligned to at least 8 bytes
/// - the memory may be mutated through shared references (no `&mut` aliasing
///   is ever handed out for it)
pub unsafe trait MemoryRegion: Send + Sync {
    /// Base address of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Length of the region in bytes.
    fn len(&self) -> usize;

    /// Returns true if the region has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zeroed, cache-line aligned heap allocation.
///
/// Used for in-process transports and tests; cross-process deployments back
/// buffers with [`ShmRegion`](crate::ipc::shmem::ShmRegion) instead.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapRegion {
    /// Allocates `len` zeroed bytes aligned to [`CACHE_LINE_LENGTH`].
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or overflows `isize`.
    #[must_use]
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "HeapRegion length must be > 0");
        let layout = Layout::from_size_align(len, CACHE_LINE_LENGTH)
            .expect("region length overflows isize");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the allocation is owned by this value and only ever accessed
// through raw pointers, so it can move between threads.
unsafe impl Send for HeapRegion {}

// SAFETY: all access goes through `AtomicBuffer`, whose concurrent protocol
// is enforced by the data structures built on it.
unsafe impl Sync for HeapRegion {}

// SAFETY: allocation is valid for `layout.size()` bytes, 64-byte aligned,
// and lives until drop.
unsafe impl MemoryRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

/// A view over `[offset, offset + capacity)` of a shared [`MemoryRegion`].
///
/// Cloning is cheap (one `Arc` increment) and yields a view of the same bytes.
/// The region stays mapped for as long as any view of it exists.
#[derive(Clone)]
pub struct AtomicBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    region: Arc<dyn MemoryRegion>,
}

// SAFETY: the backing region is Send + Sync and kept alive by the Arc.
unsafe impl Send for AtomicBuffer {}
// SAFETY: see above; concurrent access discipline is the caller's protocol.
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// Wraps an entire region.
    #[must_use]
    pub fn new(region: Arc<dyn MemoryRegion>) -> Self {
        let capacity = region.len();
        // SAFETY: MemoryRegion guarantees a valid, non-null pointer.
        let ptr = unsafe { NonNull::new_unchecked(region.as_ptr()) };
        Self {
            ptr,
            capacity,
            region,
        }
    }

    /// Allocates a zeroed heap-backed buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(HeapRegion::new(capacity)))
    }

    /// Returns a view of `len` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside this view.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        self.bounds_check(offset, len);
        Self {
            // SAFETY: offset is within the mapped range (checked above).
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            capacity: len,
            region: Arc::clone(&self.region),
        }
    }

    /// Length of this view in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn bounds_check(&self, index: usize, len: usize) {
        assert!(
            index
                .checked_add(len)
                .is_some_and(|end| end <= self.capacity),
            "index {index} + length {len} out of bounds for buffer of capacity {}",
            self.capacity
        );
    }

    #[inline]
    fn at(&self, index: usize) -> *mut u8 {
        // SAFETY: callers bounds-check before dereferencing.
        unsafe { self.ptr.as_ptr().add(index) }
    }

    #[inline]
    fn atomic_i32(&self, index: usize) -> &AtomicI32 {
        self.bounds_check(index, 4);
        let ptr = self.at(index).cast::<i32>();
        assert!(ptr.is_aligned(), "unaligned atomic i32 access at {index}");
        // SAFETY: in bounds, aligned, and the region permits shared mutation.
        unsafe { AtomicI32::from_ptr(ptr) }
    }

    #[inline]
    fn atomic_i64(&self, index: usize) -> &AtomicI64 {
        self.bounds_check(index, 8);
        let ptr = self.at(index).cast::<i64>();
        assert!(ptr.is_aligned(), "unaligned atomic i64 access at {index}");
        // SAFETY: in bounds, aligned, and the region permits shared mutation.
        unsafe { AtomicI64::from_ptr(ptr) }
    }

    #[inline]
    #[must_use]
    pub fn get_i32(&self, index: usize) -> i32 {
        self.bounds_check(index, 4);
        // SAFETY: in bounds; unaligned read is permitted.
        i32::from_le(unsafe { self.at(index).cast::<i32>().read_unaligned() })
    }

    #[inline]
    pub fn put_i32(&self, index: usize, value: i32) {
        self.bounds_check(index, 4);
        // SAFETY: in bounds; unaligned write is permitted.
        unsafe { self.at(index).cast::<i32>().write_unaligned(value.to_le()) }
    }

    #[inline]
    #[must_use]
    pub fn get_i64(&self, index: usize) -> i64 {
        self.bounds_check(index, 8);
        // SAFETY: in bounds; unaligned read is permitted.
        i64::from_le(unsafe { self.at(index).cast::<i64>().read_unaligned() })
    }

    #[inline]
    pub fn put_i64(&self, index: usize, value: i64) {
        self.bounds_check(index, 8);
        // SAFETY: in bounds; unaligned write is permitted.
        unsafe { self.at(index).cast::<i64>().write_unaligned(value.to_le()) }
    }

    /// Loads an `i32` with `Acquire` ordering.
    #[inline]
    #[must_use]
    pub fn get_i32_volatile(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Acquire)
    }

    /// Stores an `i32` with `Release` ordering.
    #[inline]
    pub fn put_i32_ordered(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Release);
    }

    /// Loads an `i64` with `Acquire` ordering.
    #[inline]
    #[must_use]
    pub fn get_i64_volatile(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::Acquire)
    }

    /// Stores an `i64` with `Release` ordering.
    #[inline]
    pub fn put_i64_ordered(&self, index: usize, value: i64) {
        self.atomic_i64(index).store(value, Ordering::Release);
    }

    /// Atomically adds `delta`, returning the previous value.
    #[inline]
    pub fn get_and_add_i64(&self, index: usize, delta: i64) -> i64 {
        self.atomic_i64(index).fetch_add(delta, Ordering::AcqRel)
    }

    /// Atomically replaces `expected` with `update`; true on success.
    #[inline]
    pub fn compare_and_set_i64(&self, index: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(index)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Copies `dst.len()` bytes starting at `index` into `dst`.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) {
        self.bounds_check(index, dst.len());
        // SAFETY: source range checked, destination is a distinct slice.
        unsafe { std::ptr::copy_nonoverlapping(self.at(index), dst.as_mut_ptr(), dst.len()) }
    }

    /// Copies `src` into this buffer starting at `index`.
    pub fn put_bytes(&self, index: usize, src: &[u8]) {
        self.bounds_check(index, src.len());
        // SAFETY: destination range checked; `src` cannot alias a region only
        // reachable through raw pointers.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.at(index), src.len()) }
    }

    /// Copies `len` bytes from another buffer view.
    pub fn put_buffer(&self, index: usize, src: &AtomicBuffer, src_index: usize, len: usize) {
        self.bounds_check(index, len);
        src.bounds_check(src_index, len);
        // SAFETY: both ranges checked; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.at(src_index), self.at(index), len) }
    }

    /// Fills `len` bytes starting at `index` with `value`.
    pub fn set_memory(&self, index: usize, len: usize, value: u8) {
        self.bounds_check(index, len);
        // SAFETY: range checked.
        unsafe { std::ptr::write_bytes(self.at(index), value, len) }
    }

    /// Copies `len` bytes into a new vector.
    #[must_use]
    pub fn get_vec(&self, index: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.get_bytes(index, &mut out);
        out
    }

    /// Writes a length-prefixed string, returning the bytes written (4 + len).
    pub fn put_string(&self, index: usize, value: &str) -> usize {
        self.put_blob(index, value.as_bytes())
    }

    /// Writes a length-prefixed byte blob, returning the bytes written.
    pub fn put_blob(&self, index: usize, value: &[u8]) -> usize {
        let len = i32::try_from(value.len()).expect("blob length exceeds i32::MAX");
        self.put_i32(index, len);
        self.put_bytes(index + 4, value);
        4 + value.len()
    }

    /// Issues an acquire fence (load barrier).
    #[inline]
    pub fn acquire_fence() {
        fence(Ordering::Acquire);
    }

    /// Issues a release fence (store barrier).
    #[inline]
    pub fn release_fence() {
        fence(Ordering::Release);
    }
}

impl fmt::Debug for AtomicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("addr", &self.ptr)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_buffer_is_zeroed() {
        let buffer = AtomicBuffer::with_capacity(128);
        assert_eq!(buffer.capacity(), 128);
        for i in (0..128).step_by(8) {
            assert_eq!(buffer.get_i64(i), 0);
        }
    }

    #[test]
    fn plain_and_ordered_accessors_agree() {
        let buffer = AtomicBuffer::with_capacity(64);
        buffer.put_i32_ordered(8, -17);
        assert_eq!(buffer.get_i32(8), -17);
        buffer.put_i64(16, 0x0102_0304_0506_0708);
        assert_eq!(buffer.get_i64_volatile(16), 0x0102_0304_0506_0708);
        assert_eq!(buffer.get_vec(16, 2), vec![0x08, 0x07]);
    }

    #[test]
    fn slice_shares_memory() {
        let buffer = AtomicBuffer::with_capacity(64);
        let tail = buffer.slice(32, 32);
        tail.put_i64(0, 99);
        assert_eq!(buffer.get_i64(32), 99);
        assert_eq!(tail.capacity(), 32);
    }

    #[test]
    fn get_and_add_and_cas() {
        let buffer = AtomicBuffer::with_capacity(64);
        assert_eq!(buffer.get_and_add_i64(0, 5), 0);
        assert_eq!(buffer.get_and_add_i64(0, 5), 5);
        assert!(buffer.compare_and_set_i64(0, 10, 42));
        assert!(!buffer.compare_and_set_i64(0, 10, 43));
        assert_eq!(buffer.get_i64(0), 42);
    }

    #[test]
    fn blob_is_length_prefixed() {
        let buffer = AtomicBuffer::with_capacity(64);
        assert_eq!(buffer.put_string(4, "abc"), 7);
        assert_eq!(buffer.get_i32(4), 3);
        assert_eq!(buffer.get_vec(8, 3), b"abc");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_panics() {
        let buffer = AtomicBuffer::with_capacity(16);
        let _ = buffer.get_i64(12);
    }

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0, 8), 0);
        assert_eq!(align(1, 8), 8);
        assert_eq!(align(8, 8), 8);
        assert_eq!(align(13, 4), 16);
    }
}
