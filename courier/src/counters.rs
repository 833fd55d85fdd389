//! Counters shared between the driver and its clients.
//!
//! Two parallel buffers describe every counter: a values buffer holding one
//! cache-line padded record per counter, and a metadata buffer holding its
//! allocation state, type id, key and label.
//!
//! # Values record (128 bytes)
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | value (i64) |
//! | 8 | registration id (i64) |
//! | 16 | owner id (i64) |
//! | 24 | reference id (i64) |
//!
//! # Metadata record (512 bytes)
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | state (i32): unused, allocated or reclaimed |
//! | 4 | type id (i32) |
//! | 8 | free-for-reuse deadline, epoch ms (i64) |
//! | 16 | key (up to 112 bytes) |
//! | 128 | label length (i32) |
//! | 132 | label (up to 380 bytes) |
//!
//! The driver owns the [`CountersManager`]; clients read through a
//! [`CountersReader`]. A freed counter id is not handed out again until its
//! reuse deadline has passed, so clients holding the old id have time to
//! notice the `ON_UNAVAILABLE_COUNTER` notification.

use std::collections::VecDeque;

use crate::buffer::{AtomicBuffer, CACHE_LINE_LENGTH};
use crate::error::{ControlError, ResourceKind, Result};

/// Length of a values record.
pub const COUNTER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

/// Length of a metadata record.
pub const METADATA_LENGTH: usize = CACHE_LINE_LENGTH * 8;

pub const REGISTRATION_ID_OFFSET: usize = 8;
pub const OWNER_ID_OFFSET: usize = 16;
pub const REFERENCE_ID_OFFSET: usize = 24;

pub const TYPE_ID_OFFSET: usize = 4;
pub const FREE_FOR_REUSE_DEADLINE_OFFSET: usize = 8;
pub const KEY_OFFSET: usize = 16;
pub const LABEL_OFFSET: usize = CACHE_LINE_LENGTH * 2;

pub const MAX_KEY_LENGTH: usize = LABEL_OFFSET - KEY_OFFSET;
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET - 4;

/// Deadline stored while a counter is allocated.
pub const NOT_FREE_TO_REUSE: i64 = i64::MAX;

pub const DEFAULT_REGISTRATION_ID: i64 = 0;
pub const DEFAULT_OWNER_ID: i64 = 0;

/// Type id for a publication's publisher limit.
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;

/// Type id for a subscriber's position in an image.
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;

/// Type id for a channel endpoint's status indicator.
pub const CHANNEL_STATUS_TYPE_ID: i32 = 7;

/// Allocation state of a counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CounterState {
    Unused = 0,
    Allocated = 1,
    Reclaimed = -1,
}

impl CounterState {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unused),
            1 => Some(Self::Allocated),
            -1 => Some(Self::Reclaimed),
            _ => None,
        }
    }
}

#[inline]
const fn metadata_offset(counter_id: i32) -> usize {
    counter_id as usize * METADATA_LENGTH
}

#[inline]
const fn counter_offset(counter_id: i32) -> usize {
    counter_id as usize * COUNTER_LENGTH
}

/// Read-only view of the counters buffers, usable from any process.
#[derive(Debug, Clone)]
pub struct CountersReader {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    max_counter_id: i32,
}

impl CountersReader {
    /// # Panics
    ///
    /// Panics if the metadata buffer cannot describe every values record.
    #[must_use]
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer) -> Self {
        let max_counters = values.capacity() / COUNTER_LENGTH;
        assert!(
            metadata.capacity() >= max_counters * METADATA_LENGTH,
            "counters metadata buffer too small: {} bytes for {max_counters} counters",
            metadata.capacity()
        );

        Self {
            metadata,
            values,
            max_counter_id: max_counters as i32 - 1,
        }
    }

    /// Highest counter id the buffers can hold.
    #[must_use]
    pub const fn max_counter_id(&self) -> i32 {
        self.max_counter_id
    }

    #[must_use]
    pub fn metadata_buffer(&self) -> &AtomicBuffer {
        &self.metadata
    }

    #[must_use]
    pub fn values_buffer(&self) -> &AtomicBuffer {
        &self.values
    }

    /// State of a counter record, or `None` for an out of range id.
    #[must_use]
    pub fn counter_state(&self, counter_id: i32) -> Option<CounterState> {
        if !self.is_valid_id(counter_id) {
            return None;
        }
        CounterState::from_raw(self.metadata.get_i32_volatile(metadata_offset(counter_id)))
    }

    #[must_use]
    pub fn counter_type_id(&self, counter_id: i32) -> i32 {
        self.check_id(counter_id);
        self.metadata
            .get_i32(metadata_offset(counter_id) + TYPE_ID_OFFSET)
    }

    #[must_use]
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        self.check_id(counter_id);
        self.values.get_i64_volatile(counter_offset(counter_id))
    }

    #[must_use]
    pub fn counter_registration_id(&self, counter_id: i32) -> i64 {
        self.check_id(counter_id);
        self.values
            .get_i64_volatile(counter_offset(counter_id) + REGISTRATION_ID_OFFSET)
    }

    #[must_use]
    pub fn counter_owner_id(&self, counter_id: i32) -> i64 {
        self.check_id(counter_id);
        self.values
            .get_i64_volatile(counter_offset(counter_id) + OWNER_ID_OFFSET)
    }

    #[must_use]
    pub fn counter_reference_id(&self, counter_id: i32) -> i64 {
        self.check_id(counter_id);
        self.values
            .get_i64_volatile(counter_offset(counter_id) + REFERENCE_ID_OFFSET)
    }

    #[must_use]
    pub fn free_for_reuse_deadline(&self, counter_id: i32) -> i64 {
        self.check_id(counter_id);
        self.metadata
            .get_i64_volatile(metadata_offset(counter_id) + FREE_FOR_REUSE_DEADLINE_OFFSET)
    }

    /// Copy of the counter's key bytes (always [`MAX_KEY_LENGTH`] long).
    #[must_use]
    pub fn counter_key(&self, counter_id: i32) -> Vec<u8> {
        self.check_id(counter_id);
        self.metadata
            .get_vec(metadata_offset(counter_id) + KEY_OFFSET, MAX_KEY_LENGTH)
    }

    #[must_use]
    pub fn counter_label(&self, counter_id: i32) -> String {
        self.check_id(counter_id);
        let offset = metadata_offset(counter_id) + LABEL_OFFSET;
        let length = usize::try_from(self.metadata.get_i32(offset))
            .unwrap_or(0)
            .min(MAX_LABEL_LENGTH);
        String::from_utf8_lossy(&self.metadata.get_vec(offset + 4, length)).into_owned()
    }

    /// Calls `f(counter_id, type_id, label)` for each allocated counter.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(i32, i32, &str),
    {
        for counter_id in 0..=self.max_counter_id {
            match self.counter_state(counter_id) {
                Some(CounterState::Allocated) => {
                    f(counter_id, self.counter_type_id(counter_id), &self.counter_label(counter_id));
                }
                Some(CounterState::Unused) => break,
                _ => {}
            }
        }
    }

    #[inline]
    fn is_valid_id(&self, counter_id: i32) -> bool {
        (0..=self.max_counter_id).contains(&counter_id)
    }

    fn check_id(&self, counter_id: i32) {
        assert!(
            self.is_valid_id(counter_id),
            "counter id {counter_id} out of range 0..={}",
            self.max_counter_id
        );
    }
}

/// Driver-side allocator for counters.
#[derive(Debug)]
pub struct CountersManager {
    reader: CountersReader,
    free_to_reuse_timeout_ms: i64,
    high_water_mark: i32,
    reclaimed: Vec<i32>,
    reusable: VecDeque<i32>,
}

impl CountersManager {
    #[must_use]
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer, free_to_reuse_timeout_ms: i64) -> Self {
        Self {
            reader: CountersReader::new(metadata, values),
            free_to_reuse_timeout_ms,
            high_water_mark: -1,
            reclaimed: Vec::new(),
            reusable: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn reader(&self) -> &CountersReader {
        &self.reader
    }

    /// Allocates a counter and returns its id.
    ///
    /// Labels longer than [`MAX_LABEL_LENGTH`] bytes are truncated.
    ///
    /// # Errors
    ///
    /// [`ControlError::MalformedCommand`] for a key longer than
    /// [`MAX_KEY_LENGTH`]; [`ControlError::BufferFull`] when no id is free.
    pub fn allocate(&mut self, now_ms: i64, type_id: i32, key: &[u8], label: &str) -> Result<i32> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ControlError::malformed(format!(
                "counter key length {} exceeds max {MAX_KEY_LENGTH}",
                key.len()
            )));
        }

        let counter_id = self.next_counter_id(now_ms)?;
        let metadata = &self.reader.metadata;
        let record = metadata_offset(counter_id);

        metadata.put_i32(record + TYPE_ID_OFFSET, type_id);
        metadata.put_i64(record + FREE_FOR_REUSE_DEADLINE_OFFSET, NOT_FREE_TO_REUSE);
        metadata.set_memory(record + KEY_OFFSET, MAX_KEY_LENGTH, 0);
        metadata.put_bytes(record + KEY_OFFSET, key);

        let label = truncate_utf8(label, MAX_LABEL_LENGTH);
        metadata.put_i32(record + LABEL_OFFSET, label.len() as i32);
        metadata.put_bytes(record + LABEL_OFFSET + 4, label.as_bytes());

        metadata.put_i32_ordered(record, CounterState::Allocated as i32);

        Ok(counter_id)
    }

    /// Releases a counter. Its id becomes reusable once the free-to-reuse
    /// timeout has elapsed.
    ///
    /// # Errors
    ///
    /// [`ControlError::ResourceNotFound`] if the counter is not allocated.
    pub fn free(&mut self, now_ms: i64, counter_id: i32) -> Result<()> {
        if self.reader.counter_state(counter_id) != Some(CounterState::Allocated) {
            return Err(ControlError::ResourceNotFound {
                kind: ResourceKind::Counter,
                registration_id: i64::from(counter_id),
            });
        }

        let metadata = &self.reader.metadata;
        let record = metadata_offset(counter_id);
        metadata.put_i32_ordered(record, CounterState::Reclaimed as i32);
        metadata.set_memory(record + KEY_OFFSET, MAX_KEY_LENGTH, 0);
        metadata.put_i64_ordered(
            record + FREE_FOR_REUSE_DEADLINE_OFFSET,
            now_ms.saturating_add(self.free_to_reuse_timeout_ms),
        );
        self.reclaimed.push(counter_id);

        Ok(())
    }

    /// Moves reclaimed counters whose deadline has passed back to the pool.
    ///
    /// Returns the number of ids made reusable.
    pub fn reclaim_expired(&mut self, now_ms: i64) -> usize {
        let before = self.reusable.len();
        let reader = &self.reader;
        let reusable = &mut self.reusable;

        self.reclaimed.retain(|&counter_id| {
            if now_ms < reader.free_for_reuse_deadline(counter_id) {
                return true;
            }
            let values = &reader.values;
            let offset = counter_offset(counter_id);
            values.put_i64_ordered(offset, 0);
            values.put_i64_ordered(offset + REGISTRATION_ID_OFFSET, DEFAULT_REGISTRATION_ID);
            values.put_i64_ordered(offset + OWNER_ID_OFFSET, DEFAULT_OWNER_ID);
            values.put_i64_ordered(offset + REFERENCE_ID_OFFSET, 0);
            reusable.push_back(counter_id);
            false
        });

        self.reusable.len() - before
    }

    pub fn set_counter_value(&self, counter_id: i32, value: i64) {
        self.reader.check_id(counter_id);
        self.reader
            .values
            .put_i64_ordered(counter_offset(counter_id), value);
    }

    pub fn set_counter_registration_id(&self, counter_id: i32, registration_id: i64) {
        self.reader.check_id(counter_id);
        self.reader.values.put_i64_ordered(
            counter_offset(counter_id) + REGISTRATION_ID_OFFSET,
            registration_id,
        );
    }

    pub fn set_counter_owner_id(&self, counter_id: i32, owner_id: i64) {
        self.reader.check_id(counter_id);
        self.reader
            .values
            .put_i64_ordered(counter_offset(counter_id) + OWNER_ID_OFFSET, owner_id);
    }

    pub fn set_counter_reference_id(&self, counter_id: i32, reference_id: i64) {
        self.reader.check_id(counter_id);
        self.reader.values.put_i64_ordered(
            counter_offset(counter_id) + REFERENCE_ID_OFFSET,
            reference_id,
        );
    }

    fn next_counter_id(&mut self, now_ms: i64) -> Result<i32> {
        self.reclaim_expired(now_ms);
        if let Some(counter_id) = self.reusable.pop_front() {
            return Ok(counter_id);
        }

        if self.high_water_mark >= self.reader.max_counter_id {
            return Err(ControlError::BufferFull);
        }
        self.high_water_mark += 1;
        Ok(self.high_water_mark)
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_COUNTERS: usize = 4;

    fn create_manager(reuse_timeout_ms: i64) -> CountersManager {
        CountersManager::new(
            AtomicBuffer::with_capacity(MAX_COUNTERS * METADATA_LENGTH),
            AtomicBuffer::with_capacity(MAX_COUNTERS * COUNTER_LENGTH),
            reuse_timeout_ms,
        )
    }

    #[test]
    fn test_allocate_records_metadata() {
        let mut manager = create_manager(1000);
        let id = manager
            .allocate(0, 102, &42i64.to_le_bytes(), "counter label")
            .unwrap();
        manager.set_counter_registration_id(id, 77);
        manager.set_counter_owner_id(id, 5);
        manager.set_counter_value(id, 9);

        let reader = manager.reader();
        assert_eq!(id, 0);
        assert_eq!(reader.counter_state(id), Some(CounterState::Allocated));
        assert_eq!(reader.counter_type_id(id), 102);
        assert_eq!(reader.counter_label(id), "counter label");
        assert_eq!(&reader.counter_key(id)[..8], &42i64.to_le_bytes());
        assert_eq!(reader.counter_registration_id(id), 77);
        assert_eq!(reader.counter_owner_id(id), 5);
        assert_eq!(reader.counter_value(id), 9);
        assert_eq!(reader.free_for_reuse_deadline(id), NOT_FREE_TO_REUSE);
    }

    #[test]
    fn test_ids_are_sequential_until_full() {
        let mut manager = create_manager(1000);
        for expected in 0..MAX_COUNTERS as i32 {
            assert_eq!(manager.allocate(0, 1, &[], "c").unwrap(), expected);
        }
        assert!(matches!(
            manager.allocate(0, 1, &[], "c"),
            Err(ControlError::BufferFull)
        ));
    }

    #[test]
    fn test_freed_id_not_reused_before_deadline() {
        let mut manager = create_manager(1000);
        let first = manager.allocate(0, 1, &[], "a").unwrap();
        manager.free(100, first).unwrap();
        assert_eq!(manager.reader().counter_state(first), Some(CounterState::Reclaimed));
        assert_eq!(manager.reader().free_for_reuse_deadline(first), 1100);

        assert_eq!(manager.allocate(500, 1, &[], "b").unwrap(), 1);
        assert_eq!(manager.allocate(1100, 1, &[], "c").unwrap(), first);
        assert_eq!(manager.reader().counter_label(first), "c");
    }

    #[test]
    fn test_reclaim_resets_values() {
        let mut manager = create_manager(10);
        let id = manager.allocate(0, 1, &[], "a").unwrap();
        manager.set_counter_value(id, 123);
        manager.set_counter_owner_id(id, 9);
        manager.free(0, id).unwrap();

        assert_eq!(manager.reclaim_expired(5), 0);
        assert_eq!(manager.reclaim_expired(10), 1);
        assert_eq!(manager.reader().counter_value(id), 0);
        assert_eq!(manager.reader().counter_owner_id(id), DEFAULT_OWNER_ID);
    }

    #[test]
    fn test_free_unallocated_fails() {
        let mut manager = create_manager(10);
        assert!(matches!(
            manager.free(0, 2),
            Err(ControlError::ResourceNotFound {
                kind: ResourceKind::Counter,
                ..
            })
        ));
        let id = manager.allocate(0, 1, &[], "a").unwrap();
        manager.free(0, id).unwrap();
        assert!(manager.free(0, id).is_err());
    }

    #[test]
    fn test_key_too_long_and_label_truncated() {
        let mut manager = create_manager(10);
        assert!(manager.allocate(0, 1, &[0; MAX_KEY_LENGTH + 1], "x").is_err());

        let long = "é".repeat(MAX_LABEL_LENGTH);
        let id = manager.allocate(0, 1, &[], &long).unwrap();
        let label = manager.reader().counter_label(id);
        assert!(label.len() <= MAX_LABEL_LENGTH);
        assert!(label.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_for_each_visits_allocated() {
        let mut manager = create_manager(10);
        let a = manager.allocate(0, 1, &[], "a").unwrap();
        let b = manager.allocate(0, 2, &[], "b").unwrap();
        manager.allocate(0, 3, &[], "c").unwrap();
        manager.free(0, b).unwrap();

        let mut seen = Vec::new();
        manager
            .reader()
            .for_each(|id, type_id, label| seen.push((id, type_id, label.to_string())));
        assert_eq!(seen, vec![(a, 1, "a".to_string()), (2, 3, "c".to_string())]);
    }
}
