//! Record ring buffer algorithm over an [`AtomicBuffer`].
//!
//! # Algorithm
//!
//! - Producers read the tail, check capacity against a cached head, and
//!   reserve `aligned(length)` bytes with a CAS on the tail
//! - A record that would straddle the end of the buffer is preceded by a
//!   padding record filling the remainder, and starts at index 0
//! - The header is first written with a negative length; the final
//!   release-store of the positive length publishes the record
//! - The consumer scans forward from the head with acquire loads, stops at
//!   the first non-positive length, zeroes what it consumed and then
//!   release-stores the new head
//!
//! # Safety
//!
//! Producers are lock-free. Exactly one consumer may call [`read`].
//!
//! [`read`]: ManyToOneRingBuffer::read

use super::{
    ALIGNMENT, CONSUMER_HEARTBEAT_OFFSET, CORRELATION_COUNTER_OFFSET, HEADER_LENGTH,
    HEAD_CACHE_POSITION_OFFSET, HEAD_POSITION_OFFSET, PADDING_MSG_TYPE_ID,
    TAIL_POSITION_OFFSET, TRAILER_LENGTH, length_offset, make_header, type_offset,
};
use crate::buffer::{AtomicBuffer, align};
use crate::error::{ControlError, Result};

/// Many-producer, single-consumer ring of variable-length typed records.
#[derive(Debug, Clone)]
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_id_counter_index: usize,
    consumer_heartbeat_index: usize,
}

impl ManyToOneRingBuffer {
    /// Wraps `buffer`, whose last [`TRAILER_LENGTH`] bytes hold the trailer.
    ///
    /// # Panics
    ///
    /// Panics if the data region is not a power of two.
    #[must_use]
    pub fn new(buffer: AtomicBuffer) -> Self {
        let capacity = buffer.capacity().saturating_sub(TRAILER_LENGTH);
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two plus {TRAILER_LENGTH} trailer bytes, got {}",
            buffer.capacity()
        );

        Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
            tail_position_index: capacity + TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + HEAD_POSITION_OFFSET,
            correlation_id_counter_index: capacity + CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + CONSUMER_HEARTBEAT_OFFSET,
        }
    }

    /// Capacity of the data region in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single record may carry.
    #[inline]
    #[must_use]
    pub const fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// The underlying buffer, trailer included.
    #[must_use]
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Writes a complete record.
    ///
    /// # Errors
    ///
    /// [`ControlError::BufferFull`] when there is no room;
    /// [`ControlError::MalformedCommand`] for an invalid type id or oversize
    /// payload.
    pub fn write(&self, msg_type_id: i32, src: &[u8]) -> Result<()> {
        self.check_msg_type_id(msg_type_id)?;
        self.check_msg_length(src.len())?;

        let record_length = src.len() + HEADER_LENGTH;
        let required = align(record_length, ALIGNMENT);
        let record_index = self.claim_capacity(required)?;

        self.buffer.put_i64_ordered(
            record_index,
            make_header(-(record_length as i32), msg_type_id),
        );
        self.buffer.put_bytes(record_index + HEADER_LENGTH, src);
        self.buffer
            .put_i32_ordered(length_offset(record_index), record_length as i32);

        Ok(())
    }

    /// Reserves space for a record of `length` payload bytes and returns the
    /// buffer index at which the payload should be written.
    ///
    /// The claim must be completed with [`commit`](Self::commit) or
    /// [`abort`](Self::abort); until then the consumer cannot pass it.
    ///
    /// # Errors
    ///
    /// As for [`write`](Self::write).
    pub fn try_claim(&self, msg_type_id: i32, length: usize) -> Result<usize> {
        self.check_msg_type_id(msg_type_id)?;
        self.check_msg_length(length)?;

        let record_length = length + HEADER_LENGTH;
        let required = align(record_length, ALIGNMENT);
        let record_index = self.claim_capacity(required)?;

        self.buffer.put_i64_ordered(
            record_index,
            make_header(-(record_length as i32), msg_type_id),
        );

        Ok(record_index + HEADER_LENGTH)
    }

    /// Publishes a record previously reserved by [`try_claim`](Self::try_claim).
    ///
    /// # Panics
    ///
    /// Panics if `index` does not refer to an uncommitted claim.
    pub fn commit(&self, index: usize) {
        let record_index = self.claimed_record_index(index);
        let record_length = self.buffer.get_i32(length_offset(record_index));
        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);
    }

    /// Turns a claimed record into padding so the consumer skips it.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not refer to an uncommitted claim.
    pub fn abort(&self, index: usize) {
        let record_index = self.claimed_record_index(index);
        let record_length = self.buffer.get_i32(length_offset(record_index));
        self.buffer
            .put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);
    }

    /// Drains up to `message_count_limit` records, calling
    /// `handler(msg_type_id, buffer, payload_index, payload_length)` for each.
    ///
    /// Returns the number of records delivered. Stops at the end of the
    /// buffer; a wrapped remainder is read on the next call.
    ///
    /// # Panics
    ///
    /// Panics if a record header is corrupt (length beyond the buffer).
    pub fn read<F>(&self, mut handler: F, message_count_limit: usize) -> usize
    where
        F: FnMut(i32, &AtomicBuffer, usize, usize),
    {
        let head = self.buffer.get_i64(self.head_position_index);
        let head_index = self.index_of(head);
        let contiguous_block_length = self.capacity - head_index;
        let mut messages_read = 0;
        let mut bytes_read = 0;

        while bytes_read < contiguous_block_length && messages_read < message_count_limit {
            let record_index = head_index + bytes_read;
            let record_length = self.buffer.get_i32_volatile(length_offset(record_index));
            if record_length <= 0 {
                break;
            }

            let record_length = record_length as usize;
            assert!(
                record_length <= contiguous_block_length - bytes_read,
                "corrupt ring record at {record_index}: length {record_length} exceeds capacity"
            );

            bytes_read += align(record_length, ALIGNMENT);

            let msg_type_id = self.buffer.get_i32(type_offset(record_index));
            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            handler(
                msg_type_id,
                &self.buffer,
                record_index + HEADER_LENGTH,
                record_length - HEADER_LENGTH,
            );
        }

        if bytes_read != 0 {
            self.buffer.set_memory(head_index, bytes_read, 0);
            self.buffer
                .put_i64_ordered(self.head_position_index, head + bytes_read as i64);
        }

        messages_read
    }

    /// Unblocks a record that a producer claimed but never completed.
    ///
    /// Returns true if a stalled region at the consumer position was turned
    /// into padding.
    pub fn unblock(&self) -> bool {
        let head = self.buffer.get_i64_volatile(self.head_position_index);
        let tail = self.buffer.get_i64_volatile(self.tail_position_index);
        if head == tail {
            return false;
        }

        // Indices coincide when the ring is exactly full, so only positions
        // tell empty from full.
        let consumer_index = self.index_of(head);
        let producer_index = self.index_of(tail);

        let length = self.buffer.get_i32_volatile(length_offset(consumer_index));
        if length < 0 {
            self.buffer
                .put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
            self.buffer
                .put_i32_ordered(length_offset(consumer_index), -length);
            return true;
        }

        if length == 0 {
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };

            let mut i = consumer_index + ALIGNMENT;
            while i < limit {
                if self.buffer.get_i32_volatile(i) != 0 {
                    if self.scan_back_to_confirm_still_zeroed(i, consumer_index) {
                        self.buffer
                            .put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
                        self.buffer.put_i32_ordered(
                            length_offset(consumer_index),
                            (i - consumer_index) as i32,
                        );
                        return true;
                    }
                    return false;
                }
                i += ALIGNMENT;
            }
        }

        false
    }

    /// Atomically returns the next correlation id, shared by all producers.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer
            .get_and_add_i64(self.correlation_id_counter_index, 1)
    }

    /// Last time (epoch ms) the consumer reported itself alive.
    #[must_use]
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.consumer_heartbeat_index)
    }

    pub fn set_consumer_heartbeat_time(&self, time: i64) {
        self.buffer
            .put_i64_ordered(self.consumer_heartbeat_index, time);
    }

    /// Total bytes the consumer has read.
    #[must_use]
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position_index)
    }

    /// Total bytes producers have claimed.
    #[must_use]
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position_index)
    }

    /// Bytes currently claimed but not yet consumed.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut head_after = self.buffer.get_i64_volatile(self.head_position_index);
        loop {
            let head_before = head_after;
            let tail = self.buffer.get_i64_volatile(self.tail_position_index);
            head_after = self.buffer.get_i64_volatile(self.head_position_index);
            if head_after == head_before {
                let size = (tail - head_after).max(0) as usize;
                return size.min(self.capacity);
            }
        }
    }

    fn claim_capacity(&self, required: usize) -> Result<usize> {
        let capacity = self.capacity as i64;
        let required_i64 = required as i64;
        let mut head = self.buffer.get_i64_volatile(self.head_cache_position_index);

        loop {
            let tail = self.buffer.get_i64_volatile(self.tail_position_index);
            let available = capacity - (tail - head);

            if required_i64 > available {
                head = self.buffer.get_i64_volatile(self.head_position_index);
                if required_i64 > capacity - (tail - head) {
                    return Err(ControlError::BufferFull);
                }
                self.buffer
                    .put_i64_ordered(self.head_cache_position_index, head);
            }

            let mut padding = 0;
            let tail_index = self.index_of(tail);
            let to_buffer_end_length = self.capacity - tail_index;

            if required > to_buffer_end_length {
                let mut head_index = self.index_of(head);
                if required > head_index {
                    head = self.buffer.get_i64_volatile(self.head_position_index);
                    head_index = self.index_of(head);
                    if required > head_index {
                        return Err(ControlError::BufferFull);
                    }
                    self.buffer
                        .put_i64_ordered(self.head_cache_position_index, head);
                }
                padding = to_buffer_end_length;
            }

            let next_tail = tail + required_i64 + padding as i64;
            if self
                .buffer
                .compare_and_set_i64(self.tail_position_index, tail, next_tail)
            {
                if padding != 0 {
                    self.buffer.put_i64_ordered(
                        tail_index,
                        make_header(padding as i32, PADDING_MSG_TYPE_ID),
                    );
                    return Ok(0);
                }
                return Ok(tail_index);
            }
        }
    }

    fn scan_back_to_confirm_still_zeroed(&self, from: usize, limit: usize) -> bool {
        let mut i = from;
        while i > limit {
            i -= ALIGNMENT;
            if self.buffer.get_i32_volatile(i) != 0 {
                return false;
            }
        }
        true
    }

    fn claimed_record_index(&self, index: usize) -> usize {
        assert!(
            index >= HEADER_LENGTH && index <= self.capacity,
            "claim index {index} outside ring of capacity {}",
            self.capacity
        );
        let record_index = index - HEADER_LENGTH;
        assert!(
            self.buffer.get_i32(length_offset(record_index)) < 0,
            "claim at {index} already committed or aborted"
        );
        record_index
    }

    #[inline]
    fn index_of(&self, position: i64) -> usize {
        (position as usize) & (self.capacity - 1)
    }

    fn check_msg_type_id(&self, msg_type_id: i32) -> Result<()> {
        if msg_type_id < 1 {
            return Err(ControlError::malformed(format!(
                "message type id must be greater than zero: {msg_type_id}"
            )));
        }
        Ok(())
    }

    fn check_msg_length(&self, length: usize) -> Result<()> {
        if length > self.max_msg_length {
            return Err(ControlError::malformed(format!(
                "encoded message exceeds max length of {}: {length}",
                self.max_msg_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const CAPACITY: usize = 1024;

    fn create_ring() -> ManyToOneRingBuffer {
        ManyToOneRingBuffer::new(AtomicBuffer::with_capacity(CAPACITY + TRAILER_LENGTH))
    }

    fn drain(ring: &ManyToOneRingBuffer) -> Vec<(i32, Vec<u8>)> {
        let mut out = Vec::new();
        ring.read(
            |type_id, buffer, index, length| out.push((type_id, buffer.get_vec(index, length))),
            usize::MAX,
        );
        out
    }

    #[test]
    fn test_write_then_read_in_order() {
        let ring = create_ring();
        ring.write(7, b"first").unwrap();
        ring.write(8, b"second").unwrap();
        ring.write(9, b"").unwrap();

        let records = drain(&ring);
        assert_eq!(
            records,
            vec![
                (7, b"first".to_vec()),
                (8, b"second".to_vec()),
                (9, Vec::new())
            ]
        );
        assert!(drain(&ring).is_empty());
        assert_eq!(ring.consumer_position(), ring.producer_position());
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn test_read_respects_limit() {
        let ring = create_ring();
        for i in 0..5 {
            ring.write(1, &[i]).unwrap();
        }

        let mut seen = Vec::new();
        let n = ring.read(|_, b, i, _| seen.push(b.get_vec(i, 1)[0]), 2);
        assert_eq!(n, 2);
        assert_eq!(seen, vec![0, 1]);

        let n = ring.read(|_, b, i, _| seen.push(b.get_vec(i, 1)[0]), 10);
        assert_eq!(n, 3);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_full() {
        let ring = create_ring();
        let payload = vec![0xAB; ring.max_msg_length() - HEADER_LENGTH];
        // 128-byte records: 8 fit exactly.
        for _ in 0..8 {
            ring.write(1, &payload).unwrap();
        }
        assert!(matches!(ring.write(1, &payload), Err(ControlError::BufferFull)));

        assert_eq!(ring.read(|_, _, _, _| {}, 1), 1);
        ring.write(1, &payload).unwrap();
    }

    #[test]
    fn test_rejects_oversize_and_bad_type() {
        let ring = create_ring();
        let too_big = vec![0; ring.max_msg_length() + 1];
        assert!(matches!(
            ring.write(1, &too_big),
            Err(ControlError::MalformedCommand(_))
        ));
        assert!(matches!(
            ring.write(0, b"x"),
            Err(ControlError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_padding_inserted_on_wrap() {
        let ring = create_ring();
        let payload = vec![1u8; 100 - HEADER_LENGTH]; // aligned record: 104 bytes

        // Advance to position 936; 88 bytes remain before the end.
        for _ in 0..9 {
            ring.write(1, &payload).unwrap();
        }
        assert_eq!(ring.read(|_, _, _, _| {}, usize::MAX), 9);
        assert_eq!(ring.producer_position(), 936);

        ring.write(2, &payload).unwrap();
        // Padding fills the 88 byte remainder; the record lands at index 0.
        assert_eq!(ring.producer_position(), 936 + 88 + 104);
        assert_eq!(ring.buffer().get_i32(936 + 4), PADDING_MSG_TYPE_ID);
        assert_eq!(ring.buffer().get_i32(936), 88);

        // First read only consumes the padding up to the end of the buffer.
        assert_eq!(ring.read(|_, _, _, _| {}, usize::MAX), 0);
        let records = drain(&ring);
        assert_eq!(records, vec![(2, payload)]);
        assert_eq!(ring.consumer_position(), ring.producer_position());
    }

    #[test]
    fn test_try_claim_commit() {
        let ring = create_ring();
        let index = ring.try_claim(5, 4).unwrap();

        // Uncommitted claims block the consumer.
        assert!(drain(&ring).is_empty());

        ring.buffer().put_i32(index, 1234);
        ring.commit(index);

        let records = drain(&ring);
        assert_eq!(records, vec![(5, 1234i32.to_le_bytes().to_vec())]);
    }

    #[test]
    fn test_abort_is_skipped() {
        let ring = create_ring();
        let index = ring.try_claim(5, 16).unwrap();
        ring.write(6, b"after").unwrap();
        ring.abort(index);

        let records = drain(&ring);
        assert_eq!(records, vec![(6, b"after".to_vec())]);
    }

    #[test]
    fn test_unblock_stalled_claim() {
        let ring = create_ring();
        let _stalled = ring.try_claim(5, 16).unwrap();
        ring.write(6, b"behind").unwrap();

        assert!(drain(&ring).is_empty());
        assert!(ring.unblock());

        let records = drain(&ring);
        assert_eq!(records, vec![(6, b"behind".to_vec())]);
        assert!(!ring.unblock());
    }

    #[test]
    fn test_unblock_stalled_claim_in_full_ring() {
        let ring = create_ring();
        let _stalled = ring.try_claim(5, 120).unwrap();
        let mut writes = 0;
        while ring.write(1, &[7; 120]).is_ok() {
            writes += 1;
        }
        assert_eq!(writes, 7);
        assert_eq!(ring.producer_position() - ring.consumer_position(), CAPACITY as i64);
        assert!(drain(&ring).is_empty());

        assert!(ring.unblock());
        assert_eq!(drain(&ring).len(), 7);
        assert!(ring.write(1, b"room again").is_ok());
    }

    #[test]
    fn test_unblock_claim_without_header() {
        let ring = create_ring();
        // Simulate a producer that advanced the tail and died before writing
        // its header.
        let tail_index = CAPACITY + TAIL_POSITION_OFFSET;
        assert!(ring.buffer().compare_and_set_i64(tail_index, 0, 32));
        ring.write(6, b"later").unwrap();

        assert!(drain(&ring).is_empty());
        assert!(ring.unblock());
        assert_eq!(drain(&ring), vec![(6, b"later".to_vec())]);
    }

    #[test]
    fn test_unblock_nothing_to_do() {
        let ring = create_ring();
        assert!(!ring.unblock());
        ring.write(1, b"x").unwrap();
        assert!(!ring.unblock());
    }

    #[test]
    fn test_correlation_ids_and_heartbeat() {
        let ring = create_ring();
        assert_eq!(ring.next_correlation_id(), 0);
        assert_eq!(ring.next_correlation_id(), 1);

        ring.set_consumer_heartbeat_time(12_345);
        assert_eq!(ring.consumer_heartbeat_time(), 12_345);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = ManyToOneRingBuffer::new(AtomicBuffer::with_capacity(1000 + TRAILER_LENGTH));
    }

    #[test]
    fn test_multiple_producers() {
        let ring = Arc::new(ManyToOneRingBuffer::new(AtomicBuffer::with_capacity(
            64 * 1024 + TRAILER_LENGTH,
        )));
        let num_producers = 4u32;
        let items_per_producer = 500u32;

        let mut handles = vec![];
        for p in 0..num_producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..items_per_producer {
                    let value = p * 10_000 + i;
                    while ring.write(1, &value.to_le_bytes()).is_err() {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut items = Vec::new();
        let total = (num_producers * items_per_producer) as usize;
        while items.len() < total {
            let n = ring.read(
                |_, buffer, index, _| items.push(buffer.get_i32(index) as u32),
                usize::MAX,
            );
            if n == 0 {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }

        // Per-producer order is preserved.
        for p in 0..num_producers {
            let mine: Vec<u32> = items.iter().copied().filter(|v| v / 10_000 == p).collect();
            let expected: Vec<u32> = (0..items_per_producer).map(|i| p * 10_000 + i).collect();
            assert_eq!(mine, expected);
        }
    }
}
