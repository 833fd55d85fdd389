use super::{
    HEADER_LENGTH, LATEST_COUNTER_OFFSET, PADDING_MSG_TYPE_ID, RECORD_ALIGNMENT,
    TAIL_COUNTER_OFFSET, TAIL_INTENT_COUNTER_OFFSET, TRAILER_LENGTH, check_capacity,
    length_offset, msg_offset, type_offset,
};
use crate::buffer::{AtomicBuffer, align};
use crate::error::{ControlError, Result};
use crate::trace::warn;

/// Zero-copy reader of a broadcast buffer.
///
/// Starts at the current tail: only records transmitted after construction
/// are seen. Content must be [`validate`](Self::validate)d after it is read,
/// since the transmitter may overwrite it at any time.
#[derive(Debug)]
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: usize,
    tail_intent_counter_index: usize,
    tail_counter_index: usize,
    latest_counter_index: usize,
    record_offset: usize,
    cursor: i64,
    next_record: i64,
    lapped_count: u64,
}

impl BroadcastReceiver {
    /// Wraps `buffer`, whose last [`TRAILER_LENGTH`] bytes hold the trailer.
    ///
    /// # Panics
    ///
    /// Panics if the data region is not a power of two.
    #[must_use]
    pub fn new(buffer: AtomicBuffer) -> Self {
        let capacity = buffer.capacity().saturating_sub(TRAILER_LENGTH);
        check_capacity(capacity);

        let tail_counter_index = capacity + TAIL_COUNTER_OFFSET;
        let cursor = buffer.get_i64_volatile(tail_counter_index);

        Self {
            capacity,
            tail_intent_counter_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter_index,
            latest_counter_index: capacity + LATEST_COUNTER_OFFSET,
            record_offset: (cursor as usize) & (capacity - 1),
            cursor,
            next_record: cursor,
            lapped_count: 0,
            buffer,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn max_msg_length(&self) -> usize {
        self.capacity / 8
    }

    /// Number of times the transmitter has overtaken this receiver.
    #[must_use]
    pub const fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    /// Type id of the current record.
    #[must_use]
    pub fn type_id(&self) -> i32 {
        self.buffer.get_i32(type_offset(self.record_offset))
    }

    /// Index of the current record's payload in [`buffer`](Self::buffer).
    #[must_use]
    pub const fn offset(&self) -> usize {
        msg_offset(self.record_offset)
    }

    /// Payload length of the current record.
    #[must_use]
    pub fn length(&self) -> usize {
        let length = self.buffer.get_i32(length_offset(self.record_offset));
        usize::try_from(length).unwrap_or(0).saturating_sub(HEADER_LENGTH)
    }

    #[must_use]
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Advances to the next record if one is available.
    ///
    /// When the cursor has been lapped the receiver skips to the latest
    /// record and increments [`lapped_count`](Self::lapped_count).
    pub fn receive_next(&mut self) -> bool {
        let tail = self.buffer.get_i64_volatile(self.tail_counter_index);
        let mut cursor = self.next_record;

        if tail <= cursor {
            return false;
        }

        let mask = self.capacity - 1;
        let mut record_offset = (cursor as usize) & mask;

        if !self.validate_at(cursor) {
            self.lapped_count += 1;
            cursor = self.buffer.get_i64(self.latest_counter_index);
            record_offset = (cursor as usize) & mask;
        }

        self.cursor = cursor;
        self.next_record = cursor + self.aligned_length_at(record_offset);

        if self.buffer.get_i32(type_offset(record_offset)) == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record += self.aligned_length_at(record_offset);
        }

        self.record_offset = record_offset;
        true
    }

    /// True if the current record has not been overwritten since it was
    /// reached.
    #[must_use]
    pub fn validate(&self) -> bool {
        AtomicBuffer::acquire_fence();
        self.validate_at(self.cursor)
    }

    fn validate_at(&self, cursor: i64) -> bool {
        cursor + self.capacity as i64
            > self.buffer.get_i64_volatile(self.tail_intent_counter_index)
    }

    fn aligned_length_at(&self, record_offset: usize) -> i64 {
        let length = self.buffer.get_i32(length_offset(record_offset));
        let length = usize::try_from(length).unwrap_or(0);
        // A zero length would stall the cursor; step a full header instead.
        align(length.max(HEADER_LENGTH), RECORD_ALIGNMENT) as i64
    }
}

/// Receiver that copies each record into a private scratch buffer before
/// handing it out, so handlers never see bytes that change underneath them.
#[derive(Debug)]
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: AtomicBuffer,
}

impl CopyBroadcastReceiver {
    #[must_use]
    pub fn new(receiver: BroadcastReceiver) -> Self {
        let scratch = AtomicBuffer::with_capacity(receiver.max_msg_length().max(HEADER_LENGTH));
        Self { receiver, scratch }
    }

    #[must_use]
    pub const fn lapped_count(&self) -> u64 {
        self.receiver.lapped_count()
    }

    /// Delivers at most one record as `handler(type_id, scratch, 0, length)`.
    ///
    /// Returns the number of records delivered (0 or 1).
    ///
    /// # Errors
    ///
    /// [`ControlError::DataLoss`] if the transmitter lapped this receiver,
    /// before or during the copy. The receiver has already resynced to the
    /// latest record when this is returned.
    pub fn receive<F>(&mut self, handler: F) -> Result<usize>
    where
        F: FnOnce(i32, &AtomicBuffer, usize, usize),
    {
        let last_seen_lapped_count = self.receiver.lapped_count();

        if !self.receiver.receive_next() {
            return Ok(0);
        }

        if last_seen_lapped_count != self.receiver.lapped_count() {
            warn!(
                lapped_count = self.receiver.lapped_count(),
                "broadcast receiver lapped by transmitter"
            );
            return Err(ControlError::DataLoss);
        }

        let length = self.receiver.length();
        if length > self.scratch.capacity() {
            return Err(ControlError::DataLoss);
        }

        let msg_type_id = self.receiver.type_id();
        self.scratch
            .put_buffer(0, self.receiver.buffer(), self.receiver.offset(), length);

        if !self.receiver.validate() {
            warn!("broadcast record overwritten during copy");
            return Err(ControlError::DataLoss);
        }

        handler(msg_type_id, &self.scratch, 0, length);
        Ok(1)
    }
}
