use super::{
    HEADER_LENGTH, LATEST_COUNTER_OFFSET, PADDING_MSG_TYPE_ID, RECORD_ALIGNMENT,
    TAIL_COUNTER_OFFSET, TAIL_INTENT_COUNTER_OFFSET, TRAILER_LENGTH, check_capacity,
    length_offset, msg_offset, type_offset,
};
use crate::buffer::{AtomicBuffer, align};
use crate::error::{ControlError, Result};

/// Single writer of a broadcast buffer. Never blocks on receivers.
#[derive(Debug)]
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_intent_counter_index: usize,
    tail_counter_index: usize,
    latest_counter_index: usize,
}

impl BroadcastTransmitter {
    /// Wraps `buffer`, whose last [`TRAILER_LENGTH`] bytes hold the trailer.
    ///
    /// # Panics
    ///
    /// Panics if the data region is not a power of two.
    #[must_use]
    pub fn new(buffer: AtomicBuffer) -> Self {
        let capacity = buffer.capacity().saturating_sub(TRAILER_LENGTH);
        check_capacity(capacity);

        Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
            tail_intent_counter_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter_index: capacity + TAIL_COUNTER_OFFSET,
            latest_counter_index: capacity + LATEST_COUNTER_OFFSET,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Broadcasts one record to all receivers.
    ///
    /// # Errors
    ///
    /// [`ControlError::MalformedCommand`] for an invalid type id or a payload
    /// longer than [`max_msg_length`](Self::max_msg_length).
    pub fn transmit(&self, msg_type_id: i32, src: &[u8]) -> Result<()> {
        self.transmit_with(msg_type_id, src.len(), |buffer, index| {
            buffer.put_bytes(index, src);
        })
    }

    /// Broadcasts one record of `length` payload bytes, letting `encode`
    /// write the payload in place at the given index.
    ///
    /// # Errors
    ///
    /// As for [`transmit`](Self::transmit).
    pub fn transmit_with<F>(&self, msg_type_id: i32, length: usize, encode: F) -> Result<()>
    where
        F: FnOnce(&AtomicBuffer, usize),
    {
        if msg_type_id < 1 {
            return Err(ControlError::malformed(format!(
                "message type id must be greater than zero: {msg_type_id}"
            )));
        }
        if length > self.max_msg_length {
            return Err(ControlError::malformed(format!(
                "encoded message exceeds max length of {}: {length}",
                self.max_msg_length
            )));
        }

        let mut current_tail = self.buffer.get_i64(self.tail_counter_index);
        let mut record_offset = self.index_of(current_tail);
        let record_length = length + HEADER_LENGTH;
        let aligned_record_length = align(record_length, RECORD_ALIGNMENT);
        let new_tail = current_tail + aligned_record_length as i64;
        let to_end_of_buffer = self.capacity - record_offset;

        if to_end_of_buffer < aligned_record_length {
            self.signal_tail_intent(new_tail + to_end_of_buffer as i64);

            self.buffer
                .put_i32(length_offset(record_offset), to_end_of_buffer as i32);
            self.buffer
                .put_i32(type_offset(record_offset), PADDING_MSG_TYPE_ID);

            current_tail += to_end_of_buffer as i64;
            record_offset = 0;
        } else {
            self.signal_tail_intent(new_tail);
        }

        self.buffer
            .put_i32(length_offset(record_offset), record_length as i32);
        self.buffer.put_i32(type_offset(record_offset), msg_type_id);
        encode(&self.buffer, msg_offset(record_offset));

        self.buffer.put_i64(self.latest_counter_index, current_tail);
        self.buffer.put_i64_ordered(
            self.tail_counter_index,
            current_tail + aligned_record_length as i64,
        );

        Ok(())
    }

    fn signal_tail_intent(&self, new_tail: i64) {
        self.buffer
            .put_i64_ordered(self.tail_intent_counter_index, new_tail);
        AtomicBuffer::release_fence();
    }

    #[inline]
    fn index_of(&self, position: i64) -> usize {
        (position as usize) & (self.capacity - 1)
    }
}
