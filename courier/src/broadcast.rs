//! One-to-many (driver → clients) broadcast buffer.
//!
//! A single transmitter overwrites a circular buffer without ever waiting
//! for receivers. Each receiver keeps its own cursor and detects when the
//! transmitter has lapped it.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────── capacity (power of two) ────────┬─ trailer (128) ─┐
//! │ [len|type|payload...][len|type|payload...] ...  │ tail intent @0  │
//! │                                                 │ tail        @8  │
//! │                                                 │ latest      @16 │
//! └─────────────────────────────────────────────────┴─────────────────┘
//! ```
//!
//! Records share the ring buffer's 8-byte header (`length`, `type`) and
//! 8-byte alignment.
//!
//! # Lapping
//!
//! The transmitter publishes *tail intent* before touching a record and
//! *tail* after. A receiver whose cursor is a full capacity or more behind
//! the tail intent may be reading overwritten bytes; it jumps to the latest
//! record and bumps its lapped count.

use crate::buffer::CACHE_LINE_LENGTH;

mod receiver;
mod transmitter;

pub use receiver::{BroadcastReceiver, CopyBroadcastReceiver};
pub use transmitter::BroadcastTransmitter;

/// Length of the record header (length + type).
pub const HEADER_LENGTH: usize = 8;

/// Alignment of every record.
pub const RECORD_ALIGNMENT: usize = HEADER_LENGTH;

/// Type id of a padding record inserted at the end of the buffer.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Offset of the tail intent counter within the trailer.
pub const TAIL_INTENT_COUNTER_OFFSET: usize = 0;

/// Offset of the tail counter within the trailer.
pub const TAIL_COUNTER_OFFSET: usize = 8;

/// Offset of the position of the most recent record within the trailer.
pub const LATEST_COUNTER_OFFSET: usize = 16;

/// Total trailer length appended after the data region.
pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

#[inline]
pub(crate) const fn length_offset(record_offset: usize) -> usize {
    record_offset
}

#[inline]
pub(crate) const fn type_offset(record_offset: usize) -> usize {
    record_offset + 4
}

#[inline]
pub(crate) const fn msg_offset(record_offset: usize) -> usize {
    record_offset + HEADER_LENGTH
}

pub(crate) fn check_capacity(capacity: usize) {
    assert!(
        capacity.is_power_of_two(),
        "broadcast capacity must be a power of two plus {TRAILER_LENGTH} trailer bytes"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AtomicBuffer;
    use crate::error::ControlError;

    const CAPACITY: usize = 1024;

    fn create_pair() -> (BroadcastTransmitter, AtomicBuffer) {
        let buffer = AtomicBuffer::with_capacity(CAPACITY + TRAILER_LENGTH);
        (BroadcastTransmitter::new(buffer.clone()), buffer)
    }

    #[test]
    fn test_receiver_sees_records_after_it_joined() {
        let (transmitter, buffer) = create_pair();
        transmitter.transmit(1, b"before").unwrap();

        let mut receiver = BroadcastReceiver::new(buffer);
        assert!(!receiver.receive_next());

        transmitter.transmit(2, b"after").unwrap();
        assert!(receiver.receive_next());
        assert_eq!(receiver.type_id(), 2);
        assert_eq!(receiver.length(), 5);
        assert_eq!(receiver.buffer().get_vec(receiver.offset(), 5), b"after");
        assert!(receiver.validate());
        assert!(!receiver.receive_next());
    }

    #[test]
    fn test_two_receivers_see_same_stream() {
        let (transmitter, buffer) = create_pair();
        let mut a = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer.clone()));
        let mut b = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer));

        for i in 0..3u8 {
            transmitter.transmit(10 + i32::from(i), &[i; 3]).unwrap();
        }

        for receiver in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while receiver
                .receive(|type_id, buf, offset, len| seen.push((type_id, buf.get_vec(offset, len))))
                .unwrap()
                > 0
            {}
            assert_eq!(
                seen,
                vec![(10, vec![0; 3]), (11, vec![1; 3]), (12, vec![2; 3])]
            );
        }
    }

    #[test]
    fn test_padding_at_end_of_buffer() {
        let (transmitter, buffer) = create_pair();
        let mut receiver = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer.clone()));
        let payload = vec![7u8; 112]; // aligned record: 120 bytes

        // Advance past the 8 records that fit before the end (960 bytes).
        for _ in 0..8 {
            transmitter.transmit(1, &payload).unwrap();
            assert_eq!(receiver.receive(|_, _, _, _| {}).unwrap(), 1);
        }

        transmitter.transmit(2, &payload).unwrap();
        // 64 bytes of padding, then the record at offset 0.
        assert_eq!(
            buffer.get_i64(CAPACITY + TAIL_COUNTER_OFFSET),
            (8 * 120 + 64 + 120) as i64
        );
        assert_eq!(buffer.get_i32(type_offset(960)), PADDING_MSG_TYPE_ID);

        let mut seen = Vec::new();
        assert_eq!(
            receiver
                .receive(|type_id, b, o, l| seen.push((type_id, b.get_vec(o, l))))
                .unwrap(),
            1
        );
        assert_eq!(seen, vec![(2, payload)]);
    }

    #[test]
    fn test_lapped_receiver_reports_data_loss_then_resyncs() {
        let (transmitter, buffer) = create_pair();
        let mut receiver = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer));
        let payload = vec![1u8; 120]; // 128-byte records, 8 per lap

        for i in 0..20 {
            transmitter.transmit(1 + i, &payload).unwrap();
        }

        let first = receiver.receive(|_, _, _, _| {});
        assert!(matches!(first, Err(ControlError::DataLoss)));
        assert_eq!(receiver.lapped_count(), 1);

        // Resynced to the latest record; nothing older is replayed.
        assert_eq!(receiver.receive(|_, _, _, _| {}).unwrap(), 0);

        transmitter.transmit(99, b"fresh").unwrap();
        let mut seen = Vec::new();
        receiver
            .receive(|type_id, b, o, l| seen.push((type_id, b.get_vec(o, l))))
            .unwrap();
        assert_eq!(seen, vec![(99, b"fresh".to_vec())]);
    }

    #[test]
    fn test_rejects_oversize_message() {
        let (transmitter, _) = create_pair();
        let too_big = vec![0; transmitter.max_msg_length() + 1];
        assert!(matches!(
            transmitter.transmit(1, &too_big),
            Err(ControlError::MalformedCommand(_))
        ));
    }
}
