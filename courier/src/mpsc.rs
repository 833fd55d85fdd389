//! Many-to-one (client → driver) record ring buffer.
//!
//! Multiple producers in multiple processes claim space with a CAS on the
//! tail; the single consumer (the driver conductor) drains records in order.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────── capacity (power of two) ──┬─── trailer ───┐
//! │ [len|type|payload...][len|type|payload...] ...        │ tail          │
//! │                                                       │ head cache    │
//! │                                                       │ head          │
//! │                                                       │ correlation # │
//! │                                                       │ heartbeat     │
//! └───────────────────────────────────────────────────────┴───────────────┘
//! ```
//!
//! Each trailer counter sits on its own pair of cache lines.
//!
//! # Record
//!
//! ```text
//!  0               4               8
//! ┌───────────────┬───────────────┬──────────────────────┐
//! │ length (i32)  │ type (i32)    │ payload ...          │
//! └───────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! `length` includes the header. A negative length marks a record that has
//! been claimed but not yet committed; records are aligned to 8 bytes.

use crate::buffer::CACHE_LINE_LENGTH;

mod ring;

pub use ring::ManyToOneRingBuffer;

/// Length of the record header (length + type).
pub const HEADER_LENGTH: usize = 8;

/// Alignment of every record.
pub const ALIGNMENT: usize = HEADER_LENGTH;

/// Type id of a padding record inserted at the end of the buffer.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Offset of the producer tail within the trailer.
pub const TAIL_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 2;

/// Offset of the producers' cached view of the head.
pub const HEAD_CACHE_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 4;

/// Offset of the consumer head within the trailer.
pub const HEAD_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 6;

/// Offset of the correlation id counter within the trailer.
pub const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 8;

/// Offset of the consumer heartbeat timestamp within the trailer.
pub const CONSUMER_HEARTBEAT_OFFSET: usize = CACHE_LINE_LENGTH * 10;

/// Total trailer length appended after the data region.
pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 12;

#[inline]
pub(crate) const fn length_offset(record_offset: usize) -> usize {
    record_offset
}

#[inline]
pub(crate) const fn type_offset(record_offset: usize) -> usize {
    record_offset + 4
}

/// Packs a length and type into the 8-byte header so both can be published
/// with a single ordered store.
#[inline]
pub(crate) const fn make_header(length: i32, type_id: i32) -> i64 {
    ((type_id as i64) << 32) | (length as i64 & 0xFFFF_FFFF)
}
