//! Control-plane wire protocol between clients and the driver.
//!
//! Every message is a fixed-layout, little-endian record viewed in place by
//! a flyweight: a `(buffer, offset)` pair with accessors at fixed offsets.
//! Nothing is copied until a string or blob accessor is called.
//!
//! # Framing
//!
//! Commands travel in [`ManyToOneRingBuffer`](crate::mpsc::ManyToOneRingBuffer)
//! records and responses in [`BroadcastTransmitter`](crate::broadcast::BroadcastTransmitter)
//! records; the record header carries the type id and length, so the
//! flyweights below describe payloads only.
//!
//! Variable-length fields are an `i32` length followed by the raw bytes, no
//! terminator. A field that follows another variable-length field starts at
//! the next 4-byte boundary.
//!
//! # Commands (client → driver)
//!
//! ```text
//! correlated header        client_id i64 @0, correlation_id i64 @8
//! ADD_PUBLICATION    0x01  header, stream_id i32 @16, channel str @20
//! REMOVE_PUBLICATION 0x02  header, registration_id i64 @16
//! ADD_SUBSCRIPTION   0x04  header, registration_correlation_id i64 @16,
//!                          stream_id i32 @24, channel str @28
//! ADD_DESTINATION    0x07  header, registration_correlation_id i64 @16,
//!                          channel str @24
//! ADD_COUNTER        0x09  header, type_id i32 @16, key blob @20, label str
//! TERMINATE_DRIVER   0x0E  header, token blob @16
//! ```
//!
//! # Responses (driver → clients)
//!
//! ```text
//! ON_ERROR             0x0F01  offending_correlation_id i64 @0,
//!                              error_code i32 @8, message str @12
//! ON_AVAILABLE_IMAGE   0x0F02  correlation_id i64 @0, session_id i32 @8,
//!                              stream_id i32 @12, subscription_registration_id i64 @16,
//!                              subscriber_position_id i32 @24, log_file str @28,
//!                              source_identity str
//! ON_PUBLICATION_READY 0x0F03  correlation_id i64 @0, registration_id i64 @8,
//!                              session_id i32 @16, stream_id i32 @20,
//!                              publication_limit_counter_id i32 @24,
//!                              channel_status_indicator_id i32 @28, log_file str @32
//! ```

use std::fmt;

use crate::buffer::{AtomicBuffer, align};
use crate::error::{ControlError, Result};

pub(crate) mod command;
pub(crate) mod response;

pub use command::{
    Command, CorrelatedMessage, CounterMessage, DestinationMessage, PublicationMessage,
    RemoveMessage, SubscriptionMessage, TerminateDriverMessage,
};
pub use response::{
    ClientTimeoutResponse, CounterUpdate, ErrorResponse, ImageMessage, OperationSucceeded,
    PublicationReady, Response, SubscriptionReady, UnavailableImage,
};

/// Command type ids (client → driver).
pub mod command_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_EXCLUSIVE_PUBLICATION: i32 = 0x03;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const ADD_DESTINATION: i32 = 0x07;
    pub const REMOVE_DESTINATION: i32 = 0x08;
    pub const ADD_COUNTER: i32 = 0x09;
    pub const REMOVE_COUNTER: i32 = 0x0A;
    pub const CLIENT_CLOSE: i32 = 0x0B;
    pub const ADD_RCV_DESTINATION: i32 = 0x0C;
    pub const REMOVE_RCV_DESTINATION: i32 = 0x0D;
    pub const TERMINATE_DRIVER: i32 = 0x0E;
}

/// Response type ids (driver → clients).
pub mod response_type {
    pub const ON_ERROR: i32 = 0x0F01;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x0F02;
    pub const ON_PUBLICATION_READY: i32 = 0x0F03;
    pub const ON_OPERATION_SUCCESS: i32 = 0x0F04;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F05;
    pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x0F06;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x0F07;
    pub const ON_COUNTER_READY: i32 = 0x0F08;
    pub const ON_UNAVAILABLE_COUNTER: i32 = 0x0F09;
    pub const ON_CLIENT_TIMEOUT: i32 = 0x0F0A;
}

/// Error codes carried in `ON_ERROR` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    ChannelEndpointError = 4,
    UnknownCounter = 5,
    UnknownCommandTypeId = 6,
    MalformedCommand = 7,
    NotSupported = 8,
    UnknownHost = 9,
    ResourceTemporarilyUnavailable = 10,
    ClientTimeout = 11,
}

impl ErrorCode {
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<i32> for ErrorCode {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::InvalidChannel,
            2 => Self::UnknownSubscription,
            3 => Self::UnknownPublication,
            4 => Self::ChannelEndpointError,
            5 => Self::UnknownCounter,
            6 => Self::UnknownCommandTypeId,
            7 => Self::MalformedCommand,
            8 => Self::NotSupported,
            9 => Self::UnknownHost,
            10 => Self::ResourceTemporarilyUnavailable,
            11 => Self::ClientTimeout,
            _ => Self::GenericError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GenericError => "GENERIC_ERROR",
            Self::InvalidChannel => "INVALID_CHANNEL",
            Self::UnknownSubscription => "UNKNOWN_SUBSCRIPTION",
            Self::UnknownPublication => "UNKNOWN_PUBLICATION",
            Self::ChannelEndpointError => "CHANNEL_ENDPOINT_ERROR",
            Self::UnknownCounter => "UNKNOWN_COUNTER",
            Self::UnknownCommandTypeId => "UNKNOWN_COMMAND_TYPE_ID",
            Self::MalformedCommand => "MALFORMED_COMMAND",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::UnknownHost => "UNKNOWN_HOST",
            Self::ResourceTemporarilyUnavailable => "RESOURCE_TEMPORARILY_UNAVAILABLE",
            Self::ClientTimeout => "CLIENT_TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Length of a variable-length field's `i32` prefix.
pub(crate) const LENGTH_PREFIX: usize = 4;

/// Fails unless the frame holds at least `required` bytes.
pub(crate) fn check_min_length(frame_length: usize, required: usize, what: &str) -> Result<()> {
    if frame_length < required {
        return Err(ControlError::malformed(format!(
            "{what}: frame length {frame_length} < minimum {required}"
        )));
    }
    Ok(())
}

/// Reads and validates the length prefix of a variable-length field at
/// `field` (relative to the frame start), returning the field's byte length.
pub(crate) fn checked_field_length(
    buffer: &AtomicBuffer,
    offset: usize,
    field: usize,
    frame_length: usize,
    what: &str,
) -> Result<usize> {
    check_min_length(frame_length, field + LENGTH_PREFIX, what)?;
    let declared = buffer.get_i32(offset + field);
    let length = usize::try_from(declared).map_err(|_| {
        ControlError::malformed(format!("{what}: negative field length {declared}"))
    })?;
    if field + LENGTH_PREFIX + length > frame_length {
        return Err(ControlError::malformed(format!(
            "{what}: field length {length} at {field} overruns frame length {frame_length}"
        )));
    }
    Ok(length)
}

/// Length of the field at `index`, treating a corrupt negative prefix as empty.
#[inline]
pub(crate) fn field_length(buffer: &AtomicBuffer, index: usize) -> usize {
    usize::try_from(buffer.get_i32(index)).unwrap_or(0)
}

/// Owned copy of the length-prefixed string at `index`.
pub(crate) fn string_at(buffer: &AtomicBuffer, index: usize) -> String {
    let length = field_length(buffer, index);
    String::from_utf8_lossy(&buffer.get_vec(index + LENGTH_PREFIX, length)).into_owned()
}

/// Owned copy of the length-prefixed blob at `index`.
pub(crate) fn blob_at(buffer: &AtomicBuffer, index: usize) -> Vec<u8> {
    let length = field_length(buffer, index);
    buffer.get_vec(index + LENGTH_PREFIX, length)
}

/// Start of the field following a variable-length field at `field` of
/// `length` bytes.
#[inline]
pub(crate) const fn next_field(field: usize, length: usize) -> usize {
    align(field + LENGTH_PREFIX + length, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from(5), ErrorCode::UnknownCounter);
        assert_eq!(ErrorCode::from(11), ErrorCode::ClientTimeout);
        assert_eq!(ErrorCode::from(999), ErrorCode::GenericError);
        assert_eq!(ErrorCode::MalformedCommand.as_i32(), 7);
        assert_eq!(ErrorCode::ChannelEndpointError.to_string(), "CHANNEL_ENDPOINT_ERROR");
    }

    #[test]
    fn test_checked_field_length_bounds() {
        let buffer = AtomicBuffer::with_capacity(64);
        buffer.put_string(8, "abcd");
        assert_eq!(checked_field_length(&buffer, 0, 8, 16, "t").unwrap(), 4);
        assert!(checked_field_length(&buffer, 0, 8, 15, "t").is_err());
        assert!(checked_field_length(&buffer, 0, 8, 10, "t").is_err());

        buffer.put_i32(8, -1);
        assert!(matches!(
            checked_field_length(&buffer, 0, 8, 64, "t"),
            Err(ControlError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_next_field_is_four_aligned() {
        assert_eq!(next_field(20, 0), 24);
        assert_eq!(next_field(20, 1), 28);
        assert_eq!(next_field(20, 8), 32);
    }
}
