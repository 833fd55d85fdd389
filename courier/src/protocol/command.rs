//! Command flyweights (client → driver).

use super::{
    LENGTH_PREFIX, blob_at, check_min_length, checked_field_length, command_type, field_length,
    next_field, string_at,
};
use crate::buffer::AtomicBuffer;
use crate::error::Result;

const CLIENT_ID_OFFSET: usize = 0;
const CORRELATION_ID_OFFSET: usize = 8;

/// Adds the correlated-header accessors shared by every command.
macro_rules! correlated_header {
    () => {
        /// Id of the client that sent the command.
        #[must_use]
        pub fn client_id(&self) -> i64 {
            self.buffer.get_i64(self.offset + CLIENT_ID_OFFSET)
        }

        pub fn set_client_id(&self, client_id: i64) -> &Self {
            self.buffer.put_i64(self.offset + CLIENT_ID_OFFSET, client_id);
            self
        }

        /// Id the client will match responses against.
        #[must_use]
        pub fn correlation_id(&self) -> i64 {
            self.buffer.get_i64(self.offset + CORRELATION_ID_OFFSET)
        }

        pub fn set_correlation_id(&self, correlation_id: i64) -> &Self {
            self.buffer
                .put_i64(self.offset + CORRELATION_ID_OFFSET, correlation_id);
            self
        }
    };
}

/// Header common to all commands; also the whole of `CLIENT_KEEPALIVE` and
/// `CLIENT_CLOSE`.
#[derive(Debug, Clone, Copy)]
pub struct CorrelatedMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> CorrelatedMessage<'a> {
    pub const LENGTH: usize = 16;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is shorter than the header.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "correlated message")?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    #[must_use]
    pub const fn length(&self) -> usize {
        Self::LENGTH
    }
}

/// `ADD_PUBLICATION` and `ADD_EXCLUSIVE_PUBLICATION`.
#[derive(Debug, Clone, Copy)]
pub struct PublicationMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> PublicationMessage<'a> {
    const STREAM_ID_OFFSET: usize = 16;
    const CHANNEL_OFFSET: usize = 20;
    pub const MIN_LENGTH: usize = Self::CHANNEL_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the channel overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "publication message")?;
        checked_field_length(
            buffer,
            offset,
            Self::CHANNEL_OFFSET,
            frame_length,
            "publication message channel",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::STREAM_ID_OFFSET)
    }

    pub fn set_stream_id(&self, stream_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::STREAM_ID_OFFSET, stream_id);
        self
    }

    #[must_use]
    pub fn channel(&self) -> String {
        string_at(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    pub fn set_channel(&self, channel: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::CHANNEL_OFFSET, channel);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(channel_length: usize) -> usize {
        Self::MIN_LENGTH + channel_length
    }
}

/// `REMOVE_PUBLICATION`, `REMOVE_SUBSCRIPTION` and `REMOVE_COUNTER`.
#[derive(Debug, Clone, Copy)]
pub struct RemoveMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> RemoveMessage<'a> {
    const REGISTRATION_ID_OFFSET: usize = 16;
    pub const LENGTH: usize = Self::REGISTRATION_ID_OFFSET + 8;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "remove message")?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    /// Registration id of the resource to remove.
    #[must_use]
    pub fn registration_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::REGISTRATION_ID_OFFSET)
    }

    pub fn set_registration_id(&self, registration_id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::REGISTRATION_ID_OFFSET, registration_id);
        self
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        Self::LENGTH
    }
}

/// `ADD_SUBSCRIPTION`.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> SubscriptionMessage<'a> {
    const REGISTRATION_CORRELATION_ID_OFFSET: usize = 16;
    const STREAM_ID_OFFSET: usize = 24;
    const CHANNEL_OFFSET: usize = 28;
    pub const MIN_LENGTH: usize = Self::CHANNEL_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the channel overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "subscription message")?;
        checked_field_length(
            buffer,
            offset,
            Self::CHANNEL_OFFSET,
            frame_length,
            "subscription message channel",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    #[must_use]
    pub fn registration_correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::REGISTRATION_CORRELATION_ID_OFFSET)
    }

    pub fn set_registration_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::REGISTRATION_CORRELATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::STREAM_ID_OFFSET)
    }

    pub fn set_stream_id(&self, stream_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::STREAM_ID_OFFSET, stream_id);
        self
    }

    #[must_use]
    pub fn channel(&self) -> String {
        string_at(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    pub fn set_channel(&self, channel: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::CHANNEL_OFFSET, channel);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(channel_length: usize) -> usize {
        Self::MIN_LENGTH + channel_length
    }
}

/// `ADD_DESTINATION`, `REMOVE_DESTINATION`, `ADD_RCV_DESTINATION` and
/// `REMOVE_RCV_DESTINATION`.
#[derive(Debug, Clone, Copy)]
pub struct DestinationMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> DestinationMessage<'a> {
    const REGISTRATION_CORRELATION_ID_OFFSET: usize = 16;
    const CHANNEL_OFFSET: usize = 24;
    pub const MIN_LENGTH: usize = Self::CHANNEL_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the channel overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "destination message")?;
        checked_field_length(
            buffer,
            offset,
            Self::CHANNEL_OFFSET,
            frame_length,
            "destination message channel",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    /// Registration id of the publication or subscription being modified.
    #[must_use]
    pub fn registration_correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::REGISTRATION_CORRELATION_ID_OFFSET)
    }

    pub fn set_registration_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::REGISTRATION_CORRELATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn channel(&self) -> String {
        string_at(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    pub fn set_channel(&self, channel: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::CHANNEL_OFFSET, channel);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::CHANNEL_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(channel_length: usize) -> usize {
        Self::MIN_LENGTH + channel_length
    }
}

/// `ADD_COUNTER`: type id, key blob, then a label starting on the next
/// 4-byte boundary. Set the key before the label.
#[derive(Debug, Clone, Copy)]
pub struct CounterMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> CounterMessage<'a> {
    const TYPE_ID_OFFSET: usize = 16;
    const KEY_OFFSET: usize = 20;
    pub const MIN_LENGTH: usize = Self::KEY_OFFSET + LENGTH_PREFIX + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the key or label overrun it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "counter message")?;
        let key_length =
            checked_field_length(buffer, offset, Self::KEY_OFFSET, frame_length, "counter key")?;
        checked_field_length(
            buffer,
            offset,
            next_field(Self::KEY_OFFSET, key_length),
            frame_length,
            "counter label",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    #[must_use]
    pub fn type_id(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::TYPE_ID_OFFSET)
    }

    pub fn set_type_id(&self, type_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::TYPE_ID_OFFSET, type_id);
        self
    }

    #[must_use]
    pub fn key(&self) -> Vec<u8> {
        blob_at(self.buffer, self.offset + Self::KEY_OFFSET)
    }

    pub fn set_key(&self, key: &[u8]) -> &Self {
        self.buffer.put_blob(self.offset + Self::KEY_OFFSET, key);
        self
    }

    #[must_use]
    pub fn label(&self) -> String {
        string_at(self.buffer, self.offset + self.label_offset())
    }

    pub fn set_label(&self, label: &str) -> &Self {
        self.buffer
            .put_string(self.offset + self.label_offset(), label);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        let label_offset = self.label_offset();
        label_offset + LENGTH_PREFIX + field_length(self.buffer, self.offset + label_offset)
    }

    #[must_use]
    pub const fn compute_length(key_length: usize, label_length: usize) -> usize {
        next_field(Self::KEY_OFFSET, key_length) + LENGTH_PREFIX + label_length
    }

    fn label_offset(&self) -> usize {
        let key_length = field_length(self.buffer, self.offset + Self::KEY_OFFSET);
        next_field(Self::KEY_OFFSET, key_length)
    }
}

/// `TERMINATE_DRIVER`: an opaque token checked by the driver's validator.
#[derive(Debug, Clone, Copy)]
pub struct TerminateDriverMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> TerminateDriverMessage<'a> {
    const TOKEN_OFFSET: usize = 16;
    pub const MIN_LENGTH: usize = Self::TOKEN_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the token overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "terminate driver message")?;
        checked_field_length(
            buffer,
            offset,
            Self::TOKEN_OFFSET,
            frame_length,
            "terminate driver token",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    correlated_header!();

    #[must_use]
    pub fn token(&self) -> Vec<u8> {
        blob_at(self.buffer, self.offset + Self::TOKEN_OFFSET)
    }

    pub fn set_token(&self, token: &[u8]) -> &Self {
        self.buffer.put_blob(self.offset + Self::TOKEN_OFFSET, token);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::TOKEN_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(token_length: usize) -> usize {
        Self::MIN_LENGTH + token_length
    }
}

/// Every command the driver understands, keyed by type id.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    AddPublication(PublicationMessage<'a>),
    RemovePublication(RemoveMessage<'a>),
    AddExclusivePublication(PublicationMessage<'a>),
    AddSubscription(SubscriptionMessage<'a>),
    RemoveSubscription(RemoveMessage<'a>),
    ClientKeepalive(CorrelatedMessage<'a>),
    AddDestination(DestinationMessage<'a>),
    RemoveDestination(DestinationMessage<'a>),
    AddCounter(CounterMessage<'a>),
    RemoveCounter(RemoveMessage<'a>),
    ClientClose(CorrelatedMessage<'a>),
    AddRcvDestination(DestinationMessage<'a>),
    RemoveRcvDestination(DestinationMessage<'a>),
    TerminateDriver(TerminateDriverMessage<'a>),
}

impl<'a> Command<'a> {
    /// Decodes the frame at `offset` of `length` bytes.
    ///
    /// Returns `Ok(None)` for an unknown type id.
    ///
    /// # Errors
    ///
    /// `MalformedCommand` if the frame does not fit its layout.
    pub fn decode(
        type_id: i32,
        buffer: &'a AtomicBuffer,
        offset: usize,
        length: usize,
    ) -> Result<Option<Self>> {
        use command_type::*;

        let command = match type_id {
            ADD_PUBLICATION => {
                Self::AddPublication(PublicationMessage::wrap_checked(buffer, offset, length)?)
            }
            ADD_EXCLUSIVE_PUBLICATION => Self::AddExclusivePublication(
                PublicationMessage::wrap_checked(buffer, offset, length)?,
            ),
            REMOVE_PUBLICATION => {
                Self::RemovePublication(RemoveMessage::wrap_checked(buffer, offset, length)?)
            }
            ADD_SUBSCRIPTION => {
                Self::AddSubscription(SubscriptionMessage::wrap_checked(buffer, offset, length)?)
            }
            REMOVE_SUBSCRIPTION => {
                Self::RemoveSubscription(RemoveMessage::wrap_checked(buffer, offset, length)?)
            }
            CLIENT_KEEPALIVE => {
                Self::ClientKeepalive(CorrelatedMessage::wrap_checked(buffer, offset, length)?)
            }
            ADD_DESTINATION => {
                Self::AddDestination(DestinationMessage::wrap_checked(buffer, offset, length)?)
            }
            REMOVE_DESTINATION => {
                Self::RemoveDestination(DestinationMessage::wrap_checked(buffer, offset, length)?)
            }
            ADD_COUNTER => Self::AddCounter(CounterMessage::wrap_checked(buffer, offset, length)?),
            REMOVE_COUNTER => {
                Self::RemoveCounter(RemoveMessage::wrap_checked(buffer, offset, length)?)
            }
            CLIENT_CLOSE => {
                Self::ClientClose(CorrelatedMessage::wrap_checked(buffer, offset, length)?)
            }
            ADD_RCV_DESTINATION => {
                Self::AddRcvDestination(DestinationMessage::wrap_checked(buffer, offset, length)?)
            }
            REMOVE_RCV_DESTINATION => Self::RemoveRcvDestination(
                DestinationMessage::wrap_checked(buffer, offset, length)?,
            ),
            TERMINATE_DRIVER => {
                Self::TerminateDriver(TerminateDriverMessage::wrap_checked(buffer, offset, length)?)
            }
            _ => return Ok(None),
        };

        Ok(Some(command))
    }

    #[must_use]
    pub const fn type_id(&self) -> i32 {
        use command_type::*;

        match self {
            Self::AddPublication(_) => ADD_PUBLICATION,
            Self::RemovePublication(_) => REMOVE_PUBLICATION,
            Self::AddExclusivePublication(_) => ADD_EXCLUSIVE_PUBLICATION,
            Self::AddSubscription(_) => ADD_SUBSCRIPTION,
            Self::RemoveSubscription(_) => REMOVE_SUBSCRIPTION,
            Self::ClientKeepalive(_) => CLIENT_KEEPALIVE,
            Self::AddDestination(_) => ADD_DESTINATION,
            Self::RemoveDestination(_) => REMOVE_DESTINATION,
            Self::AddCounter(_) => ADD_COUNTER,
            Self::RemoveCounter(_) => REMOVE_COUNTER,
            Self::ClientClose(_) => CLIENT_CLOSE,
            Self::AddRcvDestination(_) => ADD_RCV_DESTINATION,
            Self::RemoveRcvDestination(_) => REMOVE_RCV_DESTINATION,
            Self::TerminateDriver(_) => TERMINATE_DRIVER,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> i64 {
        match self {
            Self::AddPublication(m) | Self::AddExclusivePublication(m) => m.client_id(),
            Self::RemovePublication(m) | Self::RemoveSubscription(m) | Self::RemoveCounter(m) => {
                m.client_id()
            }
            Self::AddSubscription(m) => m.client_id(),
            Self::ClientKeepalive(m) | Self::ClientClose(m) => m.client_id(),
            Self::AddDestination(m)
            | Self::RemoveDestination(m)
            | Self::AddRcvDestination(m)
            | Self::RemoveRcvDestination(m) => m.client_id(),
            Self::AddCounter(m) => m.client_id(),
            Self::TerminateDriver(m) => m.client_id(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        match self {
            Self::AddPublication(m) | Self::AddExclusivePublication(m) => m.correlation_id(),
            Self::RemovePublication(m) | Self::RemoveSubscription(m) | Self::RemoveCounter(m) => {
                m.correlation_id()
            }
            Self::AddSubscription(m) => m.correlation_id(),
            Self::ClientKeepalive(m) | Self::ClientClose(m) => m.correlation_id(),
            Self::AddDestination(m)
            | Self::RemoveDestination(m)
            | Self::AddRcvDestination(m)
            | Self::RemoveRcvDestination(m) => m.correlation_id(),
            Self::AddCounter(m) => m.correlation_id(),
            Self::TerminateDriver(m) => m.correlation_id(),
        }
    }
}
