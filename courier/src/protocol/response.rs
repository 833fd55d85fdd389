//! Response and notification flyweights (driver → clients).

use super::{
    ErrorCode, LENGTH_PREFIX, check_min_length, checked_field_length, field_length, next_field,
    response_type, string_at,
};
use crate::buffer::AtomicBuffer;
use crate::error::Result;

/// `ON_ERROR`: a failed request, tagged with the request's correlation id.
#[derive(Debug, Clone, Copy)]
pub struct ErrorResponse<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> ErrorResponse<'a> {
    const OFFENDING_CORRELATION_ID_OFFSET: usize = 0;
    const ERROR_CODE_OFFSET: usize = 8;
    const ERROR_MESSAGE_OFFSET: usize = 12;
    pub const MIN_LENGTH: usize = Self::ERROR_MESSAGE_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the message overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "error response")?;
        checked_field_length(
            buffer,
            offset,
            Self::ERROR_MESSAGE_OFFSET,
            frame_length,
            "error response message",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    /// Correlation id of the failed request (the channel status indicator id
    /// for `CHANNEL_ENDPOINT_ERROR`).
    #[must_use]
    pub fn offending_command_correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::OFFENDING_CORRELATION_ID_OFFSET)
    }

    pub fn set_offending_command_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::OFFENDING_CORRELATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from(self.buffer.get_i32(self.offset + Self::ERROR_CODE_OFFSET))
    }

    #[must_use]
    pub fn error_code_value(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::ERROR_CODE_OFFSET)
    }

    pub fn set_error_code(&self, code: ErrorCode) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::ERROR_CODE_OFFSET, code.as_i32());
        self
    }

    #[must_use]
    pub fn error_message(&self) -> String {
        string_at(self.buffer, self.offset + Self::ERROR_MESSAGE_OFFSET)
    }

    pub fn set_error_message(&self, message: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::ERROR_MESSAGE_OFFSET, message);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::ERROR_MESSAGE_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(message_length: usize) -> usize {
        Self::MIN_LENGTH + message_length
    }
}

/// `ON_AVAILABLE_IMAGE`: a publication became visible to a subscription.
#[derive(Debug, Clone, Copy)]
pub struct ImageMessage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> ImageMessage<'a> {
    const CORRELATION_ID_OFFSET: usize = 0;
    const SESSION_ID_OFFSET: usize = 8;
    const STREAM_ID_OFFSET: usize = 12;
    const SUBSCRIPTION_REGISTRATION_ID_OFFSET: usize = 16;
    const SUBSCRIBER_POSITION_ID_OFFSET: usize = 24;
    const LOG_FILE_OFFSET: usize = 28;
    pub const MIN_LENGTH: usize = Self::LOG_FILE_OFFSET + LENGTH_PREFIX + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or a string overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "image message")?;
        let log_file_length = checked_field_length(
            buffer,
            offset,
            Self::LOG_FILE_OFFSET,
            frame_length,
            "image message log file",
        )?;
        checked_field_length(
            buffer,
            offset,
            next_field(Self::LOG_FILE_OFFSET, log_file_length),
            frame_length,
            "image message source identity",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    /// Registration id of the publication backing the image.
    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::CORRELATION_ID_OFFSET)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::CORRELATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::SESSION_ID_OFFSET)
    }

    pub fn set_session_id(&self, session_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::SESSION_ID_OFFSET, session_id);
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
    pub fn subscription_registration_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::SUBSCRIPTION_REGISTRATION_ID_OFFSET)
    }

    pub fn set_subscription_registration_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::SUBSCRIPTION_REGISTRATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn subscriber_position_id(&self) -> i32 {
        self.buffer
            .get_i32(self.offset + Self::SUBSCRIBER_POSITION_ID_OFFSET)
    }

    pub fn set_subscriber_position_id(&self, id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::SUBSCRIBER_POSITION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn log_file_name(&self) -> String {
        string_at(self.buffer, self.offset + Self::LOG_FILE_OFFSET)
    }

    /// Must be set before the source identity.
    pub fn set_log_file_name(&self, log_file: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::LOG_FILE_OFFSET, log_file);
        self
    }

    #[must_use]
    pub fn source_identity(&self) -> String {
        string_at(self.buffer, self.offset + self.source_identity_offset())
    }

    pub fn set_source_identity(&self, source_identity: &str) -> &Self {
        self.buffer
            .put_string(self.offset + self.source_identity_offset(), source_identity);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        let field = self.source_identity_offset();
        field + LENGTH_PREFIX + field_length(self.buffer, self.offset + field)
    }

    #[must_use]
    pub const fn compute_length(log_file_length: usize, source_identity_length: usize) -> usize {
        next_field(Self::LOG_FILE_OFFSET, log_file_length) + LENGTH_PREFIX + source_identity_length
    }

    fn source_identity_offset(&self) -> usize {
        let log_file_length = field_length(self.buffer, self.offset + Self::LOG_FILE_OFFSET);
        next_field(Self::LOG_FILE_OFFSET, log_file_length)
    }
}

/// `ON_PUBLICATION_READY` and `ON_EXCLUSIVE_PUBLICATION_READY`.
#[derive(Debug, Clone, Copy)]
pub struct PublicationReady<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> PublicationReady<'a> {
    const CORRELATION_ID_OFFSET: usize = 0;
    const REGISTRATION_ID_OFFSET: usize = 8;
    const SESSION_ID_OFFSET: usize = 16;
    const STREAM_ID_OFFSET: usize = 20;
    const PUBLICATION_LIMIT_COUNTER_ID_OFFSET: usize = 24;
    const CHANNEL_STATUS_INDICATOR_ID_OFFSET: usize = 28;
    const LOG_FILE_OFFSET: usize = 32;
    pub const MIN_LENGTH: usize = Self::LOG_FILE_OFFSET + LENGTH_PREFIX;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short or the log file overruns it.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::MIN_LENGTH, "publication ready")?;
        checked_field_length(
            buffer,
            offset,
            Self::LOG_FILE_OFFSET,
            frame_length,
            "publication ready log file",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::CORRELATION_ID_OFFSET)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::CORRELATION_ID_OFFSET, id);
        self
    }

    /// Registration id of the (possibly shared) publication.
    #[must_use]
    pub fn registration_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::REGISTRATION_ID_OFFSET)
    }

    pub fn set_registration_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::REGISTRATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> i32 {
        self.buffer.get_i32(self.offset + Self::SESSION_ID_OFFSET)
    }

    pub fn set_session_id(&self, session_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::SESSION_ID_OFFSET, session_id);
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
    pub fn publication_limit_counter_id(&self) -> i32 {
        self.buffer
            .get_i32(self.offset + Self::PUBLICATION_LIMIT_COUNTER_ID_OFFSET)
    }

    pub fn set_publication_limit_counter_id(&self, id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::PUBLICATION_LIMIT_COUNTER_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn channel_status_indicator_id(&self) -> i32 {
        self.buffer
            .get_i32(self.offset + Self::CHANNEL_STATUS_INDICATOR_ID_OFFSET)
    }

    pub fn set_channel_status_indicator_id(&self, id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::CHANNEL_STATUS_INDICATOR_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn log_file_name(&self) -> String {
        string_at(self.buffer, self.offset + Self::LOG_FILE_OFFSET)
    }

    pub fn set_log_file_name(&self, log_file: &str) -> &Self {
        self.buffer
            .put_string(self.offset + Self::LOG_FILE_OFFSET, log_file);
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + field_length(self.buffer, self.offset + Self::LOG_FILE_OFFSET)
    }

    #[must_use]
    pub const fn compute_length(log_file_length: usize) -> usize {
        Self::MIN_LENGTH + log_file_length
    }
}

/// `ON_OPERATION_SUCCESS`.
#[derive(Debug, Clone, Copy)]
pub struct OperationSucceeded<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> OperationSucceeded<'a> {
    pub const LENGTH: usize = 8;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "operation succeeded")?;
        Ok(Self::wrap(buffer, offset))
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer.get_i64(self.offset)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer.put_i64(self.offset, id);
        self
    }
}

/// `ON_UNAVAILABLE_IMAGE`: a publication is no longer visible to a
/// subscription.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableImage<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> UnavailableImage<'a> {
    const CORRELATION_ID_OFFSET: usize = 0;
    const SUBSCRIPTION_REGISTRATION_ID_OFFSET: usize = 8;
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
        check_min_length(frame_length, Self::MIN_LENGTH, "unavailable image")?;
        checked_field_length(
            buffer,
            offset,
            Self::CHANNEL_OFFSET,
            frame_length,
            "unavailable image channel",
        )?;
        Ok(Self::wrap(buffer, offset))
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::CORRELATION_ID_OFFSET)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::CORRELATION_ID_OFFSET, id);
        self
    }

    #[must_use]
    pub fn subscription_registration_id(&self) -> i64 {
        self.buffer
            .get_i64(self.offset + Self::SUBSCRIPTION_REGISTRATION_ID_OFFSET)
    }

    pub fn set_subscription_registration_id(&self, id: i64) -> &Self {
        self.buffer
            .put_i64(self.offset + Self::SUBSCRIPTION_REGISTRATION_ID_OFFSET, id);
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

/// `ON_SUBSCRIPTION_READY`.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionReady<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> SubscriptionReady<'a> {
    const CHANNEL_STATUS_INDICATOR_ID_OFFSET: usize = 8;
    pub const LENGTH: usize = 12;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "subscription ready")?;
        Ok(Self::wrap(buffer, offset))
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer.get_i64(self.offset)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer.put_i64(self.offset, id);
        self
    }

    /// Channel status counter of the receive endpoint, or -1 for IPC.
    #[must_use]
    pub fn channel_status_indicator_id(&self) -> i32 {
        self.buffer
            .get_i32(self.offset + Self::CHANNEL_STATUS_INDICATOR_ID_OFFSET)
    }

    pub fn set_channel_status_indicator_id(&self, id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::CHANNEL_STATUS_INDICATOR_ID_OFFSET, id);
        self
    }
}

/// `ON_COUNTER_READY` and `ON_UNAVAILABLE_COUNTER`.
#[derive(Debug, Clone, Copy)]
pub struct CounterUpdate<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> CounterUpdate<'a> {
    const COUNTER_ID_OFFSET: usize = 8;
    pub const LENGTH: usize = 12;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "counter update")?;
        Ok(Self::wrap(buffer, offset))
    }

    /// Registration id of the counter.
    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.buffer.get_i64(self.offset)
    }

    pub fn set_correlation_id(&self, id: i64) -> &Self {
        self.buffer.put_i64(self.offset, id);
        self
    }

    #[must_use]
    pub fn counter_id(&self) -> i32 {
        self.buffer
            .get_i32(self.offset + Self::COUNTER_ID_OFFSET)
    }

    pub fn set_counter_id(&self, counter_id: i32) -> &Self {
        self.buffer
            .put_i32(self.offset + Self::COUNTER_ID_OFFSET, counter_id);
        self
    }
}

/// `ON_CLIENT_TIMEOUT`.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeoutResponse<'a> {
    buffer: &'a AtomicBuffer,
    offset: usize,
}

impl<'a> ClientTimeoutResponse<'a> {
    pub const LENGTH: usize = 8;

    #[must_use]
    pub const fn wrap(buffer: &'a AtomicBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// # Errors
    ///
    /// `MalformedCommand` if the frame is short.
    pub fn wrap_checked(buffer: &'a AtomicBuffer, offset: usize, frame_length: usize) -> Result<Self> {
        check_min_length(frame_length, Self::LENGTH, "client timeout")?;
        Ok(Self::wrap(buffer, offset))
    }

    #[must_use]
    pub fn client_id(&self) -> i64 {
        self.buffer.get_i64(self.offset)
    }

    pub fn set_client_id(&self, client_id: i64) -> &Self {
        self.buffer.put_i64(self.offset, client_id);
        self
    }
}

/// Every response or notification the driver broadcasts, keyed by type id.
#[derive(Debug, Clone, Copy)]
pub enum Response<'a> {
    Error(ErrorResponse<'a>),
    AvailableImage(ImageMessage<'a>),
    PublicationReady(PublicationReady<'a>),
    OperationSuccess(OperationSucceeded<'a>),
    UnavailableImage(UnavailableImage<'a>),
    ExclusivePublicationReady(PublicationReady<'a>),
    SubscriptionReady(SubscriptionReady<'a>),
    CounterReady(CounterUpdate<'a>),
    UnavailableCounter(CounterUpdate<'a>),
    ClientTimeout(ClientTimeoutResponse<'a>),
}

impl<'a> Response<'a> {
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
        use response_type::*;

        let response = match type_id {
            ON_ERROR => Self::Error(ErrorResponse::wrap_checked(buffer, offset, length)?),
            ON_AVAILABLE_IMAGE => {
                Self::AvailableImage(ImageMessage::wrap_checked(buffer, offset, length)?)
            }
            ON_PUBLICATION_READY => {
                Self::PublicationReady(PublicationReady::wrap_checked(buffer, offset, length)?)
            }
            ON_OPERATION_SUCCESS => {
                Self::OperationSuccess(OperationSucceeded::wrap_checked(buffer, offset, length)?)
            }
            ON_UNAVAILABLE_IMAGE => {
                Self::UnavailableImage(UnavailableImage::wrap_checked(buffer, offset, length)?)
            }
            ON_EXCLUSIVE_PUBLICATION_READY => Self::ExclusivePublicationReady(
                PublicationReady::wrap_checked(buffer, offset, length)?,
            ),
            ON_SUBSCRIPTION_READY => {
                Self::SubscriptionReady(SubscriptionReady::wrap_checked(buffer, offset, length)?)
            }
            ON_COUNTER_READY => {
                Self::CounterReady(CounterUpdate::wrap_checked(buffer, offset, length)?)
            }
            ON_UNAVAILABLE_COUNTER => {
                Self::UnavailableCounter(CounterUpdate::wrap_checked(buffer, offset, length)?)
            }
            ON_CLIENT_TIMEOUT => {
                Self::ClientTimeout(ClientTimeoutResponse::wrap_checked(buffer, offset, length)?)
            }
            _ => return Ok(None),
        };

        Ok(Some(response))
    }

    #[must_use]
    pub const fn type_id(&self) -> i32 {
        use response_type::*;

        match self {
            Self::Error(_) => ON_ERROR,
            Self::AvailableImage(_) => ON_AVAILABLE_IMAGE,
            Self::PublicationReady(_) => ON_PUBLICATION_READY,
            Self::OperationSuccess(_) => ON_OPERATION_SUCCESS,
            Self::UnavailableImage(_) => ON_UNAVAILABLE_IMAGE,
            Self::ExclusivePublicationReady(_) => ON_EXCLUSIVE_PUBLICATION_READY,
            Self::SubscriptionReady(_) => ON_SUBSCRIPTION_READY,
            Self::CounterReady(_) => ON_COUNTER_READY,
            Self::UnavailableCounter(_) => ON_UNAVAILABLE_COUNTER,
            Self::ClientTimeout(_) => ON_CLIENT_TIMEOUT,
        }
    }
}
