//! Driver → client response writer over the broadcast buffer.

use crate::broadcast::BroadcastTransmitter;
use crate::buffer::AtomicBuffer;
use crate::error::Result;
use crate::protocol::response::{
    ClientTimeoutResponse, CounterUpdate, ErrorResponse, ImageMessage, OperationSucceeded,
    PublicationReady, SubscriptionReady, UnavailableImage,
};
use crate::protocol::{ErrorCode, response_type};
use crate::trace::warn;

/// Fields of an `ON_AVAILABLE_IMAGE` notification.
#[derive(Debug, Clone, Copy)]
pub struct ImageAvailable<'a> {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscription_registration_id: i64,
    pub subscriber_position_id: i32,
    pub log_file_name: &'a str,
    pub source_identity: &'a str,
}

/// Fields of an `ON_PUBLICATION_READY` / `ON_EXCLUSIVE_PUBLICATION_READY`.
#[derive(Debug, Clone, Copy)]
pub struct PublicationReadyInfo<'a> {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub publication_limit_counter_id: i32,
    pub channel_status_indicator_id: i32,
    pub log_file_name: &'a str,
}

/// Writes responses to every client through the to-clients broadcast.
///
/// A failed transmit is logged and dropped; clients recover through their
/// own timeouts.
#[derive(Debug)]
pub struct ClientProxy {
    transmitter: BroadcastTransmitter,
}

impl ClientProxy {
    #[must_use]
    pub const fn new(transmitter: BroadcastTransmitter) -> Self {
        Self { transmitter }
    }

    pub fn on_error(&self, correlation_id: i64, code: ErrorCode, message: &str) {
        let message = self.fit_error_message(message);
        self.send(
            response_type::ON_ERROR,
            ErrorResponse::compute_length(message.len()),
            |buffer, index| {
                ErrorResponse::wrap(buffer, index)
                    .set_offending_command_correlation_id(correlation_id)
                    .set_error_code(code)
                    .set_error_message(message);
            },
        );
    }

    /// Error raised by an endpoint rather than a command; tagged with the
    /// endpoint's channel status counter id.
    pub fn on_channel_endpoint_error(&self, status_indicator_id: i32, message: &str) {
        self.on_error(
            i64::from(status_indicator_id),
            ErrorCode::ChannelEndpointError,
            message,
        );
    }

    pub fn on_publication_ready(&self, ready: &PublicationReadyInfo<'_>, exclusive: bool) {
        let msg_type_id = if exclusive {
            response_type::ON_EXCLUSIVE_PUBLICATION_READY
        } else {
            response_type::ON_PUBLICATION_READY
        };
        self.send(
            msg_type_id,
            PublicationReady::compute_length(ready.log_file_name.len()),
            |buffer, index| {
                PublicationReady::wrap(buffer, index)
                    .set_correlation_id(ready.correlation_id)
                    .set_registration_id(ready.registration_id)
                    .set_session_id(ready.session_id)
                    .set_stream_id(ready.stream_id)
                    .set_publication_limit_counter_id(ready.publication_limit_counter_id)
                    .set_channel_status_indicator_id(ready.channel_status_indicator_id)
                    .set_log_file_name(ready.log_file_name);
            },
        );
    }

    pub fn on_subscription_ready(&self, correlation_id: i64, channel_status_indicator_id: i32) {
        self.send(
            response_type::ON_SUBSCRIPTION_READY,
            SubscriptionReady::LENGTH,
            |buffer, index| {
                SubscriptionReady::wrap(buffer, index)
                    .set_correlation_id(correlation_id)
                    .set_channel_status_indicator_id(channel_status_indicator_id);
            },
        );
    }

    pub fn on_available_image(&self, image: &ImageAvailable<'_>) {
        self.send(
            response_type::ON_AVAILABLE_IMAGE,
            ImageMessage::compute_length(image.log_file_name.len(), image.source_identity.len()),
            |buffer, index| {
                // Source identity follows the variable length log file name.
                ImageMessage::wrap(buffer, index)
                    .set_correlation_id(image.correlation_id)
                    .set_session_id(image.session_id)
                    .set_stream_id(image.stream_id)
                    .set_subscription_registration_id(image.subscription_registration_id)
                    .set_subscriber_position_id(image.subscriber_position_id)
                    .set_log_file_name(image.log_file_name)
                    .set_source_identity(image.source_identity);
            },
        );
    }

    pub fn on_unavailable_image(
        &self,
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
        channel: &str,
    ) {
        self.send(
            response_type::ON_UNAVAILABLE_IMAGE,
            UnavailableImage::compute_length(channel.len()),
            |buffer, index| {
                UnavailableImage::wrap(buffer, index)
                    .set_correlation_id(correlation_id)
                    .set_subscription_registration_id(subscription_registration_id)
                    .set_stream_id(stream_id)
                    .set_channel(channel);
            },
        );
    }

    pub fn operation_succeeded(&self, correlation_id: i64) {
        self.send(
            response_type::ON_OPERATION_SUCCESS,
            OperationSucceeded::LENGTH,
            |buffer, index| {
                OperationSucceeded::wrap(buffer, index).set_correlation_id(correlation_id);
            },
        );
    }

    pub fn on_counter_ready(&self, correlation_id: i64, counter_id: i32) {
        self.send_counter_update(response_type::ON_COUNTER_READY, correlation_id, counter_id);
    }

    pub fn on_unavailable_counter(&self, registration_id: i64, counter_id: i32) {
        self.send_counter_update(
            response_type::ON_UNAVAILABLE_COUNTER,
            registration_id,
            counter_id,
        );
    }

    pub fn on_client_timeout(&self, client_id: i64) {
        self.send(
            response_type::ON_CLIENT_TIMEOUT,
            ClientTimeoutResponse::LENGTH,
            |buffer, index| {
                ClientTimeoutResponse::wrap(buffer, index).set_client_id(client_id);
            },
        );
    }

    fn send_counter_update(&self, msg_type_id: i32, correlation_id: i64, counter_id: i32) {
        self.send(msg_type_id, CounterUpdate::LENGTH, |buffer, index| {
            CounterUpdate::wrap(buffer, index)
                .set_correlation_id(correlation_id)
                .set_counter_id(counter_id);
        });
    }

    /// Truncates `message` on a char boundary so the frame fits one record.
    fn fit_error_message<'m>(&self, message: &'m str) -> &'m str {
        let max = self
            .transmitter
            .max_msg_length()
            .saturating_sub(ErrorResponse::MIN_LENGTH);
        if message.len() <= max {
            return message;
        }
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        &message[..end]
    }

    fn send<F>(&self, msg_type_id: i32, length: usize, encode: F)
    where
        F: FnOnce(&AtomicBuffer, usize),
    {
        let result: Result<()> = self.transmitter.transmit_with(msg_type_id, length, encode);
        if let Err(err) = result {
            warn!(msg_type_id, length, %err, "dropped response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{CopyBroadcastReceiver, BroadcastReceiver, TRAILER_LENGTH};
    use crate::protocol::response::Response;

    fn proxy_and_receiver(capacity: usize) -> (ClientProxy, CopyBroadcastReceiver) {
        let buffer = AtomicBuffer::with_capacity(capacity + TRAILER_LENGTH);
        let proxy = ClientProxy::new(BroadcastTransmitter::new(buffer.clone()));
        let receiver = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer));
        (proxy, receiver)
    }

    #[test]
    fn test_publication_ready_types() {
        let (proxy, mut receiver) = proxy_and_receiver(4096);
        let ready = PublicationReadyInfo {
            correlation_id: 7,
            registration_id: 7,
            session_id: 11,
            stream_id: 1001,
            publication_limit_counter_id: 2,
            channel_status_indicator_id: 3,
            log_file_name: "7.logbuffer",
        };
        proxy.on_publication_ready(&ready, false);
        proxy.on_publication_ready(&ready, true);

        let mut seen = Vec::new();
        for _ in 0..2 {
            receiver
                .receive(|type_id, buffer, offset, length| {
                    match Response::decode(type_id, buffer, offset, length).unwrap() {
                        Some(Response::PublicationReady(r)) => {
                            assert_eq!(r.session_id(), 11);
                            assert_eq!(r.log_file_name(), "7.logbuffer");
                            seen.push(false);
                        }
                        Some(Response::ExclusivePublicationReady(r)) => {
                            assert_eq!(r.channel_status_indicator_id(), 3);
                            seen.push(true);
                        }
                        other => panic!("unexpected {other:?}"),
                    }
                })
                .unwrap();
        }
        assert_eq!(seen, vec![false, true]);
    }

    #[test]
    fn test_error_message_is_truncated_to_fit() {
        let (proxy, mut receiver) = proxy_and_receiver(1024);
        let long = "x".repeat(4096);
        proxy.on_error(5, ErrorCode::InvalidChannel, &long);

        let received = receiver
            .receive(|type_id, buffer, offset, length| {
                let Some(Response::Error(error)) =
                    Response::decode(type_id, buffer, offset, length).unwrap()
                else {
                    panic!("expected error");
                };
                assert_eq!(error.offending_command_correlation_id(), 5);
                assert_eq!(error.error_code(), ErrorCode::InvalidChannel);
                assert!(error.error_message().len() < long.len());
            })
            .unwrap();
        assert_eq!(received, 1);
    }

    #[test]
    fn test_image_fields_round_trip() {
        let (proxy, mut receiver) = proxy_and_receiver(4096);
        proxy.on_available_image(&ImageAvailable {
            correlation_id: 20,
            session_id: -4,
            stream_id: 9,
            subscription_registration_id: 30,
            subscriber_position_id: 6,
            log_file_name: "20.logbuffer",
            source_identity: "aeron:ipc",
        });

        receiver
            .receive(|type_id, buffer, offset, length| {
                let Some(Response::AvailableImage(image)) =
                    Response::decode(type_id, buffer, offset, length).unwrap()
                else {
                    panic!("expected image");
                };
                assert_eq!(image.subscription_registration_id(), 30);
                assert_eq!(image.log_file_name(), "20.logbuffer");
                assert_eq!(image.source_identity(), "aeron:ipc");
            })
            .unwrap();
    }
}
