//! Client-side dispatch of driver responses.

use crate::broadcast::CopyBroadcastReceiver;
use crate::buffer::AtomicBuffer;
use crate::error::Result;
use crate::protocol::ErrorCode;
use crate::protocol::response::{ImageMessage, PublicationReady, Response, UnavailableImage};
use crate::trace::{trace, warn};

/// Handler for responses and notifications broadcast by the driver.
///
/// Every method defaults to doing nothing, so a listener only implements
/// what it cares about. Flyweight arguments are views into a scratch copy
/// and are only valid for the duration of the call.
pub trait DriverListener {
    fn on_error(&mut self, correlation_id: i64, code: ErrorCode, message: &str) {
        let _ = (correlation_id, code, message);
    }

    /// A channel endpoint failed; `status_indicator_id` is the counter id of
    /// the endpoint's channel status indicator.
    fn on_channel_endpoint_error(&mut self, status_indicator_id: i64, message: &str) {
        let _ = (status_indicator_id, message);
    }

    fn on_new_publication(&mut self, ready: &PublicationReady<'_>) {
        let _ = ready;
    }

    fn on_new_exclusive_publication(&mut self, ready: &PublicationReady<'_>) {
        let _ = ready;
    }

    fn on_subscription_ready(&mut self, correlation_id: i64, channel_status_id: i32) {
        let _ = (correlation_id, channel_status_id);
    }

    fn on_available_image(&mut self, image: &ImageMessage<'_>) {
        let _ = image;
    }

    fn on_unavailable_image(&mut self, image: &UnavailableImage<'_>) {
        let _ = image;
    }

    fn on_operation_success(&mut self, correlation_id: i64) {
        let _ = correlation_id;
    }

    fn on_available_counter(&mut self, correlation_id: i64, counter_id: i32) {
        let _ = (correlation_id, counter_id);
    }

    fn on_unavailable_counter(&mut self, correlation_id: i64, counter_id: i32) {
        let _ = (correlation_id, counter_id);
    }

    fn on_client_timeout(&mut self, client_id: i64) {
        let _ = client_id;
    }
}

/// Drains the to-clients broadcast into a [`DriverListener`].
#[derive(Debug)]
pub struct DriverListenerAdapter<L> {
    receiver: CopyBroadcastReceiver,
    listener: L,
}

impl<L: DriverListener> DriverListenerAdapter<L> {
    #[must_use]
    pub fn new(receiver: CopyBroadcastReceiver, listener: L) -> Self {
        Self { receiver, listener }
    }

    #[must_use]
    pub const fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    #[must_use]
    pub fn into_listener(self) -> L {
        self.listener
    }

    /// Dispatches every record currently available.
    ///
    /// Returns the number of records handed to the listener. Records with an
    /// unknown type id or a malformed layout are skipped and not counted.
    ///
    /// # Errors
    ///
    /// [`ControlError::DataLoss`](crate::error::ControlError::DataLoss) when
    /// the driver lapped this receiver. Records dispatched before the loss
    /// was detected have already reached the listener.
    pub fn receive_messages(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let listener = &mut self.listener;
            let received = self.receiver.receive(|type_id, buffer, offset, length| {
                if dispatch(listener, type_id, buffer, offset, length) {
                    dispatched += 1;
                }
            })?;
            if received == 0 {
                return Ok(dispatched);
            }
        }
    }
}

fn dispatch<L: DriverListener>(
    listener: &mut L,
    type_id: i32,
    buffer: &AtomicBuffer,
    offset: usize,
    length: usize,
) -> bool {
    let response = match Response::decode(type_id, buffer, offset, length) {
        Ok(Some(response)) => response,
        Ok(None) => {
            trace!(type_id, "skipping unknown response type");
            return false;
        }
        Err(err) => {
            warn!(type_id, length, error = %err, "skipping malformed response");
            return false;
        }
    };

    match response {
        Response::Error(error) => {
            let code = error.error_code();
            if code == ErrorCode::ChannelEndpointError {
                listener.on_channel_endpoint_error(
                    error.offending_command_correlation_id(),
                    &error.error_message(),
                );
            } else {
                listener.on_error(
                    error.offending_command_correlation_id(),
                    code,
                    &error.error_message(),
                );
            }
        }
        Response::AvailableImage(image) => listener.on_available_image(&image),
        Response::PublicationReady(ready) => listener.on_new_publication(&ready),
        Response::OperationSuccess(success) => {
            listener.on_operation_success(success.correlation_id());
        }
        Response::UnavailableImage(image) => listener.on_unavailable_image(&image),
        Response::ExclusivePublicationReady(ready) => listener.on_new_exclusive_publication(&ready),
        Response::SubscriptionReady(ready) => {
            listener.on_subscription_ready(ready.correlation_id(), ready.channel_status_indicator_id());
        }
        Response::CounterReady(counter) => {
            listener.on_available_counter(counter.correlation_id(), counter.counter_id());
        }
        Response::UnavailableCounter(counter) => {
            listener.on_unavailable_counter(counter.correlation_id(), counter.counter_id());
        }
        Response::ClientTimeout(timeout) => listener.on_client_timeout(timeout.client_id()),
    }

    true
}
