//! Client-side command writer and CnC connection.

use std::time::Duration;

use crate::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
use crate::buffer::AtomicBuffer;
use crate::control::listener::{DriverListener, DriverListenerAdapter};
use crate::counters::CountersReader;
use crate::error::Result;
use crate::ipc::cnc::{self, CncBuffers};
use crate::ipc::shmem::ShmPath;
use crate::mpsc::ManyToOneRingBuffer;
use crate::protocol::command::{
    CorrelatedMessage, CounterMessage, DestinationMessage, PublicationMessage, RemoveMessage,
    SubscriptionMessage, TerminateDriverMessage,
};
use crate::protocol::command_type;
use crate::trace::debug;

/// Writes commands for one client into the to-driver ring.
///
/// Every method returns the correlation id the driver will echo in its
/// response. Correlation ids come from the ring's shared counter, so they are
/// unique across every client of the same driver.
#[derive(Debug)]
pub struct DriverProxy {
    ring: ManyToOneRingBuffer,
    client_id: i64,
}

impl DriverProxy {
    #[must_use]
    pub fn new(ring: ManyToOneRingBuffer, client_id: i64) -> Self {
        Self { ring, client_id }
    }

    /// Proxy whose client id is drawn from the ring's correlation counter.
    #[must_use]
    pub fn with_generated_client_id(ring: ManyToOneRingBuffer) -> Self {
        let client_id = ring.next_correlation_id();
        Self::new(ring, client_id)
    }

    #[must_use]
    pub const fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Epoch ms at which the driver last consumed from the ring.
    #[must_use]
    pub fn time_of_last_driver_keepalive_ms(&self) -> i64 {
        self.ring.consumer_heartbeat_time()
    }

    /// # Errors
    ///
    /// [`ControlError::BufferFull`](crate::error::ControlError::BufferFull)
    /// when the ring has no room, or `MalformedCommand` when the channel is
    /// too long for a single record.
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.publication(command_type::ADD_PUBLICATION, channel, stream_id)
    }

    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.publication(command_type::ADD_EXCLUSIVE_PUBLICATION, channel, stream_id)
    }

    /// # Errors
    ///
    /// `BufferFull` when the ring has no room.
    pub fn remove_publication(&self, registration_id: i64) -> Result<i64> {
        self.remove(command_type::REMOVE_PUBLICATION, registration_id)
    }

    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.send(
            command_type::ADD_SUBSCRIPTION,
            SubscriptionMessage::compute_length(channel.len()),
            |buffer, index, correlation_id| {
                SubscriptionMessage::wrap(buffer, index)
                    .set_client_id(self.client_id)
                    .set_correlation_id(correlation_id)
                    .set_registration_correlation_id(-1)
                    .set_stream_id(stream_id)
                    .set_channel(channel);
            },
        )
    }

    /// # Errors
    ///
    /// `BufferFull` when the ring has no room.
    pub fn remove_subscription(&self, registration_id: i64) -> Result<i64> {
        self.remove(command_type::REMOVE_SUBSCRIPTION, registration_id)
    }

    /// Adds a send destination to a manual control-mode publication.
    ///
    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn add_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        self.destination(command_type::ADD_DESTINATION, registration_id, channel)
    }

    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn remove_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        self.destination(command_type::REMOVE_DESTINATION, registration_id, channel)
    }

    /// Adds a receive destination to a manual control-mode subscription.
    ///
    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn add_rcv_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        self.destination(command_type::ADD_RCV_DESTINATION, registration_id, channel)
    }

    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn remove_rcv_destination(&self, registration_id: i64, channel: &str) -> Result<i64> {
        self.destination(command_type::REMOVE_RCV_DESTINATION, registration_id, channel)
    }

    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<i64> {
        self.send(
            command_type::ADD_COUNTER,
            CounterMessage::compute_length(key.len(), label.len()),
            |buffer, index, correlation_id| {
                CounterMessage::wrap(buffer, index)
                    .set_client_id(self.client_id)
                    .set_correlation_id(correlation_id)
                    .set_type_id(type_id)
                    .set_key(key)
                    .set_label(label);
            },
        )
    }

    /// # Errors
    ///
    /// `BufferFull` when the ring has no room.
    pub fn remove_counter(&self, registration_id: i64) -> Result<i64> {
        self.remove(command_type::REMOVE_COUNTER, registration_id)
    }

    /// # Errors
    ///
    /// `BufferFull` when the ring has no room.
    pub fn send_client_keepalive(&self) -> Result<i64> {
        self.correlated(command_type::CLIENT_KEEPALIVE)
    }

    /// Releases every resource of this client on the driver.
    ///
    /// # Errors
    ///
    /// `BufferFull` when the ring has no room.
    pub fn client_close(&self) -> Result<i64> {
        self.correlated(command_type::CLIENT_CLOSE)
    }

    /// Asks the driver to shut down; its termination validator decides.
    ///
    /// # Errors
    ///
    /// As for [`add_publication`](Self::add_publication).
    pub fn terminate_driver(&self, token: &[u8]) -> Result<i64> {
        self.send(
            command_type::TERMINATE_DRIVER,
            TerminateDriverMessage::compute_length(token.len()),
            |buffer, index, correlation_id| {
                TerminateDriverMessage::wrap(buffer, index)
                    .set_client_id(self.client_id)
                    .set_correlation_id(correlation_id)
                    .set_token(token);
            },
        )
    }

    fn publication(&self, type_id: i32, channel: &str, stream_id: i32) -> Result<i64> {
        self.send(
            type_id,
            PublicationMessage::compute_length(channel.len()),
            |buffer, index, correlation_id| {
                PublicationMessage::wrap(buffer, index)
                    .set_client_id(self.client_id)
                    .set_correlation_id(correlation_id)
                    .set_stream_id(stream_id)
                    .set_channel(channel);
            },
        )
    }

    fn remove(&self, type_id: i32, registration_id: i64) -> Result<i64> {
        self.send(type_id, RemoveMessage::LENGTH, |buffer, index, correlation_id| {
            RemoveMessage::wrap(buffer, index)
                .set_client_id(self.client_id)
                .set_correlation_id(correlation_id)
                .set_registration_id(registration_id);
        })
    }

    fn destination(&self, type_id: i32, registration_id: i64, channel: &str) -> Result<i64> {
        self.send(
            type_id,
            DestinationMessage::compute_length(channel.len()),
            |buffer, index, correlation_id| {
                DestinationMessage::wrap(buffer, index)
                    .set_client_id(self.client_id)
                    .set_correlation_id(correlation_id)
                    .set_registration_correlation_id(registration_id)
                    .set_channel(channel);
            },
        )
    }

    fn correlated(&self, type_id: i32) -> Result<i64> {
        self.send(type_id, CorrelatedMessage::LENGTH, |buffer, index, correlation_id| {
            CorrelatedMessage::wrap(buffer, index)
                .set_client_id(self.client_id)
                .set_correlation_id(correlation_id);
        })
    }

    /// Claims `length` bytes, lets `encode` fill them in place and commits.
    fn send<F>(&self, type_id: i32, length: usize, encode: F) -> Result<i64>
    where
        F: FnOnce(&AtomicBuffer, usize, i64),
    {
        let correlation_id = self.ring.next_correlation_id();
        let index = self.ring.try_claim(type_id, length)?;
        encode(self.ring.buffer(), index, correlation_id);
        self.ring.commit(index);
        Ok(correlation_id)
    }
}

/// A client's view of a running driver's CnC region.
#[derive(Debug)]
pub struct DriverConnection {
    cnc: CncBuffers,
    proxy: DriverProxy,
    counters: CountersReader,
}

impl DriverConnection {
    /// Maps the driver's CnC object, waiting up to `timeout` for it to be
    /// initialized.
    ///
    /// # Errors
    ///
    /// [`ControlError::Shm`](crate::error::ControlError::Shm) if the region
    /// is missing, incompatible or never initialized.
    pub fn connect(path: &ShmPath, timeout: Duration) -> Result<Self> {
        let cnc = cnc::open(path, timeout)?;
        let connection = Self::from_buffers(cnc);
        debug!(
            path = %path,
            client_id = connection.proxy.client_id(),
            "connected to driver"
        );
        Ok(connection)
    }

    /// Connection over buffers already mapped in this process.
    #[must_use]
    pub fn from_buffers(cnc: CncBuffers) -> Self {
        let ring = ManyToOneRingBuffer::new(cnc.to_driver_buffer().clone());
        let counters = CountersReader::new(
            cnc.counters_metadata_buffer().clone(),
            cnc.counters_values_buffer().clone(),
        );
        Self {
            proxy: DriverProxy::with_generated_client_id(ring),
            counters,
            cnc,
        }
    }

    #[must_use]
    pub const fn proxy(&self) -> &DriverProxy {
        &self.proxy
    }

    #[must_use]
    pub const fn counters_reader(&self) -> &CountersReader {
        &self.counters
    }

    #[must_use]
    pub const fn cnc(&self) -> &CncBuffers {
        &self.cnc
    }

    /// True if the driver's conductor has heartbeated within the client
    /// liveness timeout of `now_ms`.
    #[must_use]
    pub fn is_driver_active(&self, now_ms: i64) -> bool {
        self.cnc.is_driver_active(now_ms)
    }

    /// A new receiver over the to-clients broadcast, starting at its latest
    /// record.
    #[must_use]
    pub fn broadcast_receiver(&self) -> CopyBroadcastReceiver {
        CopyBroadcastReceiver::new(BroadcastReceiver::new(
            self.cnc.to_clients_buffer().clone(),
        ))
    }

    #[must_use]
    pub fn listener_adapter<L: DriverListener>(&self, listener: L) -> DriverListenerAdapter<L> {
        DriverListenerAdapter::new(self.broadcast_receiver(), listener)
    }
}
