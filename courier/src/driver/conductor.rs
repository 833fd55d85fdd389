//! The driver conductor.
//!
//! A single duty cycle owns every piece of control plane state: it drains
//! client commands from the to-driver ring, applies them to the
//! [`Registry`], and answers on the to-clients broadcast. Timers run on the
//! same thread, once per timer interval:
//!
//! - client liveness: sessions without a heartbeat for the liveness timeout
//!   are evicted and their resources released;
//! - ring unblock: a producer that died between claim and commit is
//!   skipped over once the consumer has been stuck for a liveness timeout;
//! - counter reclamation: freed counter ids become reusable after the
//!   free-to-reuse timeout.

use std::sync::Arc;
use std::time::Duration;

use super::client_proxy::{ClientProxy, ImageAvailable, PublicationReadyInfo};
use super::config::{DriverConfig, TerminationValidator};
use super::registry::{
    ChannelEndpoint, ChannelKey, CounterLink, ImageLink, NO_ID_ALLOCATED, Publication, Registry,
    ResourceLink, Subscription,
};
use super::transport::ChannelTransport;
use crate::broadcast::BroadcastTransmitter;
use crate::buffer::AtomicBuffer;
use crate::counters::{
    CHANNEL_STATUS_TYPE_ID, CountersManager, CountersReader, PUBLISHER_LIMIT_TYPE_ID,
    SUBSCRIBER_POSITION_TYPE_ID,
};
use crate::error::{ControlError, ResourceKind, Result};
use crate::ipc::cnc::CncBuffers;
use crate::mpsc::ManyToOneRingBuffer;
use crate::protocol::command::{Command, CorrelatedMessage};
use crate::runtime::{EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};
use crate::trace::{debug, info, trace, warn};
use crate::uri::{BindPreference, ChannelUri, Media, ResolvedEndpoint, UdpChannel};

/// Commands drained from the to-driver ring per duty cycle.
pub const COMMAND_DRAIN_LIMIT: usize = 10;

/// Source identity reported for IPC images.
pub const IPC_SOURCE_IDENTITY: &str = "aeron:ipc";

/// Channel status counter value while the endpoint is usable.
pub const CHANNEL_STATUS_ACTIVE: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConductorState {
    Running,
    /// A termination request was accepted; the runner should stop.
    Terminated,
}

/// Everything the conductor needs besides the CnC buffers.
pub struct ConductorContext {
    pub client_liveness_timeout: Duration,
    pub timer_interval: Duration,
    pub counter_free_to_reuse_timeout: Duration,
    pub termination_validator: Arc<dyn TerminationValidator>,
    pub transport: Box<dyn ChannelTransport>,
    pub nano_clock: Box<dyn NanoClock>,
    pub epoch_clock: Box<dyn EpochClock>,
}

impl ConductorContext {
    /// Takes the conductor settings out of `config`, with system clocks.
    #[must_use]
    pub fn from_config(config: DriverConfig) -> Self {
        Self {
            client_liveness_timeout: config.client_liveness_timeout,
            timer_interval: config.timer_interval,
            counter_free_to_reuse_timeout: config.counter_free_to_reuse_timeout,
            termination_validator: config.termination_validator,
            transport: config.transport,
            nano_clock: Box::new(SystemNanoClock::new()),
            epoch_clock: Box::new(SystemEpochClock),
        }
    }

    #[must_use]
    pub fn with_clocks(
        mut self,
        nano_clock: Box<dyn NanoClock>,
        epoch_clock: Box<dyn EpochClock>,
    ) -> Self {
        self.nano_clock = nano_clock;
        self.epoch_clock = epoch_clock;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn ChannelTransport>) -> Self {
        self.transport = transport;
        self
    }
}

/// Notification produced while releasing resources, sent afterwards.
#[derive(Debug)]
enum Release {
    UnavailableCounter {
        registration_id: i64,
        counter_id: i32,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
        channel: String,
    },
}

pub struct DriverConductor {
    to_driver: ManyToOneRingBuffer,
    client_proxy: ClientProxy,
    counters: CountersManager,
    registry: Registry,
    transport: Box<dyn ChannelTransport>,
    termination_validator: Arc<dyn TerminationValidator>,
    nano_clock: Box<dyn NanoClock>,
    epoch_clock: Box<dyn EpochClock>,
    client_liveness_timeout_ns: i64,
    timer_interval_ns: i64,
    time_of_last_timer_check_ns: i64,
    last_consumer_position: i64,
    time_of_last_consumer_position_change_ns: i64,
    state: ConductorState,
}

impl DriverConductor {
    /// Builds a conductor over the driver's side of `cnc`.
    #[must_use]
    pub fn new(cnc: &CncBuffers, context: ConductorContext) -> Self {
        let to_driver = ManyToOneRingBuffer::new(cnc.to_driver_buffer().clone());
        let client_proxy =
            ClientProxy::new(BroadcastTransmitter::new(cnc.to_clients_buffer().clone()));
        let counters = CountersManager::new(
            cnc.counters_metadata_buffer().clone(),
            cnc.counters_values_buffer().clone(),
            duration_ms(context.counter_free_to_reuse_timeout),
        );

        let now_ns = context.nano_clock.nano_time();
        to_driver.set_consumer_heartbeat_time(context.epoch_clock.time_millis());
        let last_consumer_position = to_driver.consumer_position();

        Self {
            to_driver,
            client_proxy,
            counters,
            registry: Registry::new(),
            transport: context.transport,
            termination_validator: context.termination_validator,
            nano_clock: context.nano_clock,
            epoch_clock: context.epoch_clock,
            client_liveness_timeout_ns: duration_ns(context.client_liveness_timeout),
            timer_interval_ns: duration_ns(context.timer_interval),
            time_of_last_timer_check_ns: now_ns,
            last_consumer_position,
            time_of_last_consumer_position_change_ns: now_ns,
            state: ConductorState::Running,
        }
    }

    /// One duty cycle. Returns the amount of work done; zero lets the caller
    /// idle.
    pub fn do_work(&mut self) -> usize {
        let ring = self.to_driver.clone();
        let mut work_count = ring.read(
            |msg_type_id, buffer, offset, length| {
                self.on_command(msg_type_id, buffer, offset, length);
            },
            COMMAND_DRAIN_LIMIT,
        );

        let now_ns = self.nano_clock.nano_time();
        if now_ns - self.time_of_last_timer_check_ns >= self.timer_interval_ns {
            self.time_of_last_timer_check_ns = now_ns;
            work_count += self.on_timer(now_ns);
        }

        work_count
    }

    fn on_timer(&mut self, now_ns: i64) -> usize {
        let now_ms = self.epoch_clock.time_millis();
        self.to_driver.set_consumer_heartbeat_time(now_ms);

        self.check_client_liveness(now_ns)
            + self.check_ring_unblock(now_ns)
            + self.counters.reclaim_expired(now_ms)
    }

    #[must_use]
    pub const fn state(&self) -> ConductorState {
        self.state
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == ConductorState::Terminated
    }

    #[must_use]
    pub fn is_client_active(&self, client_id: i64) -> bool {
        self.registry.client(client_id).is_some()
    }

    #[must_use]
    pub fn publication(&self, registration_id: i64) -> Option<&Publication> {
        self.registry.publication(registration_id)
    }

    #[must_use]
    pub fn subscription(&self, registration_id: i64) -> Option<&Subscription> {
        self.registry.subscription(registration_id)
    }

    #[must_use]
    pub fn counters_reader(&self) -> &CountersReader {
        self.counters.reader()
    }

    #[must_use]
    pub fn send_endpoint(&self, canonical_form: &str) -> Option<&ChannelEndpoint> {
        self.registry.send_endpoint(canonical_form)
    }

    #[must_use]
    pub fn receive_endpoint(&self, canonical_form: &str) -> Option<&ChannelEndpoint> {
        self.registry.receive_endpoint(canonical_form)
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Releases every client's resources without notifying anyone.
    pub fn close(&mut self) {
        let client_ids: Vec<i64> = self.registry.clients().map(|c| c.client_id()).collect();
        for client_id in client_ids {
            drop(self.release_client(client_id));
        }
    }

    fn on_command(&mut self, msg_type_id: i32, buffer: &AtomicBuffer, offset: usize, length: usize) {
        let command = match Command::decode(msg_type_id, buffer, offset, length) {
            Ok(Some(command)) => command,
            Ok(None) => {
                warn!(msg_type_id, "skipping unknown command type");
                return;
            }
            Err(err) => {
                let correlation_id = if length >= CorrelatedMessage::LENGTH {
                    CorrelatedMessage::wrap(buffer, offset).correlation_id()
                } else {
                    0
                };
                warn!(msg_type_id, correlation_id, %err, "malformed command");
                self.client_proxy
                    .on_error(correlation_id, err.error_code(), &err.to_string());
                return;
            }
        };

        let client_id = command.client_id();
        let correlation_id = command.correlation_id();
        trace!(msg_type_id, client_id, correlation_id, "command");

        if !matches!(command, Command::ClientClose(_)) {
            let now_ns = self.nano_clock.nano_time();
            self.registry.touch_client(client_id, now_ns);
        }

        let result = match command {
            Command::AddPublication(msg) => self.on_add_publication(
                client_id,
                correlation_id,
                msg.stream_id(),
                &msg.channel(),
                false,
            ),
            Command::AddExclusivePublication(msg) => self.on_add_publication(
                client_id,
                correlation_id,
                msg.stream_id(),
                &msg.channel(),
                true,
            ),
            Command::RemovePublication(msg) => {
                self.on_remove_publication(client_id, correlation_id, msg.registration_id())
            }
            Command::AddSubscription(msg) => self.on_add_subscription(
                client_id,
                correlation_id,
                msg.stream_id(),
                &msg.channel(),
            ),
            Command::RemoveSubscription(msg) => {
                self.on_remove_subscription(client_id, correlation_id, msg.registration_id())
            }
            Command::AddCounter(msg) => self.on_add_counter(
                client_id,
                correlation_id,
                msg.type_id(),
                &msg.key(),
                &msg.label(),
            ),
            Command::RemoveCounter(msg) => {
                self.on_remove_counter(client_id, correlation_id, msg.registration_id())
            }
            Command::AddDestination(msg) => self.on_add_destination(
                correlation_id,
                msg.registration_correlation_id(),
                &msg.channel(),
            ),
            Command::RemoveDestination(msg) => self.on_remove_destination(
                correlation_id,
                msg.registration_correlation_id(),
                &msg.channel(),
            ),
            Command::AddRcvDestination(msg) => self.on_add_rcv_destination(
                correlation_id,
                msg.registration_correlation_id(),
                &msg.channel(),
            ),
            Command::RemoveRcvDestination(msg) => self.on_remove_rcv_destination(
                correlation_id,
                msg.registration_correlation_id(),
                &msg.channel(),
            ),
            Command::ClientKeepalive(_) => Ok(()),
            Command::ClientClose(_) => {
                self.on_client_close(client_id);
                Ok(())
            }
            Command::TerminateDriver(msg) => {
                self.on_terminate_driver(client_id, &msg.token());
                Ok(())
            }
        };

        if let Err(err) = result {
            debug!(msg_type_id, client_id, correlation_id, %err, "command failed");
            self.client_proxy
                .on_error(correlation_id, err.error_code(), &err.to_string());
        }
    }

    fn on_add_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &str,
        exclusive: bool,
    ) -> Result<()> {
        let uri = ChannelUri::parse(channel)?;
        let endpoint = match uri.media() {
            Media::Ipc => None,
            Media::Udp => Some(UdpChannel::resolve(&uri, BindPreference::Sender)?),
        };
        let key = channel_key(endpoint.as_ref());
        let requested_session_id = uri.session_id();

        if !exclusive
            && let Some(existing) = self.registry.find_shared_publication(&key, stream_id)
        {
            if let Some(session_id) = requested_session_id
                && session_id != existing.session_id()
            {
                return Err(ControlError::invalid_channel(format!(
                    "existing publication on stream {stream_id} has session-id {}, requested {session_id}",
                    existing.session_id()
                )));
            }
            existing.retain();
            let registration_id = existing.registration_id();
            self.client_proxy
                .on_publication_ready(&ready_info(existing, correlation_id), false);
            self.registry
                .link(client_id, ResourceLink::Publication(registration_id));
            return Ok(());
        }

        let session_id = match requested_session_id {
            Some(session_id) if self.registry.is_session_in_use(&key, stream_id, session_id) => {
                return Err(ControlError::invalid_channel(format!(
                    "session-id {session_id} already in use on stream {stream_id}"
                )));
            }
            Some(session_id) => session_id,
            None => self.next_session_id(&key, stream_id),
        };

        let registration_id = correlation_id;
        let now_ms = self.epoch_clock.time_millis();
        let publisher_limit_id = self.counters.allocate(
            now_ms,
            PUBLISHER_LIMIT_TYPE_ID,
            &registration_id.to_le_bytes(),
            &format!("pub-lmt: {registration_id} {session_id} {stream_id} {channel}"),
        )?;
        self.counters
            .set_counter_registration_id(publisher_limit_id, registration_id);
        self.counters
            .set_counter_owner_id(publisher_limit_id, client_id);

        let channel_status_id = match &endpoint {
            Some(endpoint) => match self.acquire_send_endpoint(endpoint, now_ms) {
                Ok(status_id) => status_id,
                Err(err) => {
                    self.free_counter(now_ms, publisher_limit_id);
                    return Err(err);
                }
            },
            None => NO_ID_ALLOCATED,
        };

        let publication = Publication {
            registration_id,
            client_id,
            session_id,
            stream_id,
            channel: channel.to_string(),
            key,
            exclusive,
            ref_count: 1,
            publisher_limit_id,
            channel_status_id,
            log_file_name: format!("{registration_id}.logbuffer"),
            images: Vec::new(),
        };
        debug!(client_id, registration_id, session_id, stream_id, exclusive, "publication added");

        self.client_proxy
            .on_publication_ready(&ready_info(&publication, correlation_id), exclusive);
        let is_ipc = publication.is_ipc();
        self.registry.add_publication(publication);
        self.registry
            .link(client_id, ResourceLink::Publication(registration_id));

        if is_ipc {
            let subscribers: Vec<i64> = self
                .registry
                .subscriptions()
                .filter(|s| {
                    self.registry
                        .publication(registration_id)
                        .is_some_and(|p| s.consumes(p))
                })
                .map(Subscription::registration_id)
                .collect();
            for subscription_registration_id in subscribers {
                self.link_image(now_ms, registration_id, subscription_registration_id);
            }
        }

        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    ) -> Result<()> {
        if !self
            .registry
            .unlink(client_id, ResourceLink::Publication(registration_id))
        {
            return Err(ControlError::ResourceNotFound {
                kind: ResourceKind::Publication,
                registration_id,
            });
        }

        let mut released = Vec::new();
        self.release_publication(registration_id, &mut released);
        self.client_proxy.operation_succeeded(correlation_id);
        self.send_releases(released);
        Ok(())
    }

    fn on_add_subscription(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &str,
    ) -> Result<()> {
        let uri = ChannelUri::parse(channel)?;
        let endpoint = match uri.media() {
            Media::Ipc => None,
            Media::Udp => Some(UdpChannel::resolve(&uri, BindPreference::Receiver)?),
        };

        let now_ms = self.epoch_clock.time_millis();
        let channel_status_id = match &endpoint {
            Some(endpoint) => self.acquire_receive_endpoint(endpoint, now_ms)?,
            None => NO_ID_ALLOCATED,
        };

        let registration_id = correlation_id;
        let subscription = Subscription {
            registration_id,
            client_id,
            stream_id,
            channel: channel.to_string(),
            key: channel_key(endpoint.as_ref()),
            session_filter: uri.session_id(),
            channel_status_id,
        };
        debug!(client_id, registration_id, stream_id, "subscription added");

        let publishers: Vec<i64> = self
            .registry
            .publications()
            .filter(|p| subscription.consumes(p))
            .map(Publication::registration_id)
            .collect();

        self.registry.add_subscription(subscription);
        self.registry
            .link(client_id, ResourceLink::Subscription(registration_id));
        self.client_proxy
            .on_subscription_ready(correlation_id, channel_status_id);

        for publication_registration_id in publishers {
            self.link_image(now_ms, publication_registration_id, registration_id);
        }

        Ok(())
    }

    fn on_remove_subscription(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    ) -> Result<()> {
        if !self
            .registry
            .unlink(client_id, ResourceLink::Subscription(registration_id))
        {
            return Err(ControlError::ResourceNotFound {
                kind: ResourceKind::Subscription,
                registration_id,
            });
        }

        self.release_subscription(registration_id);
        self.client_proxy.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_add_counter(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<()> {
        let now_ms = self.epoch_clock.time_millis();
        let counter_id = self.counters.allocate(now_ms, type_id, key, label)?;
        self.counters
            .set_counter_registration_id(counter_id, correlation_id);
        self.counters.set_counter_owner_id(counter_id, client_id);

        self.registry.add_counter(CounterLink {
            registration_id: correlation_id,
            client_id,
            counter_id,
        });
        self.registry
            .link(client_id, ResourceLink::Counter(correlation_id));
        debug!(client_id, correlation_id, counter_id, type_id, "counter added");

        self.client_proxy.on_counter_ready(correlation_id, counter_id);
        Ok(())
    }

    fn on_remove_counter(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    ) -> Result<()> {
        if !self
            .registry
            .unlink(client_id, ResourceLink::Counter(registration_id))
        {
            return Err(ControlError::ResourceNotFound {
                kind: ResourceKind::Counter,
                registration_id,
            });
        }

        let mut released = Vec::new();
        self.release_counter(client_id, registration_id, &mut released);
        self.client_proxy.operation_succeeded(correlation_id);
        self.send_releases(released);
        Ok(())
    }

    fn on_add_destination(
        &mut self,
        correlation_id: i64,
        registration_id: i64,
        channel: &str,
    ) -> Result<()> {
        let canonical_form = self.manual_send_endpoint(registration_id)?;
        let destination = UdpChannel::resolve(&ChannelUri::parse(channel)?, BindPreference::Sender)?;

        if let Some(endpoint) = self.registry.send_endpoint_mut(&canonical_form) {
            self.transport
                .on_destination_added(endpoint.endpoint(), &destination);
            endpoint.add_destination(destination);
        }
        self.client_proxy.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_remove_destination(
        &mut self,
        correlation_id: i64,
        registration_id: i64,
        channel: &str,
    ) -> Result<()> {
        let canonical_form = self.manual_send_endpoint(registration_id)?;
        let destination = UdpChannel::resolve(&ChannelUri::parse(channel)?, BindPreference::Sender)?;

        let endpoint = self
            .registry
            .send_endpoint_mut(&canonical_form)
            .ok_or_else(|| unknown_destination(channel))?;
        let removed = endpoint
            .remove_destination(destination.canonical_form())
            .ok_or_else(|| unknown_destination(channel))?;
        self.transport
            .on_destination_removed(endpoint.endpoint(), &removed);

        self.client_proxy.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_add_rcv_destination(
        &mut self,
        correlation_id: i64,
        registration_id: i64,
        channel: &str,
    ) -> Result<()> {
        let canonical_form = self.manual_receive_endpoint(registration_id)?;
        let destination =
            UdpChannel::resolve(&ChannelUri::parse(channel)?, BindPreference::Receiver)?;

        if let Some(endpoint) = self.registry.receive_endpoint_mut(&canonical_form) {
            self.transport
                .on_rcv_destination_added(endpoint.endpoint(), &destination);
            endpoint.add_destination(destination);
        }
        self.client_proxy.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_remove_rcv_destination(
        &mut self,
        correlation_id: i64,
        registration_id: i64,
        channel: &str,
    ) -> Result<()> {
        let canonical_form = self.manual_receive_endpoint(registration_id)?;
        let destination =
            UdpChannel::resolve(&ChannelUri::parse(channel)?, BindPreference::Receiver)?;

        let endpoint = self
            .registry
            .receive_endpoint_mut(&canonical_form)
            .ok_or_else(|| unknown_destination(channel))?;
        let removed = endpoint
            .remove_destination(destination.canonical_form())
            .ok_or_else(|| unknown_destination(channel))?;
        self.transport
            .on_rcv_destination_removed(endpoint.endpoint(), &removed);

        self.client_proxy.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_client_close(&mut self, client_id: i64) {
        if self.registry.client(client_id).is_none() {
            return;
        }
        info!(client_id, "client closed");
        let released = self.release_client(client_id);
        self.send_releases(released);
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn on_terminate_driver(&mut self, client_id: i64, token: &[u8]) {
        if self.termination_validator.allow_termination(token) {
            info!(client_id, "termination requested");
            self.state = ConductorState::Terminated;
        } else {
            warn!(client_id, token_length = token.len(), "termination token rejected");
        }
    }

    fn check_client_liveness(&mut self, now_ns: i64) -> usize {
        let timed_out = self
            .registry
            .timed_out_clients(now_ns, self.client_liveness_timeout_ns);

        for &client_id in &timed_out {
            info!(client_id, "client timed out");
            let released = self.release_client(client_id);
            self.client_proxy.on_client_timeout(client_id);
            self.send_releases(released);
        }

        timed_out.len()
    }

    fn check_ring_unblock(&mut self, now_ns: i64) -> usize {
        let consumer_position = self.to_driver.consumer_position();
        if consumer_position != self.last_consumer_position {
            self.last_consumer_position = consumer_position;
            self.time_of_last_consumer_position_change_ns = now_ns;
            return 0;
        }

        let stalled = self.to_driver.producer_position() > consumer_position
            && now_ns - self.time_of_last_consumer_position_change_ns
                > self.client_liveness_timeout_ns;
        if stalled && self.to_driver.unblock() {
            warn!(consumer_position, "unblocked to-driver ring");
            self.time_of_last_consumer_position_change_ns = now_ns;
            return 1;
        }
        0
    }

    /// Removes the client and everything it holds. Notifications are
    /// returned rather than sent so the caller controls their order.
    fn release_client(&mut self, client_id: i64) -> Vec<Release> {
        let Some(session) = self.registry.remove_client(client_id) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for link in session.links() {
            match *link {
                ResourceLink::Publication(registration_id) => {
                    self.release_publication(registration_id, &mut released);
                }
                ResourceLink::Subscription(registration_id) => {
                    self.release_subscription(registration_id);
                }
                ResourceLink::Counter(registration_id) => {
                    self.release_counter(client_id, registration_id, &mut released);
                }
            }
        }
        released
    }

    fn release_publication(&mut self, registration_id: i64, released: &mut Vec<Release>) {
        let Some(publication) = self.registry.publication_mut(registration_id) else {
            return;
        };
        if publication.release() > 0 {
            return;
        }
        let Some(publication) = self.registry.remove_publication(registration_id) else {
            return;
        };

        let now_ms = self.epoch_clock.time_millis();
        self.free_counter(now_ms, publication.publisher_limit_id());
        for image in publication.images() {
            self.free_counter(now_ms, image.subscriber_position_id);
            released.push(Release::UnavailableImage {
                correlation_id: publication.registration_id(),
                subscription_registration_id: image.subscription_registration_id,
                stream_id: publication.stream_id(),
                channel: publication.channel().to_string(),
            });
        }
        if let ChannelKey::Udp(canonical_form) = publication.key() {
            self.release_send_endpoint(canonical_form, now_ms);
        }
        debug!(registration_id, "publication closed");
    }

    fn release_subscription(&mut self, registration_id: i64) {
        let Some(subscription) = self.registry.remove_subscription(registration_id) else {
            return;
        };

        let now_ms = self.epoch_clock.time_millis();
        for position_id in self.registry.unlink_images(registration_id) {
            self.free_counter(now_ms, position_id);
        }
        if let ChannelKey::Udp(canonical_form) = subscription.key() {
            self.release_receive_endpoint(canonical_form, now_ms);
        }
        debug!(registration_id, "subscription closed");
    }

    fn release_counter(&mut self, client_id: i64, registration_id: i64, released: &mut Vec<Release>) {
        let Some(counter) = self.registry.remove_counter(client_id, registration_id) else {
            return;
        };
        let now_ms = self.epoch_clock.time_millis();
        self.free_counter(now_ms, counter.counter_id);
        released.push(Release::UnavailableCounter {
            registration_id,
            counter_id: counter.counter_id,
        });
    }

    fn send_releases(&self, released: Vec<Release>) {
        for release in released {
            match release {
                Release::UnavailableCounter {
                    registration_id,
                    counter_id,
                } => self
                    .client_proxy
                    .on_unavailable_counter(registration_id, counter_id),
                Release::UnavailableImage {
                    correlation_id,
                    subscription_registration_id,
                    stream_id,
                    channel,
                } => self.client_proxy.on_unavailable_image(
                    correlation_id,
                    subscription_registration_id,
                    stream_id,
                    &channel,
                ),
            }
        }
    }

    /// Links an IPC publication to a subscription and announces the image.
    fn link_image(&mut self, now_ms: i64, publication_registration_id: i64, subscription_registration_id: i64) {
        let (Some(publication), Some(subscription)) = (
            self.registry.publication(publication_registration_id),
            self.registry.subscription(subscription_registration_id),
        ) else {
            return;
        };

        let label = format!(
            "sub-pos: {subscription_registration_id} {} {} {} @0",
            publication.session_id(),
            publication.stream_id(),
            subscription.channel()
        );
        let subscriber_client_id = subscription.client_id();
        let session_id = publication.session_id();
        let stream_id = publication.stream_id();
        let log_file_name = publication.log_file_name().to_string();

        let position_id = match self.counters.allocate(
            now_ms,
            SUBSCRIBER_POSITION_TYPE_ID,
            &subscription_registration_id.to_le_bytes(),
            &label,
        ) {
            Ok(id) => id,
            Err(err) => {
                warn!(publication_registration_id, subscription_registration_id, %err, "no subscriber position counter");
                self.client_proxy.on_error(
                    subscription_registration_id,
                    err.error_code(),
                    &format!("image of publication {publication_registration_id} not linked: {err}"),
                );
                return;
            }
        };
        self.counters
            .set_counter_registration_id(position_id, subscription_registration_id);
        self.counters
            .set_counter_owner_id(position_id, subscriber_client_id);
        self.counters
            .set_counter_reference_id(position_id, publication_registration_id);

        if let Some(publication) = self.registry.publication_mut(publication_registration_id) {
            publication.images.push(ImageLink {
                subscription_registration_id,
                subscriber_position_id: position_id,
            });
        }

        self.client_proxy.on_available_image(&ImageAvailable {
            correlation_id: publication_registration_id,
            session_id,
            stream_id,
            subscription_registration_id,
            subscriber_position_id: position_id,
            log_file_name: &log_file_name,
            source_identity: IPC_SOURCE_IDENTITY,
        });
    }

    fn acquire_send_endpoint(&mut self, endpoint: &ResolvedEndpoint, now_ms: i64) -> Result<i32> {
        if let Some(existing) = self.registry.send_endpoint_mut(endpoint.canonical_form()) {
            existing.retain();
            return Ok(existing.status_counter_id());
        }

        let status_id = self.allocate_channel_status(now_ms, "snd-channel", endpoint)?;
        if let Err(err) = self.transport.on_send_endpoint_created(endpoint) {
            self.client_proxy
                .on_channel_endpoint_error(status_id, &err.to_string());
            self.free_counter(now_ms, status_id);
            return Err(err);
        }
        self.counters
            .set_counter_value(status_id, CHANNEL_STATUS_ACTIVE);
        debug!(canonical_form = endpoint.canonical_form(), status_id, "send endpoint opened");
        self.registry
            .insert_send_endpoint(ChannelEndpoint::new(endpoint.clone(), status_id));
        Ok(status_id)
    }

    fn acquire_receive_endpoint(&mut self, endpoint: &ResolvedEndpoint, now_ms: i64) -> Result<i32> {
        if let Some(existing) = self.registry.receive_endpoint_mut(endpoint.canonical_form()) {
            existing.retain();
            return Ok(existing.status_counter_id());
        }

        let status_id = self.allocate_channel_status(now_ms, "rcv-channel", endpoint)?;
        if let Err(err) = self.transport.on_receive_endpoint_created(endpoint) {
            self.client_proxy
                .on_channel_endpoint_error(status_id, &err.to_string());
            self.free_counter(now_ms, status_id);
            return Err(err);
        }
        self.counters
            .set_counter_value(status_id, CHANNEL_STATUS_ACTIVE);
        debug!(canonical_form = endpoint.canonical_form(), status_id, "receive endpoint opened");
        self.registry
            .insert_receive_endpoint(ChannelEndpoint::new(endpoint.clone(), status_id));
        Ok(status_id)
    }

    fn release_send_endpoint(&mut self, canonical_form: &str, now_ms: i64) {
        if let Some(endpoint) = self.registry.release_send_endpoint(canonical_form) {
            self.transport.on_send_endpoint_closed(endpoint.endpoint());
            self.free_counter(now_ms, endpoint.status_counter_id());
            debug!(canonical_form, "send endpoint closed");
        }
    }

    fn release_receive_endpoint(&mut self, canonical_form: &str, now_ms: i64) {
        if let Some(endpoint) = self.registry.release_receive_endpoint(canonical_form) {
            self.transport.on_receive_endpoint_closed(endpoint.endpoint());
            self.free_counter(now_ms, endpoint.status_counter_id());
            debug!(canonical_form, "receive endpoint closed");
        }
    }

    fn allocate_channel_status(
        &mut self,
        now_ms: i64,
        prefix: &str,
        endpoint: &ResolvedEndpoint,
    ) -> Result<i32> {
        self.counters.allocate(
            now_ms,
            CHANNEL_STATUS_TYPE_ID,
            &[],
            &format!("{prefix}: {}", endpoint.channel()),
        )
    }

    /// Canonical form of the manual control mode send endpoint behind a
    /// publication.
    fn manual_send_endpoint(&self, registration_id: i64) -> Result<String> {
        let publication =
            self.registry
                .publication(registration_id)
                .ok_or(ControlError::ResourceNotFound {
                    kind: ResourceKind::Publication,
                    registration_id,
                })?;
        let ChannelKey::Udp(canonical_form) = publication.key() else {
            return Err(ControlError::invalid_channel(
                "destinations require a UDP publication",
            ));
        };
        match self.registry.send_endpoint(canonical_form) {
            Some(endpoint) if endpoint.endpoint().is_manual_control_mode() => {
                Ok(canonical_form.clone())
            }
            _ => Err(ControlError::invalid_channel(format!(
                "destinations require control-mode=manual: {}",
                publication.channel()
            ))),
        }
    }

    fn manual_receive_endpoint(&self, registration_id: i64) -> Result<String> {
        let subscription =
            self.registry
                .subscription(registration_id)
                .ok_or(ControlError::ResourceNotFound {
                    kind: ResourceKind::Subscription,
                    registration_id,
                })?;
        let ChannelKey::Udp(canonical_form) = subscription.key() else {
            return Err(ControlError::invalid_channel(
                "receive destinations require a UDP subscription",
            ));
        };
        match self.registry.receive_endpoint(canonical_form) {
            Some(endpoint) if endpoint.endpoint().is_manual_control_mode() => {
                Ok(canonical_form.clone())
            }
            _ => Err(ControlError::invalid_channel(format!(
                "receive destinations require control-mode=manual: {}",
                subscription.channel()
            ))),
        }
    }

    fn next_session_id(&self, key: &ChannelKey, stream_id: i32) -> i32 {
        loop {
            let session_id: i32 = rand::random();
            if !self.registry.is_session_in_use(key, stream_id, session_id) {
                return session_id;
            }
        }
    }

    fn free_counter(&mut self, now_ms: i64, counter_id: i32) {
        if let Err(err) = self.counters.free(now_ms, counter_id) {
            warn!(counter_id, %err, "counter already free");
        }
    }
}

fn channel_key(endpoint: Option<&ResolvedEndpoint>) -> ChannelKey {
    match endpoint {
        Some(endpoint) => ChannelKey::Udp(endpoint.canonical_form().to_string()),
        None => ChannelKey::Ipc,
    }
}

fn ready_info(publication: &Publication, correlation_id: i64) -> PublicationReadyInfo<'_> {
    PublicationReadyInfo {
        correlation_id,
        registration_id: publication.registration_id(),
        session_id: publication.session_id(),
        stream_id: publication.stream_id(),
        publication_limit_counter_id: publication.publisher_limit_id(),
        channel_status_indicator_id: publication.channel_status_id(),
        log_file_name: publication.log_file_name(),
    }
}

fn unknown_destination(channel: &str) -> ControlError {
    ControlError::invalid_channel(format!("unknown destination: {channel}"))
}

fn duration_ns(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{DriverConnection, DriverListener, DriverListenerAdapter, DriverProxy};
    use crate::driver::config::TokenTermination;
    use crate::ipc::cnc::{CncLayout, CncMetadata};
    use crate::protocol::ErrorCode;
    use crate::protocol::response::{ImageMessage, PublicationReady, UnavailableImage};
    use crate::runtime::CachedClock;

    const LIVENESS: Duration = Duration::from_millis(100);

    #[derive(Debug, Default)]
    struct Recorder {
        errors: Vec<(i64, ErrorCode)>,
        publications: Vec<(i64, i64, i32)>,
        images: Vec<(i64, i64)>,
        unavailable_images: Vec<(i64, i64)>,
        successes: Vec<i64>,
        subscriptions: Vec<(i64, i32)>,
    }

    impl DriverListener for Recorder {
        fn on_error(&mut self, correlation_id: i64, code: ErrorCode, _message: &str) {
            self.errors.push((correlation_id, code));
        }

        fn on_new_publication(&mut self, ready: &PublicationReady<'_>) {
            self.publications
                .push((ready.correlation_id(), ready.registration_id(), ready.session_id()));
        }

        fn on_available_image(&mut self, image: &ImageMessage<'_>) {
            self.images
                .push((image.correlation_id(), image.subscription_registration_id()));
        }

        fn on_unavailable_image(&mut self, image: &UnavailableImage<'_>) {
            self.unavailable_images
                .push((image.correlation_id(), image.subscription_registration_id()));
        }

        fn on_operation_success(&mut self, correlation_id: i64) {
            self.successes.push(correlation_id);
        }

        fn on_subscription_ready(&mut self, correlation_id: i64, channel_status_id: i32) {
            self.subscriptions.push((correlation_id, channel_status_id));
        }
    }

    struct Fixture {
        clock: CachedClock,
        conductor: DriverConductor,
        connection: DriverConnection,
        adapter: DriverListenerAdapter<Recorder>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = CachedClock::new(1_000_000_000);
            let cnc = CncBuffers::heap(
                CncLayout::new(64 * 1024, 64 * 1024, 64 * 128),
                CncMetadata {
                    client_liveness_timeout_ns: duration_ns(LIVENESS),
                    start_timestamp_ms: 0,
                    pid: 1,
                },
            );
            let config = DriverConfig {
                client_liveness_timeout: LIVENESS,
                termination_validator: Arc::new(TokenTermination(b"stop".to_vec())),
                ..DriverConfig::default()
            };
            let context = ConductorContext::from_config(config)
                .with_clocks(Box::new(clock.clone()), Box::new(clock.clone()));
            let conductor = DriverConductor::new(&cnc, context);

            let connection = DriverConnection::from_buffers(cnc);
            let adapter = connection.listener_adapter(Recorder::default());
            Self {
                clock,
                conductor,
                connection,
                adapter,
            }
        }

        fn proxy(&self) -> &DriverProxy {
            self.connection.proxy()
        }

        fn cycle(&mut self) -> &Recorder {
            self.conductor.do_work();
            self.adapter.receive_messages().unwrap();
            self.adapter.listener()
        }
    }

    #[test]
    fn test_shared_publication_is_reference_counted() {
        let mut fx = Fixture::new();
        let first = fx.proxy().add_publication("aeron:ipc", 10).unwrap();
        let second = fx.proxy().add_publication("aeron:ipc", 10).unwrap();
        let recorder = fx.cycle();

        assert_eq!(recorder.publications.len(), 2);
        assert_eq!(recorder.publications[0].1, first);
        assert_eq!(recorder.publications[1], (second, first, recorder.publications[0].2));
        assert_eq!(fx.conductor.publication(first).unwrap().ref_count(), 2);

        let remove = fx.proxy().remove_publication(first).unwrap();
        fx.cycle();
        assert_eq!(fx.conductor.publication(first).unwrap().ref_count(), 1);

        fx.proxy().remove_publication(first).unwrap();
        let recorder = fx.cycle();
        assert!(recorder.successes.contains(&remove));
        assert!(fx.conductor.publication(first).is_none());
    }

    #[test]
    fn test_exclusive_publications_never_share() {
        let mut fx = Fixture::new();
        let first = fx.proxy().add_exclusive_publication("aeron:ipc", 10).unwrap();
        let second = fx.proxy().add_exclusive_publication("aeron:ipc", 10).unwrap();
        fx.cycle();

        let a = fx.conductor.publication(first).unwrap();
        let b = fx.conductor.publication(second).unwrap();
        assert_ne!(a.session_id(), b.session_id());
        assert_ne!(a.publisher_limit_id(), b.publisher_limit_id());
    }

    #[test]
    fn test_ipc_image_linking_both_orders() {
        let mut fx = Fixture::new();
        let early_subscription = fx.proxy().add_subscription("aeron:ipc", 5).unwrap();
        let publication = fx.proxy().add_publication("aeron:ipc", 5).unwrap();
        let late_subscription = fx.proxy().add_subscription("aeron:ipc", 5).unwrap();
        let other_stream = fx.proxy().add_subscription("aeron:ipc", 6).unwrap();
        let recorder = fx.cycle();

        assert_eq!(
            recorder.images,
            vec![(publication, early_subscription), (publication, late_subscription)]
        );
        assert!(recorder.subscriptions.contains(&(other_stream, NO_ID_ALLOCATED)));
        assert_eq!(fx.conductor.publication(publication).unwrap().images().len(), 2);

        fx.proxy().remove_publication(publication).unwrap();
        let recorder = fx.cycle();
        assert_eq!(
            recorder.unavailable_images,
            vec![(publication, early_subscription), (publication, late_subscription)]
        );
    }

    #[test]
    fn test_malformed_channel_is_invalid_channel() {
        let mut fx = Fixture::new();
        let correlation_id = fx.proxy().add_publication("udp://nope", 1).unwrap();
        let recorder = fx.cycle();
        assert_eq!(recorder.errors, vec![(correlation_id, ErrorCode::InvalidChannel)]);
    }

    #[test]
    fn test_terminate_requires_token() {
        let mut fx = Fixture::new();
        fx.proxy().terminate_driver(b"wrong").unwrap();
        fx.cycle();
        assert!(!fx.conductor.is_terminated());

        fx.proxy().terminate_driver(b"stop").unwrap();
        fx.cycle();
        assert!(fx.conductor.is_terminated());
    }

    #[test]
    fn test_liveness_checked_on_timer() {
        let mut fx = Fixture::new();
        fx.proxy().send_client_keepalive().unwrap();
        fx.cycle();
        let client_id = fx.proxy().client_id();
        assert!(fx.conductor.is_client_active(client_id));

        fx.clock.advance(duration_ns(LIVENESS));
        fx.cycle();
        assert!(fx.conductor.is_client_active(client_id));

        fx.clock.advance(1_000_000);
        fx.cycle();
        assert!(!fx.conductor.is_client_active(client_id));
    }
}
