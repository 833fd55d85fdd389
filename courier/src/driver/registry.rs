//! Bookkeeping of client sessions and the resources they hold.
//!
//! The registry only records state. Counter allocation, endpoint lifecycle
//! and notifications are driven by the conductor.

use std::collections::HashMap;

use crate::uri::ResolvedEndpoint;

/// Counter id reported when a resource has no counter of that kind.
pub const NO_ID_ALLOCATED: i32 = -1;

/// One reference a client holds on a resource, by registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLink {
    Publication(i64),
    Subscription(i64),
    Counter(i64),
}

/// A connected client and the resources it holds.
#[derive(Debug)]
pub struct ClientSession {
    client_id: i64,
    time_of_last_keepalive_ns: i64,
    links: Vec<ResourceLink>,
}

impl ClientSession {
    fn new(client_id: i64, now_ns: i64) -> Self {
        Self {
            client_id,
            time_of_last_keepalive_ns: now_ns,
            links: Vec::new(),
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> i64 {
        self.client_id
    }

    #[must_use]
    pub const fn time_of_last_keepalive_ns(&self) -> i64 {
        self.time_of_last_keepalive_ns
    }

    /// Held resources in the order they were acquired.
    #[must_use]
    pub fn links(&self) -> &[ResourceLink] {
        &self.links
    }

    #[must_use]
    pub const fn has_timed_out(&self, now_ns: i64, liveness_timeout_ns: i64) -> bool {
        now_ns - self.time_of_last_keepalive_ns > liveness_timeout_ns
    }
}

/// Which shared channel a publication or subscription sits on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Ipc,
    /// Canonical form of the UDP endpoint.
    Udp(String),
}

/// A subscription consuming an IPC publication, with its position counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLink {
    pub subscription_registration_id: i64,
    pub subscriber_position_id: i32,
}

#[derive(Debug)]
pub struct Publication {
    pub(crate) registration_id: i64,
    pub(crate) client_id: i64,
    pub(crate) session_id: i32,
    pub(crate) stream_id: i32,
    pub(crate) channel: String,
    pub(crate) key: ChannelKey,
    pub(crate) exclusive: bool,
    pub(crate) ref_count: usize,
    pub(crate) publisher_limit_id: i32,
    pub(crate) channel_status_id: i32,
    pub(crate) log_file_name: String,
    pub(crate) images: Vec<ImageLink>,
}

impl Publication {
    #[must_use]
    pub const fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Client that created the publication.
    #[must_use]
    pub const fn client_id(&self) -> i64 {
        self.client_id
    }

    #[must_use]
    pub const fn session_id(&self) -> i32 {
        self.session_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[must_use]
    pub const fn is_ipc(&self) -> bool {
        matches!(self.key, ChannelKey::Ipc)
    }

    /// Number of add requests currently sharing this publication.
    #[must_use]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    #[must_use]
    pub const fn publisher_limit_id(&self) -> i32 {
        self.publisher_limit_id
    }

    /// Channel status counter of the send endpoint, or [`NO_ID_ALLOCATED`].
    #[must_use]
    pub const fn channel_status_id(&self) -> i32 {
        self.channel_status_id
    }

    #[must_use]
    pub fn log_file_name(&self) -> &str {
        &self.log_file_name
    }

    #[must_use]
    pub fn images(&self) -> &[ImageLink] {
        &self.images
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference, returning how many remain.
    pub(crate) fn release(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub(crate) registration_id: i64,
    pub(crate) client_id: i64,
    pub(crate) stream_id: i32,
    pub(crate) channel: String,
    pub(crate) key: ChannelKey,
    pub(crate) session_filter: Option<i32>,
    pub(crate) channel_status_id: i32,
}

impl Subscription {
    #[must_use]
    pub const fn registration_id(&self) -> i64 {
        self.registration_id
    }

    #[must_use]
    pub const fn client_id(&self) -> i64 {
        self.client_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Session id named by the channel; only that session is consumed.
    #[must_use]
    pub const fn session_filter(&self) -> Option<i32> {
        self.session_filter
    }

    #[must_use]
    pub const fn channel_status_id(&self) -> i32 {
        self.channel_status_id
    }

    /// True if this subscription consumes `publication` over IPC.
    #[must_use]
    pub fn consumes(&self, publication: &Publication) -> bool {
        self.key == ChannelKey::Ipc
            && publication.is_ipc()
            && self.stream_id == publication.stream_id
            && self
                .session_filter
                .is_none_or(|session_id| session_id == publication.session_id)
    }
}

/// A client-allocated counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub counter_id: i32,
}

/// A send or receive endpoint shared by every resource with the same
/// canonical form.
#[derive(Debug)]
pub struct ChannelEndpoint {
    endpoint: ResolvedEndpoint,
    status_counter_id: i32,
    ref_count: usize,
    destinations: Vec<ResolvedEndpoint>,
}

impl ChannelEndpoint {
    pub(crate) const fn new(endpoint: ResolvedEndpoint, status_counter_id: i32) -> Self {
        Self {
            endpoint,
            status_counter_id,
            ref_count: 1,
            destinations: Vec::new(),
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn canonical_form(&self) -> &str {
        self.endpoint.canonical_form()
    }

    #[must_use]
    pub const fn status_counter_id(&self) -> i32 {
        self.status_counter_id
    }

    #[must_use]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Manually added destinations, in insertion order.
    #[must_use]
    pub fn destinations(&self) -> &[ResolvedEndpoint] {
        &self.destinations
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    pub(crate) fn add_destination(&mut self, destination: ResolvedEndpoint) {
        self.destinations.push(destination);
    }

    /// Removes the destination with the same canonical form.
    pub(crate) fn remove_destination(&mut self, canonical_form: &str) -> Option<ResolvedEndpoint> {
        let index = self
            .destinations
            .iter()
            .position(|d| d.canonical_form() == canonical_form)?;
        Some(self.destinations.remove(index))
    }
}

/// Everything the conductor knows about clients and resources.
///
/// Resources live in insertion ordered vectors: a repeated correlation id
/// registers a second, independent entry and lookups by id find the oldest.
#[derive(Debug, Default)]
pub struct Registry {
    clients: Vec<ClientSession>,
    publications: Vec<Publication>,
    subscriptions: Vec<Subscription>,
    counters: Vec<CounterLink>,
    send_endpoints: HashMap<String, ChannelEndpoint>,
    receive_endpoints: HashMap<String, ChannelEndpoint>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes the heartbeat of `client_id`, creating its session on
    /// first contact.
    pub fn touch_client(&mut self, client_id: i64, now_ns: i64) -> &mut ClientSession {
        let index = match self.clients.iter().position(|c| c.client_id == client_id) {
            Some(index) => {
                self.clients[index].time_of_last_keepalive_ns = now_ns;
                index
            }
            None => {
                self.clients.push(ClientSession::new(client_id, now_ns));
                self.clients.len() - 1
            }
        };
        &mut self.clients[index]
    }

    #[must_use]
    pub fn client(&self, client_id: i64) -> Option<&ClientSession> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.iter()
    }

    pub fn remove_client(&mut self, client_id: i64) -> Option<ClientSession> {
        let index = self.clients.iter().position(|c| c.client_id == client_id)?;
        Some(self.clients.remove(index))
    }

    /// Ids of clients whose last heartbeat is older than the timeout.
    #[must_use]
    pub fn timed_out_clients(&self, now_ns: i64, liveness_timeout_ns: i64) -> Vec<i64> {
        self.clients
            .iter()
            .filter(|c| c.has_timed_out(now_ns, liveness_timeout_ns))
            .map(|c| c.client_id)
            .collect()
    }

    pub fn link(&mut self, client_id: i64, link: ResourceLink) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) {
            client.links.push(link);
        }
    }

    /// Drops one occurrence of `link` from the client. Returns false if the
    /// client does not hold it.
    pub fn unlink(&mut self, client_id: i64, link: ResourceLink) -> bool {
        let Some(client) = self.clients.iter_mut().find(|c| c.client_id == client_id) else {
            return false;
        };
        match client.links.iter().position(|l| *l == link) {
            Some(index) => {
                client.links.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn publication(&self, registration_id: i64) -> Option<&Publication> {
        self.publications
            .iter()
            .find(|p| p.registration_id == registration_id)
    }

    pub fn publication_mut(&mut self, registration_id: i64) -> Option<&mut Publication> {
        self.publications
            .iter_mut()
            .find(|p| p.registration_id == registration_id)
    }

    pub fn publications(&self) -> impl Iterator<Item = &Publication> {
        self.publications.iter()
    }

    /// A non-exclusive publication on the same channel and stream.
    pub fn find_shared_publication(
        &mut self,
        key: &ChannelKey,
        stream_id: i32,
    ) -> Option<&mut Publication> {
        self.publications
            .iter_mut()
            .find(|p| !p.exclusive && p.stream_id == stream_id && p.key == *key)
    }

    /// True if any publication on the channel and stream uses `session_id`.
    #[must_use]
    pub fn is_session_in_use(&self, key: &ChannelKey, stream_id: i32, session_id: i32) -> bool {
        self.publications
            .iter()
            .any(|p| p.stream_id == stream_id && p.session_id == session_id && p.key == *key)
    }

    pub fn add_publication(&mut self, publication: Publication) {
        self.publications.push(publication);
    }

    pub fn remove_publication(&mut self, registration_id: i64) -> Option<Publication> {
        let index = self
            .publications
            .iter()
            .position(|p| p.registration_id == registration_id)?;
        Some(self.publications.remove(index))
    }

    /// Removes every image link of a subscription, returning the position
    /// counter ids that were attached to them.
    pub fn unlink_images(&mut self, subscription_registration_id: i64) -> Vec<i32> {
        let mut position_ids = Vec::new();
        for publication in &mut self.publications {
            publication.images.retain(|image| {
                if image.subscription_registration_id == subscription_registration_id {
                    position_ids.push(image.subscriber_position_id);
                    false
                } else {
                    true
                }
            });
        }
        position_ids
    }

    #[must_use]
    pub fn subscription(&self, registration_id: i64) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.registration_id == registration_id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn remove_subscription(&mut self, registration_id: i64) -> Option<Subscription> {
        let index = self
            .subscriptions
            .iter()
            .position(|s| s.registration_id == registration_id)?;
        Some(self.subscriptions.remove(index))
    }

    pub fn add_counter(&mut self, counter: CounterLink) {
        self.counters.push(counter);
    }

    #[must_use]
    pub fn counter(&self, registration_id: i64) -> Option<&CounterLink> {
        self.counters
            .iter()
            .find(|c| c.registration_id == registration_id)
    }

    pub fn remove_counter(&mut self, client_id: i64, registration_id: i64) -> Option<CounterLink> {
        let index = self
            .counters
            .iter()
            .position(|c| c.registration_id == registration_id && c.client_id == client_id)?;
        Some(self.counters.remove(index))
    }

    #[must_use]
    pub fn send_endpoint(&self, canonical_form: &str) -> Option<&ChannelEndpoint> {
        self.send_endpoints.get(canonical_form)
    }

    pub fn send_endpoint_mut(&mut self, canonical_form: &str) -> Option<&mut ChannelEndpoint> {
        self.send_endpoints.get_mut(canonical_form)
    }

    pub fn insert_send_endpoint(&mut self, endpoint: ChannelEndpoint) {
        self.send_endpoints
            .insert(endpoint.canonical_form().to_string(), endpoint);
    }

    /// Drops one reference; returns the endpoint once nothing uses it.
    pub fn release_send_endpoint(&mut self, canonical_form: &str) -> Option<ChannelEndpoint> {
        release(&mut self.send_endpoints, canonical_form)
    }

    #[must_use]
    pub fn receive_endpoint(&self, canonical_form: &str) -> Option<&ChannelEndpoint> {
        self.receive_endpoints.get(canonical_form)
    }

    pub fn receive_endpoint_mut(&mut self, canonical_form: &str) -> Option<&mut ChannelEndpoint> {
        self.receive_endpoints.get_mut(canonical_form)
    }

    pub fn insert_receive_endpoint(&mut self, endpoint: ChannelEndpoint) {
        self.receive_endpoints
            .insert(endpoint.canonical_form().to_string(), endpoint);
    }

    pub fn release_receive_endpoint(&mut self, canonical_form: &str) -> Option<ChannelEndpoint> {
        release(&mut self.receive_endpoints, canonical_form)
    }
}

fn release(
    endpoints: &mut HashMap<String, ChannelEndpoint>,
    canonical_form: &str,
) -> Option<ChannelEndpoint> {
    let endpoint = endpoints.get_mut(canonical_form)?;
    endpoint.ref_count = endpoint.ref_count.saturating_sub(1);
    if endpoint.ref_count > 0 {
        return None;
    }
    endpoints.remove(canonical_form)
}
