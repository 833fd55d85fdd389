//! Conductor scenarios over heap-backed CnC buffers.
//!
//! Each test builds a conductor and one or more client connections sharing
//! the same buffers, drives time with a `CachedClock`, and checks the
//! notifications every client observes on the broadcast buffer.

use std::sync::Arc;
use std::time::Duration;

use courier::control::{DriverConnection, DriverListener, DriverListenerAdapter};
use courier::counters::CounterState;
use courier::driver::registry::ChannelKey;
use courier::driver::{
    ChannelTransport, ConductorContext, DriverConductor, DriverConfig, TokenTermination,
};
use courier::error::ControlError;
use courier::ipc::cnc::{CncBuffers, CncLayout, CncMetadata};
use courier::mpsc::ManyToOneRingBuffer;
use courier::protocol::{
    ErrorCode, ImageMessage, PublicationReady, UnavailableImage, command_type,
};
use courier::runtime::CachedClock;
use courier::uri::ResolvedEndpoint;

const LIVENESS: Duration = Duration::from_secs(1);
const FREE_TO_REUSE: Duration = Duration::from_millis(500);
const MS: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Error(i64, ErrorCode),
    ChannelEndpointError(i64),
    PublicationReady { correlation_id: i64, registration_id: i64 },
    ExclusivePublicationReady { correlation_id: i64 },
    SubscriptionReady(i64, i32),
    AvailableImage { publication: i64, subscription: i64 },
    UnavailableImage { publication: i64, subscription: i64 },
    OperationSuccess(i64),
    CounterReady(i64, i32),
    UnavailableCounter(i64, i32),
    ClientTimeout(i64),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Vec<Event>,
}

impl DriverListener for Recorder {
    fn on_error(&mut self, correlation_id: i64, code: ErrorCode, _message: &str) {
        self.events.push(Event::Error(correlation_id, code));
    }

    fn on_channel_endpoint_error(&mut self, status_indicator_id: i64, _message: &str) {
        self.events
            .push(Event::ChannelEndpointError(status_indicator_id));
    }

    fn on_new_publication(&mut self, ready: &PublicationReady<'_>) {
        self.events.push(Event::PublicationReady {
            correlation_id: ready.correlation_id(),
            registration_id: ready.registration_id(),
        });
    }

    fn on_new_exclusive_publication(&mut self, ready: &PublicationReady<'_>) {
        self.events.push(Event::ExclusivePublicationReady {
            correlation_id: ready.correlation_id(),
        });
    }

    fn on_subscription_ready(&mut self, correlation_id: i64, channel_status_id: i32) {
        self.events
            .push(Event::SubscriptionReady(correlation_id, channel_status_id));
    }

    fn on_available_image(&mut self, image: &ImageMessage<'_>) {
        self.events.push(Event::AvailableImage {
            publication: image.correlation_id(),
            subscription: image.subscription_registration_id(),
        });
    }

    fn on_unavailable_image(&mut self, image: &UnavailableImage<'_>) {
        self.events.push(Event::UnavailableImage {
            publication: image.correlation_id(),
            subscription: image.subscription_registration_id(),
        });
    }

    fn on_operation_success(&mut self, correlation_id: i64) {
        self.events.push(Event::OperationSuccess(correlation_id));
    }

    fn on_available_counter(&mut self, correlation_id: i64, counter_id: i32) {
        self.events.push(Event::CounterReady(correlation_id, counter_id));
    }

    fn on_unavailable_counter(&mut self, correlation_id: i64, counter_id: i32) {
        self.events
            .push(Event::UnavailableCounter(correlation_id, counter_id));
    }

    fn on_client_timeout(&mut self, client_id: i64) {
        self.events.push(Event::ClientTimeout(client_id));
    }
}

struct Client {
    connection: DriverConnection,
    adapter: DriverListenerAdapter<Recorder>,
}

impl Client {
    fn connect(cnc: &CncBuffers) -> Self {
        let connection = DriverConnection::from_buffers(cnc.clone());
        let adapter = connection.listener_adapter(Recorder::default());
        Self {
            connection,
            adapter,
        }
    }

    fn id(&self) -> i64 {
        self.connection.proxy().client_id()
    }

    /// Drains the broadcast and returns everything received so far.
    fn poll(&mut self) -> Vec<Event> {
        self.adapter.receive_messages().unwrap();
        std::mem::take(&mut self.adapter.listener_mut().events)
    }
}

struct Harness {
    clock: CachedClock,
    cnc: CncBuffers,
    conductor: DriverConductor,
}

impl Harness {
    fn new() -> Self {
        Self::with_transport(None)
    }

    fn with_transport(transport: Option<Box<dyn ChannelTransport>>) -> Self {
        Self::build(transport, 16)
    }

    fn with_counters(max_counters: usize) -> Self {
        Self::build(None, max_counters)
    }

    fn build(transport: Option<Box<dyn ChannelTransport>>, max_counters: usize) -> Self {
        let clock = CachedClock::new(10_000 * MS);
        let cnc = CncBuffers::heap(
            CncLayout::new(64 * 1024, 64 * 1024, max_counters * 128),
            CncMetadata {
                client_liveness_timeout_ns: LIVENESS.as_nanos() as i64,
                start_timestamp_ms: 10_000,
                pid: 1,
            },
        );
        let config = DriverConfig {
            client_liveness_timeout: LIVENESS,
            timer_interval: Duration::from_millis(10),
            counter_free_to_reuse_timeout: FREE_TO_REUSE,
            termination_validator: Arc::new(TokenTermination(b"let-me-go".to_vec())),
            ..DriverConfig::default()
        };
        let mut context = ConductorContext::from_config(config)
            .with_clocks(Box::new(clock.clone()), Box::new(clock.clone()));
        if let Some(transport) = transport {
            context = context.with_transport(transport);
        }
        let conductor = DriverConductor::new(&cnc, context);
        Self {
            clock,
            cnc,
            conductor,
        }
    }

    fn client(&self) -> Client {
        Client::connect(&self.cnc)
    }

    /// Runs duty cycles until the ring is drained.
    fn run(&mut self) {
        while self.conductor.do_work() > 0 {}
    }

    fn advance(&mut self, nanos: i64) {
        self.clock.advance(nanos);
        self.run();
    }
}

#[test]
fn counter_registration_is_visible_to_every_client() {
    let mut harness = Harness::new();
    let mut a = harness.client();
    let mut b = harness.client();

    let key = 42_i64.to_le_bytes();
    let correlation_id = a
        .connection
        .proxy()
        .add_counter(102, &key, "counter label")
        .unwrap();
    harness.run();

    let events = a.poll();
    let [Event::CounterReady(ready_correlation_id, counter_id)] = events.as_slice() else {
        panic!("unexpected events {events:?}");
    };
    assert_eq!(*ready_correlation_id, correlation_id);
    assert_eq!(b.poll(), events);

    let reader = b.connection.counters_reader();
    assert_eq!(reader.counter_state(*counter_id), Some(CounterState::Allocated));
    assert_eq!(reader.counter_type_id(*counter_id), 102);
    assert_eq!(reader.counter_label(*counter_id), "counter label");
    assert_eq!(&reader.counter_key(*counter_id)[..8], &key);
    assert_eq!(reader.counter_registration_id(*counter_id), correlation_id);
    assert_eq!(reader.counter_owner_id(*counter_id), a.id());
}

#[test]
fn silent_client_is_evicted_with_its_counters() {
    let mut harness = Harness::new();
    let mut a = harness.client();
    let mut b = harness.client();

    let a_counter = a.connection.proxy().add_counter(1001, &[], "a").unwrap();
    let b_counter = b.connection.proxy().add_counter(1001, &[], "b").unwrap();
    harness.run();
    let ready = b.poll();
    let a_counter_id = ready
        .iter()
        .find_map(|e| match e {
            Event::CounterReady(c, id) if *c == a_counter => Some(*id),
            _ => None,
        })
        .unwrap();
    a.poll();

    for _ in 0..12 {
        b.connection.proxy().send_client_keepalive().unwrap();
        harness.advance(100 * MS);
    }

    assert!(!harness.conductor.is_client_active(a.id()));
    assert!(harness.conductor.is_client_active(b.id()));
    assert_eq!(
        b.poll(),
        vec![
            Event::ClientTimeout(a.id()),
            Event::UnavailableCounter(a_counter, a_counter_id),
        ]
    );
    assert!(harness.conductor.registry().counter(b_counter).is_some());
    assert_eq!(
        harness.conductor.counters_reader().counter_state(a_counter_id),
        Some(CounterState::Reclaimed)
    );
}

#[test]
fn removing_unknown_resources_reports_not_found() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let publication = proxy.remove_publication(999).unwrap();
    let subscription = proxy.remove_subscription(998).unwrap();
    let counter = proxy.remove_counter(997).unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::Error(publication, ErrorCode::UnknownPublication),
            Event::Error(subscription, ErrorCode::UnknownSubscription),
            Event::Error(counter, ErrorCode::UnknownCounter),
        ]
    );
}

#[test]
fn other_clients_cannot_remove_a_counter() {
    let mut harness = Harness::new();
    let mut a = harness.client();
    let b = harness.client();

    let counter = a.connection.proxy().add_counter(1001, &[], "mine").unwrap();
    harness.run();
    let remove = b.connection.proxy().remove_counter(counter).unwrap();
    harness.run();

    let events = a.poll();
    assert_eq!(events.last(), Some(&Event::Error(remove, ErrorCode::UnknownCounter)));
    assert!(harness.conductor.registry().counter(counter).is_some());
}

#[test]
fn udp_publications_share_send_endpoint() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let channel = "aeron:udp?endpoint=127.0.0.1:40456";
    let first = proxy.add_publication(channel, 1).unwrap();
    let second = proxy.add_publication(channel, 2).unwrap();
    let shared = proxy.add_publication(channel, 1).unwrap();
    harness.run();

    let events = client.poll();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[2],
        Event::PublicationReady {
            correlation_id: shared,
            registration_id: first,
        }
    );

    let first_publication = harness.conductor.publication(first).unwrap();
    let ChannelKey::Udp(canonical_form) = first_publication.key().clone() else {
        panic!("expected a UDP publication");
    };
    assert_eq!(
        first_publication.channel_status_id(),
        harness.conductor.publication(second).unwrap().channel_status_id()
    );
    assert_eq!(first_publication.ref_count(), 2);
    assert_eq!(
        harness.conductor.send_endpoint(&canonical_form).unwrap().ref_count(),
        2
    );

    let proxy = client.connection.proxy();
    proxy.remove_publication(first).unwrap();
    proxy.remove_publication(first).unwrap();
    harness.run();
    assert!(harness.conductor.send_endpoint(&canonical_form).is_some());

    client.connection.proxy().remove_publication(second).unwrap();
    harness.run();
    assert!(harness.conductor.send_endpoint(&canonical_form).is_none());
}

#[test]
fn exclusive_publication_gets_its_own_entry() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let shared = proxy.add_publication("aeron:ipc", 3).unwrap();
    let exclusive = proxy.add_exclusive_publication("aeron:ipc", 3).unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::PublicationReady {
                correlation_id: shared,
                registration_id: shared,
            },
            Event::ExclusivePublicationReady {
                correlation_id: exclusive,
            },
        ]
    );
    assert!(harness.conductor.publication(exclusive).unwrap().is_exclusive());
}

#[test]
fn ipc_subscription_sees_images_come_and_go() {
    let mut harness = Harness::new();
    let mut publisher = harness.client();
    let mut subscriber = harness.client();

    let subscription = subscriber
        .connection
        .proxy()
        .add_subscription("aeron:ipc", 7)
        .unwrap();
    harness.run();
    let publication = publisher
        .connection
        .proxy()
        .add_publication("aeron:ipc", 7)
        .unwrap();
    harness.run();

    let events = subscriber.poll();
    assert_eq!(events[0], Event::SubscriptionReady(subscription, -1));
    assert_eq!(
        events[2],
        Event::AvailableImage {
            publication,
            subscription,
        }
    );
    let position_id = harness.conductor.publication(publication).unwrap().images()[0]
        .subscriber_position_id;
    assert_eq!(
        harness.conductor.counters_reader().counter_registration_id(position_id),
        subscription
    );

    publisher.connection.proxy().client_close().unwrap();
    harness.run();

    assert_eq!(
        subscriber.poll(),
        vec![Event::UnavailableImage {
            publication,
            subscription,
        }]
    );
    assert!(!harness.conductor.is_client_active(publisher.id()));
    assert!(publisher.poll().iter().all(|e| !matches!(e, Event::ClientTimeout(_))));
}

#[test]
fn image_without_position_counter_reports_error() {
    let mut harness = Harness::with_counters(2);
    let mut publisher = harness.client();
    let mut subscriber = harness.client();

    let publication = publisher
        .connection
        .proxy()
        .add_publication("aeron:ipc", 7)
        .unwrap();
    let linked = subscriber
        .connection
        .proxy()
        .add_subscription("aeron:ipc", 7)
        .unwrap();
    harness.run();
    let events = subscriber.poll();
    assert!(events.contains(&Event::AvailableImage {
        publication,
        subscription: linked,
    }));

    let starved = subscriber
        .connection
        .proxy()
        .add_subscription("aeron:ipc", 7)
        .unwrap();
    harness.run();

    let events = subscriber.poll();
    assert_eq!(
        events,
        vec![
            Event::SubscriptionReady(starved, -1),
            Event::Error(starved, ErrorCode::ResourceTemporarilyUnavailable),
        ]
    );
    assert_eq!(harness.conductor.publication(publication).unwrap().images().len(), 1);
}

#[test]
fn session_filtered_subscription_only_links_its_session() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let filtered = proxy.add_subscription("aeron:ipc?session-id=77", 4).unwrap();
    let other = proxy.add_publication("aeron:ipc?session-id=76", 4).unwrap();
    let matching = proxy.add_exclusive_publication("aeron:ipc?session-id=77", 4).unwrap();
    harness.run();

    let images: Vec<Event> = client
        .poll()
        .into_iter()
        .filter(|e| matches!(e, Event::AvailableImage { .. }))
        .collect();
    assert_eq!(
        images,
        vec![Event::AvailableImage {
            publication: matching,
            subscription: filtered,
        }]
    );
    assert!(harness.conductor.publication(other).unwrap().images().is_empty());
}

#[test]
fn destinations_require_manual_control_mode() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let manual = proxy
        .add_publication("aeron:udp?control-mode=manual", 1)
        .unwrap();
    let plain = proxy
        .add_publication("aeron:udp?endpoint=127.0.0.1:40457", 1)
        .unwrap();
    harness.run();
    client.poll();

    let proxy = client.connection.proxy();
    let destination = "aeron:udp?endpoint=127.0.0.1:40500";
    let added = proxy.add_destination(manual, destination).unwrap();
    let refused = proxy.add_destination(plain, destination).unwrap();
    let unknown = proxy.add_destination(12345, destination).unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::OperationSuccess(added),
            Event::Error(refused, ErrorCode::InvalidChannel),
            Event::Error(unknown, ErrorCode::UnknownPublication),
        ]
    );

    let ChannelKey::Udp(canonical_form) = harness.conductor.publication(manual).unwrap().key().clone()
    else {
        panic!("expected a UDP publication");
    };
    let endpoint = harness.conductor.send_endpoint(&canonical_form).unwrap();
    assert_eq!(endpoint.destinations().len(), 1);
    assert_eq!(
        endpoint.destinations()[0].remote_data(),
        "127.0.0.1:40500".parse::<std::net::SocketAddr>().unwrap()
    );

    let proxy = client.connection.proxy();
    let removed = proxy.remove_destination(manual, destination).unwrap();
    let missing = proxy.remove_destination(manual, destination).unwrap();
    harness.run();
    assert_eq!(
        client.poll(),
        vec![
            Event::OperationSuccess(removed),
            Event::Error(missing, ErrorCode::InvalidChannel),
        ]
    );
}

#[test]
fn receive_destinations_on_manual_subscription() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let subscription = proxy
        .add_subscription("aeron:udp?control-mode=manual", 9)
        .unwrap();
    let ipc = proxy.add_subscription("aeron:ipc", 9).unwrap();
    harness.run();
    client.poll();

    let proxy = client.connection.proxy();
    let added = proxy
        .add_rcv_destination(subscription, "aeron:udp?endpoint=127.0.0.1:40601")
        .unwrap();
    let refused = proxy
        .add_rcv_destination(ipc, "aeron:udp?endpoint=127.0.0.1:40601")
        .unwrap();
    let unknown = proxy
        .add_rcv_destination(4242, "aeron:udp?endpoint=127.0.0.1:40601")
        .unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::OperationSuccess(added),
            Event::Error(refused, ErrorCode::InvalidChannel),
            Event::Error(unknown, ErrorCode::UnknownSubscription),
        ]
    );
}

#[test]
fn terminate_driver_validates_token() {
    let mut harness = Harness::new();
    let client = harness.client();

    client.connection.proxy().terminate_driver(b"nope").unwrap();
    harness.run();
    assert!(!harness.conductor.is_terminated());

    client.connection.proxy().terminate_driver(b"let-me-go").unwrap();
    harness.run();
    assert!(harness.conductor.is_terminated());
}

#[test]
fn malformed_commands_are_answered() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let ring = ManyToOneRingBuffer::new(harness.cnc.to_driver_buffer().clone());

    // Correlated header plus a stream id, but no channel length prefix.
    let mut truncated = Vec::new();
    truncated.extend_from_slice(&client.id().to_le_bytes());
    truncated.extend_from_slice(&77_i64.to_le_bytes());
    truncated.extend_from_slice(&5_i32.to_le_bytes());
    ring.write(command_type::ADD_PUBLICATION, &truncated).unwrap();
    ring.write(command_type::REMOVE_COUNTER, &[1, 2, 3, 4]).unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::Error(77, ErrorCode::MalformedCommand),
            Event::Error(0, ErrorCode::MalformedCommand),
        ]
    );
}

#[test]
fn invalid_channels_are_rejected() {
    let mut harness = Harness::new();
    let mut client = harness.client();
    let proxy = client.connection.proxy();

    let no_address = proxy.add_publication("aeron:udp", 1).unwrap();
    let even_multicast = proxy
        .add_subscription("aeron:udp?endpoint=224.10.9.8:40456", 1)
        .unwrap();
    let bad_scheme = proxy.add_subscription("aeron:tcp?endpoint=x:1", 1).unwrap();
    harness.run();

    assert_eq!(
        client.poll(),
        vec![
            Event::Error(no_address, ErrorCode::InvalidChannel),
            Event::Error(even_multicast, ErrorCode::InvalidChannel),
            Event::Error(bad_scheme, ErrorCode::InvalidChannel),
        ]
    );
}

#[test]
fn freed_counter_ids_are_reused_after_timeout() {
    let mut harness = Harness::new();
    let mut client = harness.client();

    let first = client.connection.proxy().add_counter(1001, &[], "first").unwrap();
    harness.run();
    let Event::CounterReady(_, first_id) = client.poll()[0] else {
        panic!("expected counter ready");
    };

    client.connection.proxy().remove_counter(first).unwrap();
    client.connection.proxy().add_counter(1001, &[], "second").unwrap();
    harness.run();
    let second_id = client
        .poll()
        .iter()
        .find_map(|e| match e {
            Event::CounterReady(_, id) => Some(*id),
            _ => None,
        })
        .unwrap();
    assert_ne!(second_id, first_id);

    harness.advance(FREE_TO_REUSE.as_nanos() as i64 + MS);
    client.connection.proxy().add_counter(1001, &[], "third").unwrap();
    harness.run();
    let events = client.poll();
    assert!(matches!(events.as_slice(), [Event::CounterReady(_, id)] if *id == first_id));
}

#[derive(Debug)]
struct RefuseSendEndpoints;

impl ChannelTransport for RefuseSendEndpoints {
    fn on_send_endpoint_created(&mut self, endpoint: &ResolvedEndpoint) -> courier::Result<()> {
        Err(ControlError::NotSupported(format!(
            "no sender for {}",
            endpoint.canonical_form()
        )))
    }
}

#[test]
fn refused_endpoint_reports_channel_error() {
    let mut harness = Harness::with_transport(Some(Box::new(RefuseSendEndpoints)));
    let mut client = harness.client();

    let correlation_id = client
        .connection
        .proxy()
        .add_publication("aeron:udp?endpoint=127.0.0.1:40458", 1)
        .unwrap();
    harness.run();

    let events = client.poll();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::ChannelEndpointError(_)));
    assert_eq!(events[1], Event::Error(correlation_id, ErrorCode::NotSupported));
    assert!(harness.conductor.publication(correlation_id).is_none());
}
