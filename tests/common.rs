//! Common test harness utilities for integration tests.
//!
//! Builds a state service wired to a stub transport so tests can assert the
//! exact frames the core emits and inject responses without a network.

// Not all test files use all helpers; silence dead_code warnings for unused
// exports.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use mqttsn::codec::{self, Frame, ProtocolVersion};
use mqttsn::messaging::{MessageQueue, MessageRegistry, TopicRegistry};
use mqttsn::net::{SecurityService, Transport, TransportError};
use mqttsn::peers::{Peer, PeerDirectory};
use mqttsn::state::service::StateServices;
use mqttsn::state::BoxFuture;
use mqttsn::time::ManualClock;
use mqttsn::{MessageStateService, Mode, StateEvent, StateOptions};

/// Predefined topic id used across scenarios.
pub const TEMP_TOPIC: &str = "sensors/temp";
pub const TEMP_TOPIC_ID: u16 = 7;

pub const PEER_ADDR: &str = "127.0.0.1:18830";

/// Transport stub: captures datagrams, optionally failing every write.
pub struct StubTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    fail: AtomicBool,
}

impl StubTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                fail: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Transport for StubTransport {
    fn write<'a>(
        &'a self,
        _addr: SocketAddr,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Send("stubbed failure".into()));
            }
            let _ = self.tx.send(payload.to_vec());
            Ok(())
        })
    }
}

pub struct Harness {
    pub state: MessageStateService<ManualClock>,
    pub clock: ManualClock,
    pub peer: Peer,
    pub events: mpsc::UnboundedReceiver<StateEvent>,
    pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
    pub transport: Arc<StubTransport>,
}

impl Harness {
    /// Next captured datagram, decoded as a 1.2 frame.
    pub async fn next_frame(&mut self) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for a datagram")
            .expect("transport closed");
        codec::decode(ProtocolVersion::V1_2, &bytes).expect("undecodable datagram")
    }

    pub fn no_more_frames(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    pub async fn next_event(&mut self) -> StateEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub fn no_more_events(&mut self) -> bool {
        self.events.try_recv().is_err()
    }
}

pub fn options() -> StateOptions {
    StateOptions {
        max_messages_inflight: 1,
        max_error_retries: 3,
        max_error_retry_time: Duration::from_millis(10),
        max_time_inflight: Duration::from_millis(2_000),
        max_wait: Duration::from_millis(500),
        msg_id_start: 1,
        min_flush_time: Duration::from_millis(5),
        active_context_timeout: Duration::from_millis(500),
        state_loop_timeout: Duration::from_millis(20),
        requeue_on_inflight_timeout: true,
        reap_receiving_messages: false,
    }
}

pub fn harness(mode: Mode, opts: StateOptions) -> Harness {
    harness_with_security(mode, opts, None)
}

pub fn harness_with_security(
    mode: Mode,
    opts: StateOptions,
    integrity_key: Option<&str>,
) -> Harness {
    let clock = ManualClock::default();
    let (transport, sent) = StubTransport::new();
    let directory = Arc::new(PeerDirectory::new());
    let registry = Arc::new(MessageRegistry::new(clock.clone(), Duration::from_secs(60)));
    let queue = Arc::new(MessageQueue::new(16));
    let mut predefined = HashMap::new();
    predefined.insert(TEMP_TOPIC.to_string(), TEMP_TOPIC_ID);
    let topics = Arc::new(TopicRegistry::new(&predefined));
    let security = Arc::new(SecurityService::from_config(integrity_key));

    let (state, events) = MessageStateService::new(
        mode,
        opts,
        clock.clone(),
        StateServices {
            transport: transport.clone() as Arc<dyn Transport>,
            directory: directory.clone(),
            registry,
            queue,
            topics,
            security,
        },
    );

    let peer = Peer::new("client-1", ProtocolVersion::V1_2);
    directory.bind(&peer, PEER_ADDR.parse().unwrap());

    Harness {
        state,
        clock,
        peer,
        events,
        sent,
        transport,
    }
}

/// Store a payload and build the queued publish that references it.
pub fn queued_publish(
    harness: &Harness,
    topic: &str,
    qos: mqttsn::Qos,
    payload: &[u8],
) -> mqttsn::QueuedPublish {
    let message_id = harness.state.registry().add(payload.to_vec());
    mqttsn::QueuedPublish::new(message_id, topic, qos, false)
}
