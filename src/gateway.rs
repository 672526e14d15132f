//! Gateway session handling.
//!
//! Owns the session map and the subscription index, reacts to decoded
//! frames (the state machine has already been driven by the time a handler
//! runs), and fans confirmed publishes out to matching subscriber queues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{
    self, peek_connect_version, peek_type, types, Frame, ProtocolVersion, Qos, ReturnCode,
    TopicIdKind, TopicTarget,
};
use crate::core::time::Clock;
use crate::messaging::topics::topic_matches;
use crate::peers::Peer;
use crate::state::{MessageStateService, PublishData, QueuedPublish, Source, StateError};

struct Session {
    keep_alive: u16,
    sleeping: bool,
}

#[derive(Clone)]
struct Subscription {
    peer: Peer,
    qos: Qos,
}

pub struct Gateway<C: Clock> {
    inner: Arc<GatewayInner<C>>,
}

impl<C: Clock> Clone for Gateway<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct GatewayInner<C: Clock> {
    state: MessageStateService<C>,
    default_version: ProtocolVersion,
    sessions: Mutex<HashMap<String, Session>>,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl<C: Clock> Gateway<C> {
    pub fn new(state: MessageStateService<C>, default_version: ProtocolVersion) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                state,
                default_version,
                sessions: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self) -> &MessageStateService<C> {
        &self.inner.state
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().values().map(Vec::len).sum()
    }

    /// Entry point for the UDP receive loop.
    pub async fn handle_datagram(self, from: SocketAddr, bytes: Vec<u8>) {
        if let Err(err) = self.process_datagram(from, bytes).await {
            warn!(%from, %err, "datagram handling failed");
        }
    }

    async fn process_datagram(&self, from: SocketAddr, bytes: Vec<u8>) -> Result<(), StateError> {
        let directory = self.inner.state.directory();
        let msg_type = peek_type(&bytes)?;

        // CONNECT carries the protocol id; everything else decodes with the
        // version the peer negotiated (or the configured default).
        let (peer, frame) = if msg_type == types::CONNECT {
            let version = peek_connect_version(&bytes)?;
            let frame = codec::decode(version, &bytes)?;
            let Frame::Connect { ref client_id, .. } = frame else {
                return Ok(());
            };
            let peer = Peer::new(client_id.clone(), version);
            (peer, frame)
        } else {
            let Some(peer) = directory.peer_at(from) else {
                return self.handle_sessionless(from, &bytes);
            };
            let frame = codec::decode(peer.version(), &bytes)?;
            (peer, frame)
        };
        directory.bind(&peer, from);

        let confirmed = match self.inner.state.notify_received(&peer, frame.clone()) {
            Ok(confirmed) => confirmed,
            Err(err) => {
                warn!(peer = %peer, %err, "receive rejected by state machine");
                None
            }
        };
        if let Some(original) = &confirmed {
            self.on_confirmed(&peer, original, &frame);
        }

        self.respond(&peer, frame).await
    }

    /// A datagram from an address with no bound session. Only a QoS -1
    /// publish to a predefined or short topic is meaningful here.
    fn handle_sessionless(&self, from: SocketAddr, bytes: &[u8]) -> Result<(), StateError> {
        let frame = codec::decode(self.inner.default_version, bytes)?;
        if let Frame::Publish {
            qos: Qos::MinusOne,
            retain,
            topic_kind,
            topic_id,
            ref payload,
            ..
        } = frame
        {
            let anon = Peer::new(format!("anon-{from}"), self.inner.default_version);
            let topics = self.inner.state.topics();
            let Some(topic_path) = topics.path_for(&anon, topic_kind, topic_id) else {
                warn!(%from, topic_id, "connectionless publish for unknown topic");
                return Ok(());
            };
            let data = PublishData {
                topic_path,
                qos: Qos::MinusOne,
                retained: retain,
                payload: payload.clone(),
            };
            self.route_publish(&anon, &data);
            return Ok(());
        }
        debug!(%from, "dropping frame from unknown peer");
        Ok(())
    }

    /// Post-processing for exchanges we originated, keyed off the original
    /// message the terminal response confirmed.
    fn on_confirmed(&self, peer: &Peer, original: &Frame, response: &Frame) {
        if let (Frame::Register { topic_name, .. }, Frame::Regack { topic_id, return_code, .. }) =
            (original, response)
        {
            if !return_code.is_error() {
                self.inner.state.topics().learn(peer, topic_name, *topic_id);
            }
        }
    }

    async fn respond(&self, peer: &Peer, frame: Frame) -> Result<(), StateError> {
        match frame {
            Frame::Connect {
                client_id,
                duration,
                clean_session,
                ..
            } => {
                self.open_session(peer, &client_id, duration, clean_session);
                self.inner
                    .state
                    .send_message(peer, Frame::Connack { return_code: ReturnCode::Accepted })
                    .await?;
            }
            Frame::Subscribe {
                qos, msg_id, topic, ..
            } => {
                let (granted, topic_id, return_code) = self.add_subscription(peer, &topic, qos);
                self.inner
                    .state
                    .send_message(
                        peer,
                        Frame::Suback {
                            qos: granted,
                            topic_id,
                            msg_id,
                            return_code,
                        },
                    )
                    .await?;
            }
            Frame::Unsubscribe { msg_id, topic } => {
                self.remove_subscription(peer, &topic);
                self.inner
                    .state
                    .send_message(peer, Frame::Unsuback { msg_id })
                    .await?;
            }
            Frame::Register {
                msg_id, topic_name, ..
            } => {
                let topic_id = self.inner.state.topics().register(peer, &topic_name);
                self.inner
                    .state
                    .send_message(
                        peer,
                        Frame::Regack {
                            topic_id,
                            msg_id,
                            return_code: ReturnCode::Accepted,
                        },
                    )
                    .await?;
            }
            Frame::Publish {
                qos,
                topic_kind,
                topic_id,
                msg_id,
                ..
            } => {
                self.acknowledge_publish(peer, qos, topic_kind, topic_id, msg_id)
                    .await?;
            }
            Frame::Pubrel { msg_id } => {
                self.inner
                    .state
                    .send_message(peer, Frame::Pubcomp { msg_id })
                    .await?;
            }
            Frame::Pubrec { msg_id } => {
                self.inner
                    .state
                    .send_message(peer, Frame::Pubrel { msg_id })
                    .await?;
            }
            Frame::Pingreq { .. } => {
                self.inner.state.send_message(peer, Frame::Pingresp).await?;
            }
            Frame::Disconnect { duration } => {
                self.close_session(peer, duration.is_some()).await?;
            }
            // Terminal responses already drove the state machine.
            _ => {}
        }
        Ok(())
    }

    async fn acknowledge_publish(
        &self,
        peer: &Peer,
        qos: Qos,
        topic_kind: TopicIdKind,
        topic_id: u16,
        msg_id: u16,
    ) -> Result<(), StateError> {
        let known_topic = self
            .inner
            .state
            .topics()
            .path_for(peer, topic_kind, topic_id)
            .is_some();
        match qos {
            Qos::AtLeastOnce => {
                let return_code = if known_topic {
                    ReturnCode::Accepted
                } else {
                    ReturnCode::RejectedInvalidTopicId
                };
                self.inner
                    .state
                    .send_message(
                        peer,
                        Frame::Puback {
                            topic_id,
                            msg_id,
                            return_code,
                        },
                    )
                    .await?;
            }
            Qos::ExactlyOnce => {
                if known_topic {
                    self.inner
                        .state
                        .send_message(peer, Frame::Pubrec { msg_id })
                        .await?;
                } else {
                    self.inner
                        .state
                        .send_message(
                            peer,
                            Frame::Puback {
                                topic_id,
                                msg_id,
                                return_code: ReturnCode::RejectedInvalidTopicId,
                            },
                        )
                        .await?;
                }
            }
            Qos::AtMostOnce | Qos::MinusOne => {}
        }
        Ok(())
    }

    fn open_session(&self, peer: &Peer, client_id: &str, keep_alive: u16, clean_session: bool) {
        info!(peer = %peer, keep_alive, clean_session, "session opened");
        if clean_session {
            self.inner.state.queue().clear(peer);
            self.inner.state.topics().clear(peer);
            self.inner.state.clear_inflight(peer);
            self.drop_subscriptions(peer);
        }
        self.inner.sessions.lock().insert(
            client_id.to_string(),
            Session {
                keep_alive,
                sleeping: false,
            },
        );
    }

    async fn close_session(&self, peer: &Peer, sleeping: bool) -> Result<(), StateError> {
        self.inner
            .state
            .send_message(peer, Frame::Disconnect { duration: None })
            .await?;
        if sleeping {
            // A disconnect with a duration is a sleeping client: keep the
            // session, the queue keeps buffering for it.
            if let Some(session) = self.inner.sessions.lock().get_mut(peer.client_id()) {
                session.sleeping = true;
            }
            info!(peer = %peer, "session sleeping");
            return Ok(());
        }
        info!(peer = %peer, "session closed");
        self.inner.state.clear_inflight(peer);
        self.inner.state.clear(peer);
        self.inner.state.queue().clear(peer);
        self.drop_subscriptions(peer);
        self.inner.sessions.lock().remove(peer.client_id());
        self.inner.state.directory().remove(peer);
        Ok(())
    }

    /// Tear down a session the peer never closed (idle eviction, lost
    /// connection).
    pub fn evict_session(&self, peer: &Peer) {
        if self.inner.sessions.lock().remove(peer.client_id()).is_some() {
            info!(peer = %peer, "session evicted");
        }
        self.inner.state.clear_inflight(peer);
        self.inner.state.clear(peer);
        self.drop_subscriptions(peer);
        self.inner.state.directory().remove(peer);
    }

    fn add_subscription(
        &self,
        peer: &Peer,
        topic: &TopicTarget,
        requested: Qos,
    ) -> (Qos, u16, ReturnCode) {
        let granted = match requested {
            Qos::MinusOne => Qos::AtMostOnce,
            other => other,
        };
        let (filter, topic_id) = match topic {
            TopicTarget::Filter(path) => {
                // Concrete topics get an alias in the SUBACK; wildcard
                // filters have no single id.
                let id = if path.contains(['+', '#']) {
                    0
                } else {
                    self.inner.state.topics().register(peer, path)
                };
                (path.clone(), id)
            }
            TopicTarget::Predefined(id) => {
                let Some(path) = self
                    .inner
                    .state
                    .topics()
                    .path_for(peer, TopicIdKind::Predefined, *id)
                else {
                    return (granted, *id, ReturnCode::RejectedInvalidTopicId);
                };
                (path, *id)
            }
            TopicTarget::Short(s) => (s.clone(), codec::pack_short_topic(s).unwrap_or(0)),
        };
        let mut subs = self.inner.subscriptions.lock();
        let entries = subs.entry(filter).or_default();
        entries.retain(|s| s.peer != *peer);
        entries.push(Subscription {
            peer: peer.clone(),
            qos: granted,
        });
        (granted, topic_id, ReturnCode::Accepted)
    }

    fn remove_subscription(&self, peer: &Peer, topic: &TopicTarget) {
        let filter = match topic {
            TopicTarget::Filter(path) => path.clone(),
            TopicTarget::Short(s) => s.clone(),
            TopicTarget::Predefined(id) => {
                match self
                    .inner
                    .state
                    .topics()
                    .path_for(peer, TopicIdKind::Predefined, *id)
                {
                    Some(path) => path,
                    None => return,
                }
            }
        };
        let mut subs = self.inner.subscriptions.lock();
        if let Some(entries) = subs.get_mut(&filter) {
            entries.retain(|s| s.peer != *peer);
            if entries.is_empty() {
                subs.remove(&filter);
            }
        }
    }

    fn drop_subscriptions(&self, peer: &Peer) {
        let mut subs = self.inner.subscriptions.lock();
        subs.retain(|_, entries| {
            entries.retain(|s| s.peer != *peer);
            !entries.is_empty()
        });
    }

    /// Fan a committed publish out to every matching subscriber. Called by
    /// the runtime's event loop on inbound commits.
    pub fn route_publish(&self, from: &Peer, data: &PublishData) {
        let matching: Vec<Subscription> = {
            let subs = self.inner.subscriptions.lock();
            subs.iter()
                .filter(|(filter, _)| topic_matches(filter, &data.topic_path))
                .flat_map(|(_, entries)| entries.iter().cloned())
                .filter(|sub| sub.peer != *from)
                .collect()
        };
        if matching.is_empty() {
            debug!(topic = %data.topic_path, "no subscribers");
            return;
        }

        let registry = self.inner.state.registry();
        let queue = self.inner.state.queue();
        let scheduler = self.inner.state.scheduler();
        let message_id = registry.add(data.payload.clone());
        for sub in matching {
            let qos = min_qos(sub.qos, data.qos);
            let queued = QueuedPublish {
                message_id,
                topic_path: data.topic_path.clone(),
                qos,
                retained: data.retained,
                retry_count: 0,
                msg_id: 0,
            };
            match queue.offer(&sub.peer, queued) {
                Ok(()) => scheduler.schedule_flush(&sub.peer),
                Err(err) => warn!(peer = %sub.peer, %err, "subscriber queue refused publish"),
            }
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let state = &self.inner.state;
        let queue = state.queue();

        // Every bound peer, plus any peer still holding inflight entries
        // after its binding went away.
        let mut peers = state.directory().peers();
        for peer in state.inflight_peers() {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        let mut inflight_total = 0usize;
        let peer_details: Vec<serde_json::Value> = peers
            .iter()
            .map(|peer| {
                let local = state.count_inflight(peer, Source::Local);
                let remote = state.count_inflight(peer, Source::Remote);
                inflight_total += local + remote;
                serde_json::json!({
                    "client_id": peer.client_id(),
                    "inflight_local": local,
                    "inflight_remote": remote,
                    "queue_depth": queue.depth(peer),
                })
            })
            .collect();

        let sessions = self.inner.sessions.lock();
        let session_details: Vec<serde_json::Value> = sessions
            .iter()
            .map(|(client_id, session)| {
                serde_json::json!({
                    "client_id": client_id,
                    "keep_alive": session.keep_alive,
                    "sleeping": session.sleeping,
                })
            })
            .collect();
        serde_json::json!({
            "sessions": sessions.len(),
            "sleeping": sessions.values().filter(|s| s.sleeping).count(),
            "subscriptions": self.subscription_count(),
            "inflight": inflight_total,
            "queued_messages": queue.total_depth(),
            "peers": peer_details,
            "session_details": session_details,
        })
    }
}

fn min_qos(a: Qos, b: Qos) -> Qos {
    let rank = |q: Qos| match q {
        Qos::MinusOne | Qos::AtMostOnce => 0,
        Qos::AtLeastOnce => 1,
        Qos::ExactlyOnce => 2,
    };
    if rank(a) <= rank(b) {
        match a {
            Qos::MinusOne => Qos::AtMostOnce,
            other => other,
        }
    } else {
        match b {
            Qos::MinusOne => Qos::AtMostOnce,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use crate::core::time::SystemClock;
    use crate::messaging::{MessageQueue, MessageRegistry, TopicRegistry};
    use crate::net::{SecurityService, Transport, TransportError};
    use crate::peers::PeerDirectory;
    use crate::state::service::StateServices;
    use crate::state::{BoxFuture, Mode, QueuedPublish, StateOptions};

    #[test]
    fn min_qos_downgrades_to_the_weaker_grant() {
        assert_eq!(min_qos(Qos::ExactlyOnce, Qos::AtLeastOnce), Qos::AtLeastOnce);
        assert_eq!(min_qos(Qos::AtMostOnce, Qos::ExactlyOnce), Qos::AtMostOnce);
        assert_eq!(min_qos(Qos::MinusOne, Qos::ExactlyOnce), Qos::AtMostOnce);
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn write<'a>(
            &'a self,
            _addr: SocketAddr,
            _payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn status_reports_per_peer_inflight_and_queue_depth() {
        let clock = SystemClock;
        let directory = Arc::new(PeerDirectory::new());
        let registry = Arc::new(MessageRegistry::new(clock.clone(), Duration::from_secs(60)));
        let queue = Arc::new(MessageQueue::new(8));
        let topics = Arc::new(TopicRegistry::new(&StdHashMap::new()));
        let (state, _events) = crate::state::MessageStateService::new(
            Mode::Gateway,
            StateOptions::default(),
            clock,
            StateServices {
                transport: Arc::new(NullTransport) as Arc<dyn Transport>,
                directory: directory.clone(),
                registry: registry.clone(),
                queue: queue.clone(),
                topics,
                security: Arc::new(SecurityService::disabled()),
            },
        );
        let gateway = Gateway::new(state.clone(), ProtocolVersion::V1_2);

        let peer = Peer::new("sensor-1", ProtocolVersion::V1_2);
        directory.bind(&peer, "127.0.0.1:19999".parse().unwrap());
        queue
            .offer(
                &peer,
                QueuedPublish::new(
                    registry.add(b"queued".to_vec()),
                    "sensors/temp",
                    Qos::AtLeastOnce,
                    false,
                ),
            )
            .unwrap();
        state
            .send_message(
                &peer,
                Frame::Subscribe {
                    dup: false,
                    qos: Qos::AtLeastOnce,
                    msg_id: 0,
                    topic: TopicTarget::Predefined(7),
                },
            )
            .await
            .unwrap();

        let status = gateway.status();
        assert_eq!(status["inflight"], 1);
        assert_eq!(status["queued_messages"], 1);
        assert_eq!(status["peers"][0]["client_id"], "sensor-1");
        assert_eq!(status["peers"][0]["inflight_local"], 1);
        assert_eq!(status["peers"][0]["inflight_remote"], 0);
        assert_eq!(status["peers"][0]["queue_depth"], 1);
        assert_eq!(status["sessions"], 0);
    }
}
