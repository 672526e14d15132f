//! Client session API.
//!
//! A typed façade over the state service: each call builds the protocol
//! frame, pushes it through the state machine, and (where the exchange has
//! a terminal response) awaits the returned token. Publishes go through the
//! per-peer queue and flush scheduler like any other runtime, so retry and
//! DUP semantics are identical on both sides of the protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, Frame, ProtocolVersion, Qos, ReturnCode, TopicTarget};
use crate::core::config::Config;
use crate::core::runtime::QueueDrain;
use crate::core::time::{Clock, SystemClock};
use crate::messaging::{MessageQueue, MessageRegistry, TopicRegistry};
use crate::net::{SecurityService, Transport, UdpTransport};
use crate::peers::{Peer, PeerDirectory};
use crate::state::service::StateServices;
use crate::state::{
    MessageStateService, Mode, QueuedPublish, StateError, StateEvent, WaitToken,
};

pub struct ClientOptions {
    pub client_id: String,
    pub gateway: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

pub struct Client<C: Clock = SystemClock> {
    state: MessageStateService<C>,
    /// The remote gateway as a peer context.
    gateway: Peer,
    /// Our own identity on the wire.
    client_id: String,
    keep_alive: Duration,
    clean_session: bool,
    shutdown: watch::Sender<bool>,
}

impl Client<SystemClock> {
    /// Bind an ephemeral UDP socket, wire up the state core, and start the
    /// receive loop. Returns the client plus the application event stream.
    pub async fn bind(
        options: ClientOptions,
        config: &Config,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<StateEvent>)> {
        let clock = SystemClock;
        let transport = Arc::new(UdpTransport::bind("0.0.0.0:0".parse()?).await?);
        let directory = Arc::new(PeerDirectory::new());
        let registry = Arc::new(MessageRegistry::new(
            clock.clone(),
            Duration::from_millis(config.queue.message_registry_ttl),
        ));
        let queue = Arc::new(MessageQueue::new(config.queue.max_messages_in_queue));
        let topics = Arc::new(TopicRegistry::new(&config.topics.predefined));
        let security = Arc::new(SecurityService::from_config(
            config.security.integrity_key.as_deref(),
        ));

        let (state, events_rx) = MessageStateService::new(
            Mode::Client,
            config.state.to_options(),
            clock,
            StateServices {
                transport: transport.clone() as Arc<dyn Transport>,
                directory: directory.clone(),
                registry,
                queue,
                topics,
                security,
            },
        );
        state
            .scheduler()
            .bind_processor(Arc::new(QueueDrain::new(state.clone())));
        state.start();

        let gateway = Peer::new(format!("gateway@{}", options.gateway), options.protocol_version);
        directory.bind(&gateway, options.gateway);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Self {
            state: state.clone(),
            gateway: gateway.clone(),
            client_id: options.client_id,
            keep_alive: options.keep_alive,
            clean_session: options.clean_session,
            shutdown,
        };
        tokio::spawn(async move {
            let receiver = ClientReceiver { state, gateway };
            transport
                .run_receiver(shutdown_rx, move |from, bytes| {
                    receiver.clone().dispatch(from, bytes);
                })
                .await;
        });
        Ok((client, events_rx))
    }
}

impl<C: Clock> Client<C> {
    pub fn state(&self) -> &MessageStateService<C> {
        &self.state
    }

    pub fn peer(&self) -> &Peer {
        &self.gateway
    }

    /// CONNECT and await the CONNACK.
    pub async fn connect(&self) -> Result<(), StateError> {
        let frame = Frame::Connect {
            client_id: self.client_id.clone(),
            duration: self.keep_alive.as_secs().min(u64::from(u16::MAX)) as u16,
            clean_session: self.clean_session,
            will: false,
            session_expiry: None,
        };
        let response = self.roundtrip(frame).await?;
        match response {
            Some(Frame::Connack { return_code }) if !return_code.is_error() => {
                info!(peer = %self.gateway, "connected");
                Ok(())
            }
            other => Err(StateError::ExpectationFailed(format!(
                "connect rejected: {other:?}"
            ))),
        }
    }

    /// SUBSCRIBE; returns the granted QoS and assigned topic id.
    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(Qos, u16), StateError> {
        let target = topic_target(topic);
        let frame = Frame::Subscribe {
            dup: false,
            qos,
            msg_id: 0,
            topic: target,
        };
        match self.roundtrip(frame).await? {
            Some(Frame::Suback {
                qos: granted,
                topic_id,
                ..
            }) => {
                if topic_id > 0 && !topic.contains(['+', '#']) && topic.len() > 2 {
                    self.state.topics().learn(&self.gateway, topic, topic_id);
                }
                info!(topic, ?granted, topic_id, "subscribed");
                Ok((granted, topic_id))
            }
            other => Err(StateError::ExpectationFailed(format!(
                "subscribe rejected: {other:?}"
            ))),
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), StateError> {
        let frame = Frame::Unsubscribe {
            msg_id: 0,
            topic: topic_target(topic),
        };
        self.roundtrip(frame).await?;
        Ok(())
    }

    /// REGISTER a topic, learning the gateway-assigned id.
    pub async fn register(&self, topic: &str) -> Result<u16, StateError> {
        let frame = Frame::Register {
            topic_id: 0,
            msg_id: 0,
            topic_name: topic.to_string(),
        };
        match self.roundtrip(frame).await? {
            Some(Frame::Regack {
                topic_id,
                return_code,
                ..
            }) if !return_code.is_error() => {
                self.state.topics().learn(&self.gateway, topic, topic_id);
                debug!(topic, topic_id, "topic registered");
                Ok(topic_id)
            }
            other => Err(StateError::ExpectationFailed(format!(
                "register rejected: {other:?}"
            ))),
        }
    }

    /// Queue a publish; delivery runs through the flush scheduler. The
    /// returned id correlates with the eventual `MessageSent` event.
    pub async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<Uuid, StateError> {
        crate::messaging::topics::check_publish_topic(topic)?;
        // Topics longer than a short topic need a registration roundtrip
        // before the publish has a wire form.
        if self
            .state
            .topics()
            .info_for_path(&self.gateway, topic)
            .is_none()
        {
            self.register(topic).await?;
        }
        let message_id = self.state.registry().add(payload);
        let queued = QueuedPublish::new(message_id, topic, qos, retained);
        self.state.queue().offer(&self.gateway, queued)?;
        self.state.scheduler().schedule_flush(&self.gateway);
        Ok(message_id)
    }

    /// PINGREQ/PINGRESP keepalive roundtrip.
    pub async fn ping(&self) -> Result<(), StateError> {
        let frame = Frame::Pingreq {
            client_id: Some(self.client_id.clone()),
        };
        self.roundtrip(frame).await?;
        Ok(())
    }

    /// Send DISCONNECT and tear down local state. The gateway's DISCONNECT
    /// reply needs no rendezvous.
    pub async fn disconnect(&self) -> Result<(), StateError> {
        self.state
            .send_message(&self.gateway, Frame::Disconnect { duration: None })
            .await?;
        self.state.clear_inflight(&self.gateway);
        self.state.clear(&self.gateway);
        let _ = self.shutdown.send(true);
        info!(peer = %self.gateway, "disconnected");
        Ok(())
    }

    async fn roundtrip(&self, frame: Frame) -> Result<Option<Frame>, StateError> {
        let token = self.state.send_message(&self.gateway, frame).await?;
        match token {
            Some(token) => self.state.wait_for_completion(&self.gateway, &token).await,
            None => Ok(None),
        }
    }

    /// Direct access for callers that want to drive a send and keep the
    /// token (load harnesses, tests).
    pub async fn send_raw(&self, frame: Frame) -> Result<Option<WaitToken>, StateError> {
        self.state.send_message(&self.gateway, frame).await
    }
}

fn topic_target(topic: &str) -> TopicTarget {
    if topic.len() <= 2 {
        TopicTarget::Short(topic.to_string())
    } else {
        TopicTarget::Filter(topic.to_string())
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

struct ClientReceiver<C: Clock> {
    state: MessageStateService<C>,
    gateway: Peer,
}

impl<C: Clock> Clone for ClientReceiver<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

impl<C: Clock> ClientReceiver<C> {
    fn dispatch(self, from: SocketAddr, bytes: Vec<u8>) {
        tokio::spawn(async move {
            if let Err(err) = self.receive(from, bytes).await {
                warn!(%from, %err, "client receive failed");
            }
        });
    }

    async fn receive(&self, _from: SocketAddr, bytes: Vec<u8>) -> Result<(), StateError> {
        let frame = codec::decode(self.gateway.version(), &bytes)?;
        let peer = self.gateway.clone();

        let confirmed = match self.state.notify_received(&peer, frame.clone()) {
            Ok(confirmed) => confirmed,
            Err(err) => {
                warn!(peer = %peer, %err, "receive rejected by state machine");
                None
            }
        };
        if let (
            Some(Frame::Register { topic_name, .. }),
            Frame::Regack {
                topic_id,
                return_code,
                ..
            },
        ) = (&confirmed, &frame)
        {
            if !return_code.is_error() {
                self.state.topics().learn(&peer, topic_name, *topic_id);
            }
        }

        match frame {
            // The gateway pushes an alias before publishing a long topic.
            Frame::Register {
                msg_id,
                topic_id,
                topic_name,
            } => {
                self.state.topics().learn(&peer, &topic_name, topic_id);
                self.state
                    .send_message(
                        &peer,
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
            } => match qos {
                Qos::AtLeastOnce => {
                    let known = self
                        .state
                        .topics()
                        .path_for(&peer, topic_kind, topic_id)
                        .is_some();
                    let return_code = if known {
                        ReturnCode::Accepted
                    } else {
                        ReturnCode::RejectedInvalidTopicId
                    };
                    self.state
                        .send_message(
                            &peer,
                            Frame::Puback {
                                topic_id,
                                msg_id,
                                return_code,
                            },
                        )
                        .await?;
                }
                Qos::ExactlyOnce => {
                    self.state
                        .send_message(&peer, Frame::Pubrec { msg_id })
                        .await?;
                }
                Qos::AtMostOnce | Qos::MinusOne => {}
            },
            Frame::Pubrec { msg_id } => {
                self.state
                    .send_message(&peer, Frame::Pubrel { msg_id })
                    .await?;
            }
            Frame::Pubrel { msg_id } => {
                self.state
                    .send_message(&peer, Frame::Pubcomp { msg_id })
                    .await?;
            }
            Frame::Pingreq { .. } => {
                self.state.send_message(&peer, Frame::Pingresp).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
