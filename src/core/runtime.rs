//! Runtime orchestration.
//!
//! Wires the transport, state service, gateway handler, event loop, and
//! admin console together, and owns the shared queue-drain processor both
//! the gateway and the client bind into their flush schedulers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::codec::Frame;
use crate::core::config::Config;
use crate::core::time::{Clock, SystemClock};
use crate::gateway::Gateway;
use crate::messaging::{MessageQueue, MessageRegistry, TopicRegistry};
use crate::net::{SecurityService, Transport, UdpTransport};
use crate::ops::telemetry::{start_console, LogHandle, StatusSource};
use crate::peers::{Peer, PeerDirectory};
use crate::state::service::StateServices;
use crate::state::{
    BoxFuture, MessageStateService, Mode, ProcessResult, QueueProcessor, StateError, StateEvent,
};

// ---------------------------------------------------------------------------
// Queue drain
// ---------------------------------------------------------------------------

/// One pass over a peer's queue, invoked by the flush scheduler. Shared by
/// client and gateway: resolve the topic's wire form (registering on demand
/// for long topics), then hand the head of the queue to the state service.
pub struct QueueDrain<C: Clock> {
    state: MessageStateService<C>,
}

impl<C: Clock> QueueDrain<C> {
    pub fn new(state: MessageStateService<C>) -> Self {
        Self { state }
    }

    async fn drain_one(&self, peer: &Peer) -> Result<ProcessResult, StateError> {
        let queue = self.state.queue();
        if queue.depth(peer) == 0 {
            return Ok(ProcessResult::RemoveProcess);
        }
        if !self.state.can_send(peer) {
            return Ok(ProcessResult::BackoffProcess);
        }

        let Some(head) = queue.peek(peer) else {
            return Ok(ProcessResult::RemoveProcess);
        };
        if self
            .state
            .topics()
            .info_for_path(peer, &head.topic_path)
            .is_none()
        {
            // The topic has no wire form yet: run the REGISTER exchange
            // first, then come back for the publish.
            let topic_id = self.state.topics().register(peer, &head.topic_path);
            let token = self
                .state
                .send_message(
                    peer,
                    Frame::Register {
                        topic_id,
                        msg_id: 0,
                        topic_name: head.topic_path.clone(),
                    },
                )
                .await?;
            if let Some(token) = token {
                if self
                    .state
                    .wait_for_completion(peer, &token)
                    .await
                    .is_err()
                {
                    return Ok(ProcessResult::BackoffProcess);
                }
            }
            return Ok(ProcessResult::Reprocess);
        }

        let Some(queued) = queue.poll(peer) else {
            return Ok(ProcessResult::RemoveProcess);
        };
        if let Err(err) = self.state.send_publish(peer, queued.clone()).await {
            warn!(peer = %peer, %err, "publish send failed, requeueing");
            // When the queue filled up in the meantime the payload still
            // sits in the registry until its TTL.
            let _ = queue.offer(peer, queued);
            return Ok(ProcessResult::BackoffProcess);
        }

        if queue.depth(peer) > 0 {
            Ok(ProcessResult::Reprocess)
        } else {
            // Linger briefly for the acks before dropping the slot.
            Ok(ProcessResult::BackoffProcess)
        }
    }
}

impl<C: Clock> QueueProcessor for QueueDrain<C> {
    fn process<'a>(&'a self, peer: &'a Peer) -> BoxFuture<'a, Result<ProcessResult, StateError>> {
        Box::pin(self.drain_one(peer))
    }
}

// ---------------------------------------------------------------------------
// Gateway runtime
// ---------------------------------------------------------------------------

struct GatewayStatus<C: Clock> {
    gateway: Gateway<C>,
}

impl<C: Clock> StatusSource for GatewayStatus<C> {
    fn status(&self) -> serde_json::Value {
        self.gateway.status()
    }
}

/// Build and run the gateway until ctrl-c.
pub async fn run_gateway(config: Config, log_handle: Option<LogHandle>) -> Result<()> {
    let clock = SystemClock;
    let bind = config
        .network
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.network.bind))?;
    let transport = Arc::new(
        UdpTransport::bind(bind)
            .await
            .with_context(|| format!("unable to bind UDP listener on {bind}"))?,
    );
    info!(addr = %transport.local_addr()?, context_id = %config.identity.context_id, "gateway starting");

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

    let (state, mut events_rx) = MessageStateService::new(
        Mode::Gateway,
        config.state.to_options(),
        clock,
        StateServices {
            transport: transport.clone() as Arc<dyn Transport>,
            directory,
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

    let gateway = Gateway::new(state.clone(), config.identity.protocol_version);

    if let Some(console_bind) = &config.network.console_bind {
        start_console(
            console_bind,
            Arc::new(GatewayStatus {
                gateway: gateway.clone(),
            }),
            log_handle,
        )
        .await?;
    }

    // Application executor: commits and session-level notifications arrive
    // here, decoupled from the protocol path.
    let event_gateway = gateway.clone();
    let events = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                StateEvent::MessageReceived { peer, data } => {
                    event_gateway.route_publish(&peer, &data);
                }
                StateEvent::MessageSent { peer, message_id, .. } => {
                    tracing::debug!(peer = %peer, ?message_id, "publish confirmed");
                }
                StateEvent::MessageSendFailure { peer, queued, retries } => {
                    warn!(peer = %peer, topic = %queued.topic_path, retries, "publish abandoned");
                }
                StateEvent::ActiveTimeout { peer } => {
                    info!(peer = %peer, "peer idle past active window, evicting session");
                    event_gateway.evict_session(&peer);
                }
                StateEvent::RemoteDisconnect { peer } | StateEvent::ConnectionLost { peer } => {
                    event_gateway.evict_session(&peer);
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recv_gateway = gateway.clone();
    let receiver = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .run_receiver(shutdown_rx, move |from, bytes| {
                    let gateway = recv_gateway.clone();
                    tokio::spawn(gateway.handle_datagram(from, bytes));
                })
                .await;
        })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    state.shutdown();
    receiver.abort();
    events.abort();
    Ok(())
}
