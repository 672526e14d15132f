//! The message state machine.
//!
//! Orchestrates send and receive over the inflight tables: capacity gating,
//! id assignment, token issue, response matching, QoS commit points, the
//! inflight reaper, and the periodic activity sweep. Everything here is
//! scoped to a single peer at a time; errors on one peer never abort
//! another.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame, FrameKind, Qos, ReturnCode};
use crate::core::time::Clock;
use crate::messaging::{MessageQueue, MessageRegistry, TopicRegistry};
use crate::net::{SecurityService, Transport};
use crate::peers::{Peer, PeerDirectory};
use crate::state::inflight::{InflightEntry, InflightTables, PacketKey, WEAK_ATTACH};
use crate::state::{
    ActivityClock, CommitOperation, FlushScheduler, Mode, PublishData, QueuedPublish, Source,
    StateError, StateEvent, WaitToken, MAX_SATURATION_WAITS,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// The state core's view of the configuration.
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Upper bound on inflight entries per (peer, direction).
    pub max_messages_inflight: usize,
    /// Requeue attempts on error responses before giving up.
    pub max_error_retries: u32,
    /// Lower bound on the effective token wait duration.
    pub max_error_retry_time: Duration,
    /// Age past which the reaper evicts an inflight entry.
    pub max_time_inflight: Duration,
    /// Default caller wait timeout.
    pub max_wait: Duration,
    /// Lower bound for packet id allocation.
    pub msg_id_start: u16,
    /// Reschedule delay for REPROCESS/BACKOFF flush verdicts.
    pub min_flush_time: Duration,
    /// Idle threshold after which `ActiveTimeout` fires.
    pub active_context_timeout: Duration,
    /// Cadence of the periodic sweep (activity + reaper + registry tidy).
    pub state_loop_timeout: Duration,
    /// Whether the reaper re-offers evicted publishes to the queue.
    pub requeue_on_inflight_timeout: bool,
    /// Whether the reaper also sweeps the remote (receiving) table.
    pub reap_receiving_messages: bool,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            max_messages_inflight: 1,
            max_error_retries: 3,
            max_error_retry_time: Duration::from_millis(5_000),
            max_time_inflight: Duration::from_millis(20_000),
            max_wait: Duration::from_millis(10_000),
            msg_id_start: 1,
            min_flush_time: Duration::from_millis(25),
            active_context_timeout: Duration::from_millis(20_000),
            state_loop_timeout: Duration::from_millis(50),
            requeue_on_inflight_timeout: true,
            reap_receiving_messages: false,
        }
    }
}

/// Collaborators the state service is wired to.
pub struct StateServices<C: Clock> {
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<PeerDirectory>,
    pub registry: Arc<MessageRegistry<C>>,
    pub queue: Arc<MessageQueue>,
    pub topics: Arc<TopicRegistry>,
    pub security: Arc<SecurityService>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct MessageStateService<C: Clock> {
    inner: Arc<StateInner<C>>,
}

impl<C: Clock> Clone for MessageStateService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StateInner<C: Clock> {
    mode: Mode,
    opts: StateOptions,
    clock: C,
    tables: InflightTables,
    activity: Arc<ActivityClock<C>>,
    flush: FlushScheduler<C>,
    services: StateServices<C>,
    events: mpsc::UnboundedSender<StateEvent>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clock> MessageStateService<C> {
    pub fn new(
        mode: Mode,
        opts: StateOptions,
        clock: C,
        services: StateServices<C>,
    ) -> (Self, mpsc::UnboundedReceiver<StateEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let activity = Arc::new(ActivityClock::new(clock.clone()));
        let flush = FlushScheduler::new(
            clock.clone(),
            Arc::clone(&activity),
            opts.min_flush_time,
            opts.active_context_timeout,
        );
        let tables = InflightTables::new(opts.max_messages_inflight, opts.msg_id_start);
        let service = Self {
            inner: Arc::new(StateInner {
                mode,
                opts,
                clock,
                tables,
                activity,
                flush,
                services,
                events,
                loop_task: Mutex::new(None),
            }),
        };
        (service, events_rx)
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn options(&self) -> &StateOptions {
        &self.inner.opts
    }

    pub fn scheduler(&self) -> FlushScheduler<C> {
        self.inner.flush.clone()
    }

    pub fn activity(&self) -> Arc<ActivityClock<C>> {
        Arc::clone(&self.inner.activity)
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.inner.services.queue)
    }

    pub fn topics(&self) -> Arc<TopicRegistry> {
        Arc::clone(&self.inner.services.topics)
    }

    pub fn registry(&self) -> Arc<MessageRegistry<C>> {
        Arc::clone(&self.inner.services.registry)
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.inner.services.directory)
    }

    pub fn count_inflight(&self, peer: &Peer, source: Source) -> usize {
        self.inner.tables.count(peer, source)
    }

    pub fn inflight_peers(&self) -> Vec<Peer> {
        self.inner.tables.peers()
    }

    pub fn can_send(&self, peer: &Peer) -> bool {
        self.count_inflight(peer, Source::Local) < self.inner.opts.max_messages_inflight
    }

    /// Spawn the periodic state loop: idle sweep, inflight reaper, and
    /// message registry tidy.
    pub fn start(&self) {
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_state_loop().await });
        *self.inner.loop_task.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.loop_task.lock().take() {
            handle.abort();
        }
        self.inner.flush.shutdown();
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Send a protocol message. Returns a wait token when the message
    /// expects a terminal response.
    pub async fn send_message(
        &self,
        peer: &Peer,
        frame: Frame,
    ) -> Result<Option<WaitToken>, StateError> {
        self.send_internal(peer, frame, None).await
    }

    /// Send a queued publish: fetch the payload from the registry, apply
    /// integrity wrapping, resolve the topic's wire form, and push the
    /// PUBLISH through the inflight machinery.
    pub async fn send_publish(
        &self,
        peer: &Peer,
        queued: QueuedPublish,
    ) -> Result<Option<WaitToken>, StateError> {
        let payload = self
            .inner
            .services
            .registry
            .get(&queued.message_id)
            .ok_or_else(|| {
                StateError::ExpectationFailed(format!(
                    "payload {} missing from message registry",
                    queued.message_id
                ))
            })?;
        let payload = self.inner.services.security.wrap(&payload);
        let info = self
            .inner
            .services
            .topics
            .info_for_path(peer, &queued.topic_path)
            .ok_or_else(|| {
                StateError::ExpectationFailed(format!(
                    "topic {} has no wire form for {peer}",
                    queued.topic_path
                ))
            })?;
        let frame = Frame::Publish {
            dup: queued.is_dup_delivery(),
            qos: queued.qos,
            retain: queued.retained,
            topic_kind: info.kind,
            topic_id: info.topic_id,
            // A redelivery reuses the id of the original attempt.
            msg_id: queued.msg_id,
            payload,
        };
        self.send_internal(peer, frame, Some(queued)).await
    }

    async fn send_internal(
        &self,
        peer: &Peer,
        mut frame: Frame,
        queued: Option<QueuedPublish>,
    ) -> Result<Option<WaitToken>, StateError> {
        if !self.allowed_to_send(peer, &frame) {
            warn!(peer = %peer, kind = %frame.kind(), "allowed-to-send check failed");
            return Err(StateError::ExpectationFailed(
                "allowed-to-send check failed".into(),
            ));
        }

        let source = if frame.is_originating() {
            Source::Local
        } else {
            Source::Remote
        };
        let requires_response = frame.requires_response();

        // The saturation gate applies to sends that will occupy an inflight
        // slot. Pure responses and the QoS 2 follow-ups occupy nothing: the
        // pinned PUBLISH already holds the slot for the whole exchange, and
        // gating them against it would wedge the handshake.
        let mut waits = 0usize;
        while requires_response
            && self.inner.tables.count(peer, source) >= self.inner.opts.max_messages_inflight
        {
            warn!(
                peer = %peer,
                kind = %frame.kind(),
                %source,
                "max inflight reached for direction"
            );
            let blocker = self
                .inner
                .tables
                .with_peer(peer, |block| block.first(source))
                .and_then(|entry| entry.token);
            match (self.inner.mode, blocker) {
                (Mode::Client, Some(token)) => {
                    waits += 1;
                    if waits > MAX_SATURATION_WAITS {
                        return Err(StateError::ExpectationFailed(
                            "inflight stayed saturated across repeated waits".into(),
                        ));
                    }
                    let wait = self.inner.opts.max_wait.max(self.inner.opts.max_error_retry_time);
                    if token.wait(wait).await.is_err() {
                        warn!(peer = %peer, "unable to send, partial send in progress");
                        return Err(StateError::ExpectationFailed(
                            "unable to send, partial send in progress".into(),
                        ));
                    }
                }
                _ => {
                    return Err(StateError::ExpectationFailed(
                        "max number of inflight messages reached".into(),
                    ))
                }
            }
        }

        let token = if requires_response {
            Some(self.mark_inflight(peer, &mut frame, queued.clone())?)
        } else {
            None
        };

        debug!(
            peer = %peer,
            kind = %frame.kind(),
            msg_id = frame.msg_id(),
            inflight = requires_response,
            "sending message"
        );

        let bytes = codec::encode(peer.version(), &frame)?;
        let addr = self
            .inner
            .services
            .directory
            .address_of(peer)
            .ok_or_else(|| StateError::Transport(format!("no address bound for {peer}")))?;

        if let Err(err) = self.inner.services.transport.write(addr, &bytes).await {
            let err = StateError::Transport(err.to_string());
            if let Some(token) = &token {
                token.fail(err.clone());
            }
            return Err(err);
        }

        // Post-write bookkeeping: the transport has confirmed the datagram.
        self.inner
            .activity
            .note_sent(peer, frame.is_active() && !frame.is_error());

        if !requires_response && frame.is_publish() {
            if let Some(queued) = &queued {
                // QoS 0 (and -1) publishes commit once the datagram is out.
                self.dispatch_commit(CommitOperation {
                    peer: peer.clone(),
                    direction: Source::Local,
                    data: self.outbound_data(&frame, queued),
                    frame: frame.clone(),
                    message_id: Some(queued.message_id),
                });
            }
        }

        Ok(token)
    }

    /// Extension point for session-level gating; the state core itself
    /// imposes no policy here.
    fn allowed_to_send(&self, _peer: &Peer, _frame: &Frame) -> bool {
        true
    }

    fn mark_inflight(
        &self,
        peer: &Peer,
        frame: &mut Frame,
        mut queued: Option<QueuedPublish>,
    ) -> Result<WaitToken, StateError> {
        // PUBLISH direction is decided by provenance, not kind: a queued
        // back-reference means we originated it.
        let source = if frame.is_publish() {
            if queued.is_some() {
                Source::Local
            } else {
                Source::Remote
            }
        } else if frame.is_originating() {
            Source::Local
        } else {
            Source::Remote
        };

        let max_inflight = self.inner.opts.max_messages_inflight;
        let msg_id_start = self.inner.opts.msg_id_start;
        let now = self.inner.clock.now();

        self.inner.tables.with_peer(peer, |block| {
            let count = block.count(source);
            if count >= max_inflight {
                if source == Source::Local {
                    warn!(peer = %peer, count, "max inflight reached, failing local send");
                    return Err(StateError::ExpectationFailed(
                        "max number of inflight messages reached".into(),
                    ));
                }
                // Old inbound entries may linger depending on reap settings;
                // accept the overflow to keep the peer's session live.
                warn!(peer = %peer, count, "inbound inflight over capacity, accepting");
            }

            let key: PacketKey = if frame.needs_id() {
                let id = if frame.msg_id() > 0 {
                    frame.msg_id()
                } else {
                    let id = block.next_id(source, msg_id_start)?;
                    frame.set_msg_id(id);
                    id
                };
                block.note_used(source, id);
                if let Some(q) = queued.as_mut() {
                    q.msg_id = id;
                }
                PacketKey::from(id)
            } else {
                WEAK_ATTACH
            };

            let token = WaitToken::new(frame.clone());
            block.insert(
                source,
                key,
                InflightEntry {
                    frame: frame.clone(),
                    source,
                    token: Some(token.clone()),
                    queued,
                    created_at: now,
                },
            );
            debug!(peer = %peer, %source, key, kind = %frame.kind(), "marked inflight");
            Ok(token)
        })
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Drive the state machine with a received frame. Returns the original
    /// message a terminal response confirmed, if any.
    pub fn notify_received(&self, peer: &Peer, frame: Frame) -> Result<Option<Frame>, StateError> {
        self.inner
            .activity
            .note_received(peer, frame.is_active() && !frame.is_error());

        // Look up the entry this frame answers: frames that originate
        // exchanges live in the remote table, responses answer local ones.
        let source = if frame.is_originating() {
            Source::Remote
        } else {
            Source::Local
        };
        let key: PacketKey = if frame.needs_id() {
            PacketKey::from(frame.msg_id())
        } else {
            WEAK_ATTACH
        };
        let matched = self.inner.tables.exists(peer, source, key);
        let terminal = frame.is_terminal();

        debug!(
            peer = %peer,
            kind = %frame.kind(),
            key,
            %source,
            matched,
            terminal,
            "received frame"
        );

        if matched && terminal {
            return self.receive_terminal(peer, source, key, frame);
        }
        if matched {
            // Mid-flow response (PUBREC): the entry stays pinned, but this
            // is the outbound QoS 2 commit point.
            if frame.kind() == FrameKind::Pubrec {
                if let Some(entry) = self.inner.tables.get(peer, source, key) {
                    if let Some(op) = self.outbound_commit(peer, &entry) {
                        self.dispatch_commit(op);
                    }
                }
            }
            return Ok(None);
        }

        // Unmatched: a peer-initiated frame.
        if let Frame::Publish { qos, .. } = &frame {
            match qos {
                Qos::ExactlyOnce => {
                    // Pin the publish awaiting PUBREL before it may reach
                    // the application.
                    let mut pinned = frame.clone();
                    self.mark_inflight(peer, &mut pinned, None)?;
                }
                _ => {
                    if let Some(op) = self.inbound_commit(peer, &frame) {
                        self.dispatch_commit(op);
                    }
                }
            }
        }
        Ok(None)
    }

    fn receive_terminal(
        &self,
        peer: &Peer,
        source: Source,
        key: PacketKey,
        frame: Frame,
    ) -> Result<Option<Frame>, StateError> {
        let Some(entry) = self.inner.tables.remove(peer, source, key) else {
            warn!(peer = %peer, key, "inflight entry was cleared during receive");
            return Ok(None);
        };

        if !Frame::valid_response(&entry.frame, &frame) {
            if frame.is_disconnect() {
                warn!(peer = %peer, awaiting = %entry.frame.kind(), "unexpected disconnect while awaiting response");
                if let Some(token) = &entry.token {
                    token.fail_with_response(
                        Some(frame),
                        StateError::ExpectationFailed(
                            "unexpected disconnect received whilst awaiting response".into(),
                        ),
                    );
                }
                self.send_event(StateEvent::RemoteDisconnect { peer: peer.clone() });
                return Ok(None);
            }
            let err = StateError::invalid_response(&entry.frame, &frame);
            warn!(peer = %peer, %err, "invalid response");
            if let Some(token) = &entry.token {
                token.fail_with_response(Some(frame), err.clone());
            }
            return Err(err);
        }

        let is_error = frame.is_error();
        if let Some(token) = &entry.token {
            if is_error {
                let code = frame.return_code().unwrap_or(ReturnCode::Reserved(0xFF));
                token.fail_with_response(Some(frame.clone()), StateError::Protocol(code));
            } else {
                token.complete(Some(frame.clone()));
            }
        }

        if is_error {
            warn!(
                peer = %peer,
                kind = %frame.kind(),
                code = %frame.return_code().unwrap_or(ReturnCode::Reserved(0xFF)),
                "error response received"
            );
            if let Some(queued) = entry.queued.clone() {
                if queued.retry_count >= self.inner.opts.max_error_retries {
                    warn!(
                        peer = %peer,
                        retries = queued.retry_count,
                        "publish exceeded max retries, dropping"
                    );
                    self.send_event(StateEvent::MessageSendFailure {
                        peer: peer.clone(),
                        retries: queued.retry_count,
                        queued,
                    });
                } else {
                    match self.inner.services.queue.offer(peer, queued) {
                        Ok(()) => self.inner.flush.schedule_flush(peer),
                        Err(err) => warn!(peer = %peer, %err, "requeue after error refused"),
                    }
                }
            }
        } else {
            match frame.kind() {
                // Inbound QoS 2 commit: the pinned PUBLISH is released.
                FrameKind::Pubrel => {
                    if let Some(op) = self.inbound_commit(peer, &entry.frame) {
                        self.dispatch_commit(op);
                    }
                }
                // Outbound QoS 1 commit.
                FrameKind::Puback => {
                    if let Some(op) = self.outbound_commit(peer, &entry) {
                        self.dispatch_commit(op);
                    }
                }
                _ => {}
            }
        }

        Ok(Some(entry.frame))
    }

    // -----------------------------------------------------------------------
    // Commit points
    // -----------------------------------------------------------------------

    fn inbound_commit(&self, peer: &Peer, publish: &Frame) -> Option<CommitOperation> {
        let Frame::Publish {
            qos,
            retain,
            topic_kind,
            topic_id,
            payload,
            ..
        } = publish
        else {
            return None;
        };
        let Some(topic_path) = self
            .inner
            .services
            .topics
            .path_for(peer, *topic_kind, *topic_id)
        else {
            warn!(peer = %peer, topic_id, "publish for unknown topic id, dropping");
            return None;
        };
        Some(CommitOperation {
            peer: peer.clone(),
            direction: Source::Remote,
            data: PublishData {
                topic_path,
                qos: *qos,
                retained: *retain,
                payload: payload.clone(),
            },
            frame: publish.clone(),
            message_id: None,
        })
    }

    fn outbound_commit(&self, peer: &Peer, entry: &InflightEntry) -> Option<CommitOperation> {
        let Frame::Publish {
            qos,
            retain,
            payload,
            ..
        } = &entry.frame
        else {
            return None;
        };
        let queued = entry.queued.as_ref()?;
        Some(CommitOperation {
            peer: peer.clone(),
            direction: Source::Local,
            data: PublishData {
                topic_path: queued.topic_path.clone(),
                qos: *qos,
                retained: *retain,
                payload: payload.clone(),
            },
            frame: entry.frame.clone(),
            message_id: Some(queued.message_id),
        })
    }

    fn outbound_data(&self, frame: &Frame, queued: &QueuedPublish) -> PublishData {
        let payload = match frame {
            Frame::Publish { payload, .. } => payload.clone(),
            _ => Vec::new(),
        };
        PublishData {
            topic_path: queued.topic_path.clone(),
            qos: queued.qos,
            retained: queued.retained,
            payload,
        }
    }

    /// Hand a commit to the application executor. Inbound payloads are
    /// integrity-verified here; a failure drops that single message.
    fn dispatch_commit(&self, op: CommitOperation) {
        match op.direction {
            Source::Remote => {
                let payload = match self.inner.services.security.unwrap(&op.data.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(peer = %op.peer, %err, "dropping publish that failed integrity checks");
                        return;
                    }
                };
                self.send_event(StateEvent::MessageReceived {
                    peer: op.peer,
                    data: PublishData { payload, ..op.data },
                });
            }
            Source::Local => {
                self.send_event(StateEvent::MessageSent {
                    peer: op.peer,
                    message_id: op.message_id,
                    data: op.data,
                });
            }
        }
    }

    fn send_event(&self, event: StateEvent) {
        let _ = self.inner.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    pub async fn wait_for_completion(
        &self,
        peer: &Peer,
        token: &WaitToken,
    ) -> Result<Option<Frame>, StateError> {
        self.wait_with_timeout(peer, token, self.inner.opts.max_wait)
            .await
    }

    /// Wait for the token to settle. The effective duration is
    /// `max(timeout, max_error_retry_time)` so error-retry pathways can
    /// finish even under aggressive caller deadlines. A timeout fails the
    /// token and force-clears the peer's inflight state.
    pub async fn wait_with_timeout(
        &self,
        peer: &Peer,
        token: &WaitToken,
        timeout: Duration,
    ) -> Result<Option<Frame>, StateError> {
        let effective = timeout.max(self.inner.opts.max_error_retry_time);
        match token.wait(effective).await {
            Ok(response) => {
                debug!(peer = %peer, "wait completed ok");
                Ok(response)
            }
            Err(StateError::Timeout) => {
                warn!(peer = %peer, ?timeout, kind = %token.request().kind(), "timed out awaiting response");
                token.fail(StateError::Timeout);
                self.clear_inflight(peer);
                Err(StateError::Timeout)
            }
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Reaper
    // -----------------------------------------------------------------------

    /// Forced clear of every inflight entry for the peer.
    pub fn clear_inflight(&self, peer: &Peer) {
        self.clear_inflight_internal(peer, None);
    }

    /// Evict entries older than `max_time_inflight` as of `eviction_time`.
    pub fn reap_inflight(&self, peer: &Peer, eviction_time: Instant) {
        self.clear_inflight_internal(peer, Some(eviction_time));
    }

    fn clear_inflight_internal(&self, peer: &Peer, eviction_time: Option<Instant>) {
        let max_age = self.inner.opts.max_time_inflight;
        let mut sources = Vec::with_capacity(2);
        if self.inner.opts.reap_receiving_messages {
            sources.push(Source::Remote);
        }
        sources.push(Source::Local);

        let reaped = self.inner.tables.with_peer(peer, |block| {
            let mut reaped = Vec::new();
            for source in &sources {
                for key in block.keys(*source) {
                    let expired = match eviction_time {
                        None => true,
                        Some(at) => block
                            .get(*source, key)
                            .is_some_and(|entry| entry.created_at + max_age < at),
                    };
                    if expired {
                        if let Some(entry) = block.remove(*source, key) {
                            reaped.push(entry);
                        }
                    }
                }
            }
            reaped
        });

        for entry in reaped {
            self.reap_entry(peer, entry);
        }
    }

    fn reap_entry(&self, peer: &Peer, entry: InflightEntry) {
        warn!(
            peer = %peer,
            kind = %entry.frame.kind(),
            age = ?self.inner.clock.now().saturating_duration_since(entry.created_at),
            "clearing message from inflight"
        );

        if let Some(token) = &entry.token {
            token.fail(StateError::Timeout);
        }

        let Some(mut queued) = entry.queued else {
            return;
        };
        if !self.inner.opts.requeue_on_inflight_timeout {
            return;
        }
        let exhausted = queued.retry_count >= self.inner.opts.max_error_retries;
        if exhausted {
            // The session is going away; reset the counter so the payload
            // can be delivered on the next connection.
            queued.retry_count = 0;
        }
        match self.inner.services.queue.offer(peer, queued) {
            Ok(()) => {
                if !exhausted {
                    self.inner.flush.schedule_flush(peer);
                }
            }
            Err(err) => debug!(peer = %peer, %err, "requeue refused during reap"),
        }
        if exhausted {
            self.send_event(StateEvent::ConnectionLost { peer: peer.clone() });
        }
    }

    /// Authoritative per-peer teardown: cancel the flush slot, drop the
    /// activity clocks, and reset the id seeds. Inflight entries are purged
    /// separately via [`Self::clear_inflight`] when the caller wants that.
    pub fn clear(&self, peer: &Peer) {
        info!(peer = %peer, "clearing message state");
        self.inner.flush.unschedule_flush(peer);
        self.inner.activity.clear(peer);
        self.inner.tables.clear_ids(peer);
    }

    // -----------------------------------------------------------------------
    // Periodic loop
    // -----------------------------------------------------------------------

    async fn run_state_loop(&self) {
        let cadence = self.inner.opts.state_loop_timeout.max(Duration::from_millis(1));
        loop {
            self.inner.clock.sleep(cadence).await;

            let idle_after = self.inner.opts.active_context_timeout;
            if !idle_after.is_zero() {
                for peer in self.inner.activity.sweep_idle(idle_after) {
                    info!(peer = %peer, "active context timed out");
                    self.send_event(StateEvent::ActiveTimeout { peer });
                }
            }

            let now = self.inner.clock.now();
            for peer in self.inner.tables.peers() {
                self.reap_inflight(&peer, now);
            }

            let tidied = self.inner.services.registry.tidy();
            if tidied > 0 {
                debug!(tidied, "message registry tidied");
            }
        }
    }
}
