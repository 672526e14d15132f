//! Per-peer message state core.
//!
//! This is the component that owns the inflight-message tables, assigns and
//! recycles 16-bit packet identifiers, enforces QoS delivery semantics in
//! both directions, schedules per-peer queue flushes, times out and requeues
//! stalled publishes, and releases callers waiting on a confirmation token.
//!
//! - `token` - single-shot rendezvous between a sender and the response
//! - `inflight` - per-peer, per-direction inflight tables + id allocator
//! - `activity` - last-sent/last-received/last-active peer clocks
//! - `flush` - cooperative per-peer queue flush scheduler
//! - `service` - the state machine orchestrating send/receive/reap

pub mod activity;
pub mod flush;
pub mod inflight;
pub mod service;
pub mod token;

use thiserror::Error;
use uuid::Uuid;

use crate::codec::{Frame, Qos, ReturnCode};
use crate::peers::Peer;

pub use activity::ActivityClock;
pub use flush::{FlushScheduler, ProcessResult, QueueProcessor};
pub use inflight::{InflightEntry, InflightTables};
pub use service::{MessageStateService, StateOptions};
pub use token::WaitToken;

/// Boxed future used at the dyn seams (queue processor, transport).
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// Whether we run the client or the gateway side of the protocol. The only
/// behavioral difference inside the core is the saturation policy on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Gateway,
}

/// Which side originated the exchange an inflight entry belongs to.
/// Identifiers are scoped to `(peer, source)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Local,
    Remote,
}

impl Source {
    pub(crate) fn index(self) -> usize {
        match self {
            Source::Local => 0,
            Source::Remote => 1,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Local => f.write_str("local"),
            Source::Remote => f.write_str("remote"),
        }
    }
}

/// A publish waiting in (or requeued to) the per-peer message queue. The
/// payload itself lives in the message registry under `message_id`.
#[derive(Debug, Clone)]
pub struct QueuedPublish {
    pub message_id: Uuid,
    pub topic_path: String,
    pub qos: Qos,
    pub retained: bool,
    pub retry_count: u32,
    /// Packet id of a previous delivery attempt; 0 when never sent. A
    /// retransmit must go out under the same id with DUP set.
    pub msg_id: u16,
}

impl QueuedPublish {
    pub fn new(message_id: Uuid, topic_path: impl Into<String>, qos: Qos, retained: bool) -> Self {
        Self {
            message_id,
            topic_path: topic_path.into(),
            qos,
            retained,
            retry_count: 0,
            msg_id: 0,
        }
    }

    /// DUP is set when the message has been handed to the transport before.
    pub fn is_dup_delivery(&self) -> bool {
        self.retry_count > 1 || self.msg_id > 0
    }
}

/// Payload view of a publish as delivered to (or confirmed for) the
/// application.
#[derive(Debug, Clone)]
pub struct PublishData {
    pub topic_path: String,
    pub qos: Qos,
    pub retained: bool,
    pub payload: Vec<u8>,
}

/// Commit of a confirmed publish, created at the QoS commit points and
/// handed to the application executor.
#[derive(Debug, Clone)]
pub struct CommitOperation {
    pub peer: Peer,
    pub direction: Source,
    pub data: PublishData,
    pub frame: Frame,
    pub message_id: Option<Uuid>,
}

/// Events delivered asynchronously to the application.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// An inbound publish passed its commit point.
    MessageReceived { peer: Peer, data: PublishData },
    /// An outbound publish was confirmed (or required no confirmation).
    MessageSent {
        peer: Peer,
        message_id: Option<Uuid>,
        data: PublishData,
    },
    /// A queued publish exhausted its error retries and was dropped.
    MessageSendFailure {
        peer: Peer,
        queued: QueuedPublish,
        retries: u32,
    },
    /// No active traffic was seen from the peer within the configured window.
    ActiveTimeout { peer: Peer },
    /// The peer disconnected while we were awaiting a response.
    RemoteDisconnect { peer: Peer },
    /// A publish was evicted past its retry ceiling; the session is gone.
    ConnectionLost { peer: Peer },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("expectation failed: {0}")]
    ExpectationFailed(String),
    #[error("timed out waiting for response")]
    Timeout,
    #[error("invalid response {response} received for {request}")]
    InvalidResponse { request: String, response: String },
    #[error("protocol error response: {0}")]
    Protocol(ReturnCode),
    #[error("no free packet id in the usable range")]
    IdExhausted,
    #[error("message queue refused the message: {0}")]
    QueueAccept(String),
    #[error("payload integrity check failed")]
    SecurityCheckFailed,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("codec failure: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

impl StateError {
    pub(crate) fn invalid_response(request: &Frame, response: &Frame) -> Self {
        StateError::InvalidResponse {
            request: request.kind().to_string(),
            response: response.kind().to_string(),
        }
    }
}

/// Hard cap on the saturation-wait loop in client mode; the original
/// implementation recursed here without bound.
pub(crate) const MAX_SATURATION_WAITS: usize = 8;
