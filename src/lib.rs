#![deny(unused, dead_code)]
#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: protocol dispatch is inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Large enum variants: Frame carries payload vectors by design
#![allow(clippy::large_enum_variant)]
// Explicit match arms over wildcards in wire dispatch
#![allow(clippy::match_same_arms)]

//! MQTT-SN client, gateway, and wire codec.
//!
//! The heart of the crate is the per-peer message state service: inflight
//! tables with a 16-bit packet id allocator, QoS 0/1/2 delivery semantics
//! in both directions, cooperative per-peer flush scheduling, inflight
//! reaping with requeue, and single-shot wait tokens bridging sender tasks
//! and network responses.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Gateway runtime orchestration and the queue drain
//! - `core::time` - Deterministic time utilities
//!
//! ## Protocol
//! - `codec` - MQTT-SN 1.2/2.0 wire codec and frame classification
//! - `state` - The per-peer message state core
//! - `peers` - Peer identity and the address directory
//!
//! ## Collaborators
//! - `messaging::queue` - Per-peer bounded publish queues
//! - `messaging::registry` - UUID-keyed payload store
//! - `messaging::topics` - Topic normalization and alias registry
//! - `net` - UDP transport and payload integrity
//!
//! ## Surfaces
//! - `client` - Client session API
//! - `gateway` - Gateway session handling and publish fan-out
//! - `ops::telemetry` - Tracing setup and the admin console
//! - `cli` - Command-line interface

// Core infrastructure
pub mod core;

// Protocol
pub mod codec;
pub mod peers;
pub mod state;

// Collaborators
pub mod messaging;
pub mod net;

// Surfaces
pub mod client;
pub mod gateway;
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime, time};
pub use client::{Client, ClientOptions};
pub use codec::{Frame, ProtocolVersion, Qos, ReturnCode};
pub use gateway::Gateway;
pub use peers::{Peer, PeerDirectory};
pub use state::{
    MessageStateService, Mode, ProcessResult, QueuedPublish, Source, StateError, StateEvent,
    StateOptions, WaitToken,
};
