//! Networking.
//!
//! - `udp` - datagram transport over a tokio UDP socket
//! - `security` - optional payload integrity wrap/unwrap

pub mod security;
pub mod udp;

use std::net::SocketAddr;

use thiserror::Error;

use crate::state::BoxFuture;

pub use security::SecurityService;
pub use udp::UdpTransport;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("socket closed")]
    Closed,
}

/// Unreliable datagram send. The returned future resolves once the datagram
/// has been handed to the network; the state service runs its post-send
/// bookkeeping (activity clocks, QoS 0 commit) on that completion.
pub trait Transport: Send + Sync + 'static {
    fn write<'a>(
        &'a self,
        addr: SocketAddr,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}
