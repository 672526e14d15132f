//! UDP datagram transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::{Transport, TransportError};
use crate::state::BoxFuture;

/// Largest datagram the receive loop accepts; MQTT-SN long frames top out
/// at 65535 including the length field.
pub const MAX_DATAGRAM: usize = 65_535;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a socket for a gateway (fixed port) or client (ephemeral port).
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(local = %socket.local_addr()?, "udp transport bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the receive loop, handing each datagram to `handler`. Returns
    /// when the socket errors out or `shutdown` flips.
    pub async fn run_receiver<F>(&self, mut shutdown: tokio::sync::watch::Receiver<bool>, handler: F)
    where
        F: Fn(SocketAddr, Vec<u8>),
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => handler(from, buf[..len].to_vec()),
                        Err(err) => {
                            warn!(%err, "udp receive failed");
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn write<'a>(
        &'a self,
        addr: SocketAddr,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.socket
                .send_to(payload, addr)
                .await
                .map_err(|err| TransportError::Send(err.to_string()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_arrive_at_the_handler() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let receiver = tokio::spawn(async move {
            b.run_receiver(shutdown_rx, move |from, bytes| {
                let _ = tx.send((from, bytes));
            })
            .await;
        });

        a.write(b_addr, b"ping").await.unwrap();
        let (from, bytes) = rx.recv().await.unwrap();
        assert_eq!(bytes, b"ping");
        assert_eq!(from, a.local_addr().unwrap());
        receiver.abort();
    }
}
