//! UDP transport: one JSON message per datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::{Bridge, BridgeMessage, Transport};
use crate::error::BridgeError;

/// Largest datagram accepted by the listener.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    peers: Vec<SocketAddr>,
}

impl UdpTransport {
    /// Bind `addr` and target every peer except the bound address itself.
    pub async fn bind(addr: SocketAddr, peers: impl IntoIterator<Item = SocketAddr>) -> Result<Self, BridgeError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| BridgeError::Bind { addr, source })?;
        let local = socket.local_addr().map_err(|source| BridgeError::Bind { addr, source })?;
        let peers = peers.into_iter().filter(|peer| *peer != local && *peer != addr).collect();
        Ok(Self { socket, local, peers })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Receive datagrams forever and dispatch them to `bridge`.
    pub fn spawn_listener(self: &Arc<Self>, bridge: Arc<Bridge>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            tracing::info!(addr = %transport.local, peers = transport.peers.len(), "bridge listening");
            loop {
                let (len, from) = match transport.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "bridge receive failed");
                        continue;
                    }
                };
                match BridgeMessage::decode(&buf[..len]) {
                    Ok(message) => {
                        tracing::debug!(%from, action = %message.action, "bridge message received");
                        bridge.receive(message).await;
                    }
                    Err(e) => tracing::warn!(%from, error = %e, "dropping malformed bridge datagram"),
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn peers(&self) -> Vec<String> {
        self.peers.iter().map(ToString::to_string).collect()
    }

    async fn send(&self, peer: &str, message: &BridgeMessage) -> Result<(), BridgeError> {
        let bytes = message.encode()?;
        self.socket
            .send_to(&bytes, peer)
            .await
            .map_err(|source| BridgeError::Send { peer: peer.to_string(), source })?;
        Ok(())
    }
}
