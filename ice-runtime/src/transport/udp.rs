//! UDP transceiver.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use ice_core::{IceError, Message, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use super::{connection_lost, Transceiver};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// A UDP socket carrying one protocol message per datagram.
///
/// Client transceivers are connected to their peer. Server transceivers are
/// bound to a local port and answer the most recent sender.
#[derive(Debug)]
pub struct UdpTransceiver {
    socket: UdpSocket,
    connected: bool,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTransceiver {
    /// Wraps a socket already connected to its peer.
    pub fn client(socket: UdpSocket) -> Result<Self> {
        let peer = socket.peer_addr()?;
        Ok(Self {
            socket,
            connected: true,
            peer: Mutex::new(Some(peer)),
        })
    }

    /// Binds a server-side socket.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| IceError::ConnectFailed(format!("cannot bind {addr}: {e}")))?;
        Ok(Self {
            socket,
            connected: false,
            peer: Mutex::new(None),
        })
    }

    /// Returns the bound local port.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await.map_err(connection_lost)?;
            if !self.connected {
                *self.peer.lock() = Some(from);
            }
            match Message::parse(Bytes::copy_from_slice(&buf[..n])) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => {
                    tracing::warn!(%from, error = %err, "discarding malformed datagram");
                }
            }
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(IceError::DatagramLimit(format!(
                "{} bytes exceeds the {MAX_DATAGRAM_SIZE}-byte limit",
                data.len()
            )));
        }
        if self.connected {
            self.socket.send(&data).await.map_err(connection_lost)?;
            return Ok(());
        }
        let peer = *self.peer.lock();
        match peer {
            Some(peer) => {
                self.socket.send_to(&data, peer).await.map_err(connection_lost)?;
                Ok(())
            }
            None => Err(IceError::ConnectionLost("datagram peer unknown".to_string())),
        }
    }

    async fn close(&self) {}

    fn protocol(&self) -> &str {
        "udp"
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn max_send_size(&self) -> Option<usize> {
        Some(MAX_DATAGRAM_SIZE)
    }

    fn description(&self) -> String {
        let local = self
            .socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        match *self.peer.lock() {
            Some(peer) => format!("local address = {local}\nremote address = {peer}"),
            None => format!("local address = {local}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::protocol::MessageType;

    #[tokio::test]
    async fn test_datagram_exchange() {
        let server = UdpTransceiver::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = server.local_port().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(("127.0.0.1", port)).await.unwrap();
        let client = UdpTransceiver::client(socket).unwrap();
        assert!(client.is_datagram());

        // A malformed datagram is skipped.
        client.write(Bytes::from_static(b"junk")).await.unwrap();
        client
            .write(Message::header_only(MessageType::ValidateConnection).to_bytes())
            .await
            .unwrap();

        let msg = server.read().await.unwrap().unwrap();
        assert_eq!(msg.message_type(), MessageType::ValidateConnection);
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect("127.0.0.1:9").await.unwrap();
        let client = UdpTransceiver::client(socket).unwrap();
        let big = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        assert!(matches!(
            client.write(big).await,
            Err(IceError::DatagramLimit(_))
        ));
    }
}
