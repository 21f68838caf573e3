//! TCP transceiver and acceptor.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use ice_core::{IceError, Message, MessageCodec, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;

use super::{connection_lost, read_error, Acceptor, Transceiver};
use crate::endpoint::{Endpoint, TcpEndpoint};

/// A TCP session framed with [`MessageCodec`].
#[derive(Debug)]
pub struct TcpTransceiver {
    reader: Mutex<FramedRead<OwnedReadHalf, MessageCodec>>,
    writer: Mutex<OwnedWriteHalf>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TcpTransceiver {
    /// Wraps a connected stream.
    pub fn new(stream: TcpStream, max_message_size: usize) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read, MessageCodec::with_max_size(max_message_size))),
            writer: Mutex::new(write),
            local,
            remote,
        })
    }

    /// Returns the peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        reader.next().await.transpose().map_err(read_error)
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await.map_err(connection_lost)?;
        writer.flush().await.map_err(connection_lost)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn protocol(&self) -> &str {
        "tcp"
    }

    fn description(&self) -> String {
        format!("local address = {}\nremote address = {}", self.local, self.remote)
    }
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    endpoint: TcpEndpoint,
    max_message_size: usize,
}

impl TcpAcceptor {
    /// Binds `addr`. The endpoint's port is replaced with the bound port.
    pub async fn bind(addr: SocketAddr, endpoint: TcpEndpoint, max_message_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IceError::ConnectFailed(format!("cannot bind {addr}: {e}")))?;
        let port = listener.local_addr()?.port();
        tracing::debug!(target: "ice::network", %addr, port, "listening for tcp connections");
        Ok(Self {
            listener,
            endpoint: endpoint.with_port(port),
            max_message_size,
        })
    }

    pub(crate) fn tcp_endpoint(&self) -> &TcpEndpoint {
        &self.endpoint
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub(crate) async fn accept_stream(&self) -> Result<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(target: "ice::network", %peer, "accepted tcp connection");
        Ok(stream)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn Transceiver>> {
        let stream = self.accept_stream().await?;
        Ok(Box::new(TcpTransceiver::new(stream, self.max_message_size)?))
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.endpoint.clone())
    }

    fn description(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp listener {addr}"),
            Err(_) => "tcp listener".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::protocol::MessageType;

    #[tokio::test]
    async fn test_accept_and_exchange_message() {
        let acceptor = TcpAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            TcpEndpoint::new("127.0.0.1", 0, -1),
            0,
        )
        .await
        .unwrap();
        let port = acceptor.endpoint().port().unwrap();
        assert_ne!(port, 0);

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let t = TcpTransceiver::new(stream, 0).unwrap();
            t.write(Message::header_only(MessageType::ValidateConnection).to_bytes())
                .await
                .unwrap();
            t
        });

        let server = acceptor.accept().await.unwrap();
        server.initialize().await.unwrap();
        let msg = server.read().await.unwrap().unwrap();
        assert_eq!(msg.message_type(), MessageType::ValidateConnection);

        let client = client.await.unwrap();
        client.close().await;
        assert!(server.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_magic_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });
        let t = TcpTransceiver::new(TcpStream::connect(addr).await.unwrap(), 0).unwrap();
        assert!(matches!(t.read().await, Err(IceError::BadMagic(_))));
    }
}
