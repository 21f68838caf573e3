//! WebSocket transceiver and acceptor.
//!
//! The upgrade handshake runs in [`Transceiver::initialize`] on both sides.
//! Accepting only accepts the TCP connection, so a slow client cannot stall
//! the accept loop.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ice_core::{IceError, Message, MessageCodec, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Decoder;
use url::Url;

use super::tcp::TcpAcceptor;
use super::{Acceptor, Transceiver};
use crate::endpoint::{Endpoint, WsEndpoint};

type WsStream = WebSocketStream<TcpStream>;

#[derive(Debug)]
enum Role {
    Client(Url),
    Server,
}

#[derive(Debug)]
struct Reader {
    stream: Option<SplitStream<WsStream>>,
    buffer: BytesMut,
    codec: MessageCodec,
}

/// A WebSocket session carrying protocol messages in binary frames.
#[derive(Debug)]
pub struct WsTransceiver {
    role: Role,
    pending: parking_lot::Mutex<Option<TcpStream>>,
    sink: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    reader: Mutex<Reader>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl WsTransceiver {
    fn new(role: Role, stream: TcpStream, max_message_size: usize) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            role,
            pending: parking_lot::Mutex::new(Some(stream)),
            sink: Mutex::new(None),
            reader: Mutex::new(Reader {
                stream: None,
                buffer: BytesMut::with_capacity(8192),
                codec: MessageCodec::with_max_size(max_message_size),
            }),
            local,
            remote,
        })
    }

    /// Creates the client side over a connected stream.
    pub fn client(
        stream: TcpStream,
        host: &str,
        port: u16,
        resource: &str,
        max_message_size: usize,
    ) -> Result<Self> {
        let host = match host {
            "" => "127.0.0.1".to_string(),
            h if h.contains(':') => format!("[{h}]"),
            h => h.to_string(),
        };
        let url = Url::parse(&format!("ws://{host}:{port}{resource}"))
            .map_err(|e| IceError::EndpointParse(format!("invalid WebSocket URL: {e}")))?;
        Self::new(Role::Client(url), stream, max_message_size)
    }

    /// Creates the server side over an accepted stream.
    pub fn server(stream: TcpStream, max_message_size: usize) -> Result<Self> {
        Self::new(Role::Server, stream, max_message_size)
    }
}

#[async_trait]
impl Transceiver for WsTransceiver {
    async fn initialize(&self) -> Result<()> {
        let stream = self.pending.lock().take();
        let Some(stream) = stream else {
            return Ok(());
        };

        let ws = match &self.role {
            Role::Client(url) => {
                let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream)
                    .await
                    .map_err(|e| IceError::ConnectFailed(format!("WebSocket upgrade to {url} failed: {e}")))?;
                tracing::debug!(target: "ice::network", url = %url, "established WebSocket connection");
                ws
            }
            Role::Server => {
                let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
                    IceError::Protocol(format!("WebSocket handshake from {} failed: {e}", self.remote))
                })?;
                tracing::debug!(target: "ice::network", peer = %self.remote, "accepted WebSocket connection");
                ws
            }
        };

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.reader.lock().await.stream = Some(source);
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;
        let Some(stream) = reader.stream.as_mut() else {
            return Err(IceError::ConnectionLost("WebSocket not initialized".to_string()));
        };
        loop {
            if let Some(message) = reader.codec.decode(&mut reader.buffer)? {
                return Ok(Some(message));
            }

            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => reader.buffer.extend_from_slice(&data),
                Some(Ok(WsMessage::Close(_))) | None => {
                    if reader.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(IceError::ConnectionLost(format!(
                        "WebSocket connection to {} closed mid-message",
                        self.remote
                    )));
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(IceError::ConnectionLost(format!(
                        "WebSocket error from {}: {e}",
                        self.remote
                    )))
                }
            }
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(IceError::ConnectionLost("WebSocket not initialized".to_string()));
        };
        sink.send(WsMessage::Binary(data.to_vec())).await.map_err(|e| {
            IceError::ConnectionLost(format!("failed to send to {}: {e}", self.remote))
        })
    }

    async fn close(&self) {
        if let Some(sink) = self.sink.lock().await.as_mut() {
            let _ = sink.close().await;
        }
        self.pending.lock().take();
    }

    fn protocol(&self) -> &str {
        "ws"
    }

    fn description(&self) -> String {
        format!("local address = {}\nremote address = {}", self.local, self.remote)
    }
}

/// A listening socket for WebSocket sessions.
#[derive(Debug)]
pub struct WsAcceptor {
    tcp: TcpAcceptor,
    resource: String,
}

impl WsAcceptor {
    /// Wraps a bound TCP acceptor.
    pub fn new(tcp: TcpAcceptor, resource: String) -> Self {
        Self { tcp, resource }
    }
}

#[async_trait]
impl Acceptor for WsAcceptor {
    async fn accept(&self) -> Result<Box<dyn Transceiver>> {
        let stream = self.tcp.accept_stream().await?;
        Ok(Box::new(WsTransceiver::server(stream, self.tcp.max_message_size())?))
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Ws(WsEndpoint::new(self.tcp.tcp_endpoint().clone(), self.resource.clone()))
    }

    fn description(&self) -> String {
        format!("ws {}", self.tcp.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TcpEndpoint;
    use ice_core::protocol::MessageType;

    #[tokio::test]
    async fn test_handshake_happens_in_initialize() {
        let tcp = TcpAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            TcpEndpoint::new("127.0.0.1", 0, -1),
            0,
        )
        .await
        .unwrap();
        let acceptor = WsAcceptor::new(tcp, "/ice".to_string());
        let port = acceptor.endpoint().port().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let t = WsTransceiver::client(stream, "127.0.0.1", port, "/ice", 0).unwrap();
            t.initialize().await.unwrap();
            t.write(Message::header_only(MessageType::ValidateConnection).to_bytes())
                .await
                .unwrap();
            t
        });

        // Accept returns before any upgrade bytes are processed.
        let server = acceptor.accept().await.unwrap();
        server.initialize().await.unwrap();
        let msg = server.read().await.unwrap().unwrap();
        assert_eq!(msg.message_type(), MessageType::ValidateConnection);

        let client = client.await.unwrap();
        client.close().await;
        assert!(server.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_before_initialize_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let t = WsTransceiver::client(stream, "", addr.port(), "/", 0).unwrap();
        assert!(t.write(Bytes::from_static(b"x")).await.is_err());
    }
}
