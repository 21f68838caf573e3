//! Connectors: resolved, connectable addresses.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ice_core::{IceError, Result};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::transport::{TcpTransceiver, Transceiver, UdpTransceiver, WsTransceiver};

/// A resolved TCP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpConnector {
    pub(crate) addr: SocketAddr,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) timeout: i32,
    pub(crate) connection_id: String,
}

/// A resolved UDP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdpConnector {
    pub(crate) addr: SocketAddr,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) mcast_interface: String,
    pub(crate) mcast_ttl: i32,
    pub(crate) connection_id: String,
}

/// A resolved WebSocket address with the values of the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WsConnector {
    pub(crate) tcp: TcpConnector,
    pub(crate) host: String,
    pub(crate) resource: String,
}

/// A connectable address derived from an endpoint.
///
/// Connectors key the outgoing connection table, so two connectors compare
/// equal only if a connection established through one can serve the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Connector {
    /// TCP.
    Tcp(TcpConnector),
    /// UDP.
    Udp(UdpConnector),
    /// WebSocket over TCP.
    Ws(WsConnector),
}

fn connect_error(addr: SocketAddr, err: io::Error) -> IceError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => IceError::ConnectionRefused(addr.to_string()),
        _ => IceError::ConnectFailed(format!("{addr}: {err}")),
    }
}

async fn tcp_connect(c: &TcpConnector) -> Result<TcpStream> {
    let socket = if c.addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| connect_error(c.addr, e))?;
    if let Some(source) = c.source_address {
        socket
            .bind(SocketAddr::new(source, 0))
            .map_err(|e| connect_error(c.addr, e))?;
    }
    let stream = socket.connect(c.addr).await.map_err(|e| connect_error(c.addr, e))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl Connector {
    /// Returns the resolved address.
    pub fn addr(&self) -> SocketAddr {
        match self {
            Connector::Tcp(c) => c.addr,
            Connector::Udp(c) => c.addr,
            Connector::Ws(c) => c.tcp.addr,
        }
    }

    /// Returns the protocol name.
    pub fn protocol(&self) -> &'static str {
        match self {
            Connector::Tcp(_) => "tcp",
            Connector::Udp(_) => "udp",
            Connector::Ws(_) => "ws",
        }
    }

    /// Returns the connection id of the originating endpoint.
    pub fn connection_id(&self) -> &str {
        match self {
            Connector::Tcp(c) => &c.connection_id,
            Connector::Udp(c) => &c.connection_id,
            Connector::Ws(c) => &c.tcp.connection_id,
        }
    }

    /// Returns the endpoint timeout in milliseconds (-1 is infinite).
    pub fn timeout(&self) -> i32 {
        match self {
            Connector::Tcp(c) => c.timeout,
            Connector::Udp(_) => -1,
            Connector::Ws(c) => c.tcp.timeout,
        }
    }

    /// Opens the transport.
    ///
    /// The returned transceiver still has to be initialized; for WebSocket
    /// this is where the upgrade handshake happens.
    pub async fn connect(&self, max_message_size: usize) -> Result<Box<dyn Transceiver>> {
        match self {
            Connector::Tcp(c) => {
                let stream = tcp_connect(c).await?;
                Ok(Box::new(TcpTransceiver::new(stream, max_message_size)?))
            }
            Connector::Ws(c) => {
                let stream = tcp_connect(&c.tcp).await?;
                Ok(Box::new(WsTransceiver::client(
                    stream,
                    &c.host,
                    c.tcp.addr.port(),
                    &c.resource,
                    max_message_size,
                )?))
            }
            Connector::Udp(c) => {
                let local = match (c.source_address, c.addr) {
                    (Some(source), _) => SocketAddr::new(source, 0),
                    (None, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    (None, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let socket = UdpSocket::bind(local).await.map_err(|e| connect_error(c.addr, e))?;
                if c.mcast_ttl >= 0 && c.addr.is_ipv4() {
                    socket.set_multicast_ttl_v4(c.mcast_ttl as u32)?;
                }
                socket.connect(c.addr).await.map_err(|e| connect_error(c.addr, e))?;
                Ok(Box::new(UdpTransceiver::client(socket)?))
            }
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::Ws(c) => write!(f, "ws {}{}", c.tcp.addr, c.resource),
            other => write!(f, "{} {}", other.protocol(), other.addr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tcp(addr: &str, timeout: i32) -> Connector {
        Connector::Tcp(TcpConnector {
            addr: addr.parse().unwrap(),
            source_address: None,
            timeout,
            connection_id: String::new(),
        })
    }

    #[test]
    fn test_connectors_key_a_table() {
        let mut set = HashSet::new();
        set.insert(tcp("127.0.0.1:1", 10));
        set.insert(tcp("127.0.0.1:1", 10));
        set.insert(tcp("127.0.0.1:1", 20));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(tcp("10.0.0.1:4061", 1).to_string(), "tcp 10.0.0.1:4061");
    }

    #[tokio::test]
    async fn test_refused_maps_to_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = tcp(&addr.to_string(), -1).connect(0).await.unwrap_err();
        assert!(
            matches!(err, IceError::ConnectionRefused(_) | IceError::ConnectFailed(_)),
            "{err:?}"
        );
    }
}
