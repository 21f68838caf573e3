//! Transceivers and acceptors: the byte-moving half of a connection.
//!
//! A [`Transceiver`] reads and writes whole protocol messages on one
//! transport session. An [`Acceptor`] produces server-side transceivers for
//! connection-oriented transports. Both are created by endpoints and
//! connectors; connections only ever see the traits.

mod idle;
mod tcp;
mod udp;
mod ws;

use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use ice_core::{IceError, Message, Result};

pub use idle::IdleTimeoutTransceiver;
pub use tcp::{TcpAcceptor, TcpTransceiver};
pub use udp::{UdpTransceiver, MAX_DATAGRAM_SIZE};
pub use ws::{WsAcceptor, WsTransceiver};

use crate::endpoint::Endpoint;

/// One transport session.
///
/// Reads and writes may run concurrently with each other, but callers must
/// not issue two concurrent writes expecting a particular order.
#[async_trait]
pub trait Transceiver: Send + Sync + Debug {
    /// Completes transport-level setup, such as a WebSocket upgrade.
    ///
    /// Must be called before the first `read` or `write`.
    async fn initialize(&self) -> Result<()>;

    /// Reads one complete protocol message. Returns `None` at end of stream.
    async fn read(&self) -> Result<Option<Message>>;

    /// Writes one complete protocol message.
    async fn write(&self, data: Bytes) -> Result<()>;

    /// Shuts the transport down. Further reads return `None` or an error.
    async fn close(&self);

    /// Returns the protocol name.
    fn protocol(&self) -> &str;

    /// Returns true for connectionless transports.
    fn is_datagram(&self) -> bool {
        false
    }

    /// Returns the largest message the transport can send in one piece.
    fn max_send_size(&self) -> Option<usize> {
        None
    }

    /// Returns a human-readable description of the session.
    fn description(&self) -> String;
}

/// A listening socket.
#[async_trait]
pub trait Acceptor: Send + Sync + Debug {
    /// Waits for the next incoming session.
    ///
    /// The returned transceiver has not been initialized yet.
    async fn accept(&self) -> Result<Box<dyn Transceiver>>;

    /// Returns the endpoint with the port actually bound.
    fn endpoint(&self) -> Endpoint;

    /// Returns a human-readable description of the listener.
    fn description(&self) -> String;
}

/// Maps an I/O failure on an established session.
pub(crate) fn connection_lost(err: io::Error) -> IceError {
    IceError::ConnectionLost(err.to_string())
}

/// Maps errors produced while decoding a stream. I/O errors become
/// `ConnectionLost`; protocol errors pass through.
pub(crate) fn read_error(err: IceError) -> IceError {
    match err {
        IceError::Io(e) => IceError::ConnectionLost(e.to_string()),
        other => other,
    }
}
