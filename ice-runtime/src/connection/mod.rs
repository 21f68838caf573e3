//! Connections and the factories that create them.
//!
//! A [`Connection`] owns one transceiver and multiplexes requests, replies
//! and dispatches over it. Outgoing connections are created and shared by the
//! [`OutgoingConnectionFactory`]; incoming ones are accepted by an
//! [`IncomingConnectionFactory`] on behalf of an object adapter.

mod connection;
mod factory;

use std::sync::atomic::{AtomicU64, Ordering};

pub use connection::Connection;
pub use factory::{IncomingConnectionFactory, OutgoingConnectionFactory};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle events broadcast by a communicator.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was validated and can carry requests.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// Transport description of the connection.
        description: String,
    },
    /// A connection was closed.
    Closed {
        /// The connection identifier.
        id: ConnectionId,
        /// The error that closed the connection, if any.
        error: Option<String>,
    },
    /// The peer sent a heartbeat.
    HeartbeatReceived {
        /// The connection identifier.
        id: ConnectionId,
    },
}

/// How [`Connection::close`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Close the transport right away. Pending invocations fail with
    /// `ConnectionManuallyClosed`.
    Forcefully,
    /// Send a close message once dispatches complete, then wait for the peer
    /// to close the transport.
    Gracefully,
    /// Like `Gracefully`, but first wait for pending invocations to complete.
    GracefullyWithWait,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.value() > id1.value());
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
    }
}
