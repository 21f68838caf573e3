//! Error types for the ice runtime.
//!
//! Errors fall into three families:
//!
//! - **local** errors raised by this process (transport failures, marshaling
//!   problems, lifecycle violations, timeouts and cancellation),
//! - **remote** errors carried back in a reply (`UserException` and the
//!   `Unknown*` / request-failed statuses),
//! - **protocol** errors (bad magic, unsupported versions) which are always
//!   fatal to the connection that produced them.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::identity::Identity;
use crate::protocol::{EncodingVersion, ProtocolVersion};

/// The main error type for ice operations.
///
/// `IceError` is `Clone` so that a single connection failure can be handed to
/// every invocation pending on that connection.
#[derive(Debug, Clone, Error)]
pub enum IceError {
    /// The peer actively refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Establishing the connection failed for a reason other than refusal.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An established connection was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Connection establishment did not complete in time.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The connection was closed by active connection management or a
    /// transport-level idle timeout.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The peer closed the connection gracefully. Requests pending on the
    /// connection can always be retried.
    #[error("connection closed by peer")]
    CloseConnection,

    /// The application closed the connection.
    #[error("connection manually closed ({})", if *graceful { "gracefully" } else { "forcefully" })]
    ConnectionManuallyClosed {
        /// Whether the close was graceful.
        graceful: bool,
    },

    /// Graceful connection closure did not complete in time.
    #[error("close timed out")]
    CloseTimeout,

    /// The invocation timeout expired before the invocation completed.
    #[error("invocation timed out")]
    InvocationTimeout,

    /// The invocation was canceled by the application.
    #[error("invocation canceled")]
    InvocationCanceled,

    /// The local wait for an invocation outcome was abandoned before the
    /// invocation completed.
    #[error("operation interrupted")]
    OperationInterrupted,

    /// Host name resolution failed.
    #[error("DNS error for `{host}`: {reason}")]
    Dns {
        /// The host that could not be resolved.
        host: String,
        /// The resolver's error message.
        reason: String,
    },

    /// A datagram exceeded the transport's size limit.
    #[error("datagram limit exceeded: {0}")]
    DatagramLimit(String),

    /// Data could not be marshaled or unmarshaled.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// A message violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message did not start with the protocol magic.
    #[error("bad magic in message header: {0:02x?}")]
    BadMagic([u8; 4]),

    /// The peer uses a protocol version this runtime does not support.
    #[error("unsupported protocol version {bad} (supported: {supported})")]
    UnsupportedProtocol {
        /// The version received.
        bad: ProtocolVersion,
        /// The version supported locally.
        supported: ProtocolVersion,
    },

    /// The peer uses an encoding version this runtime does not support.
    #[error("unsupported encoding version {bad} (supported: {supported})")]
    UnsupportedEncoding {
        /// The version received.
        bad: EncodingVersion,
        /// The most recent version supported locally.
        supported: EncodingVersion,
    },

    /// A message exceeded the configured maximum size.
    #[error("memory limit exceeded: {0}")]
    MemoryLimit(String),

    /// The peer requested a feature that is not available.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// The target object does not exist.
    #[error("object `{id}` does not exist (facet `{facet}`, operation `{operation}`)")]
    ObjectNotExist {
        /// Identity of the missing object.
        id: Identity,
        /// Facet of the request.
        facet: String,
        /// Operation of the request.
        operation: String,
    },

    /// The target facet does not exist.
    #[error("facet `{facet}` of object `{id}` does not exist (operation `{operation}`)")]
    FacetNotExist {
        /// Identity of the target object.
        id: Identity,
        /// The missing facet.
        facet: String,
        /// Operation of the request.
        operation: String,
    },

    /// The target operation does not exist.
    #[error("operation `{operation}` does not exist on object `{id}` (facet `{facet}`)")]
    OperationNotExist {
        /// Identity of the target object.
        id: Identity,
        /// Facet of the request.
        facet: String,
        /// The missing operation.
        operation: String,
    },

    /// A user exception declared by the operation was raised by the server.
    #[error("user exception `{type_id}`")]
    UserException {
        /// Type id of the exception.
        type_id: String,
        /// Marshaled exception members following the type id.
        data: Bytes,
    },

    /// The server raised a user exception the operation does not declare.
    #[error("unknown user exception: {0}")]
    UnknownUserException(String),

    /// The server raised a local error while dispatching.
    #[error("unknown local exception: {0}")]
    UnknownLocalException(String),

    /// The server failed while dispatching for an unexpected reason.
    #[error("unknown exception: {0}")]
    UnknownException(String),

    /// No usable endpoint could be found for a proxy.
    #[error("no suitable endpoint available for proxy `{0}`")]
    NoEndpoint(String),

    /// An endpoint string could not be parsed.
    #[error("could not parse endpoint: {0}")]
    EndpointParse(String),

    /// A proxy string could not be parsed.
    #[error("could not parse proxy: {0}")]
    ProxyParse(String),

    /// An identity string could not be parsed.
    #[error("could not parse identity: {0}")]
    IdentityParse(String),

    /// An identity with an empty name was used where one is required.
    #[error("illegal identity `{0}`")]
    IllegalIdentity(String),

    /// A locator could not find the object or adapter.
    #[error("{kind} `{id}` is not registered")]
    NotRegistered {
        /// Kind of registration (`object`, `object adapter`, ...).
        kind: String,
        /// The id that was looked up.
        id: String,
    },

    /// An object or adapter with the same id is already registered.
    #[error("{kind} `{id}` is already registered")]
    AlreadyRegistered {
        /// Kind of registration.
        kind: String,
        /// The duplicate id.
        id: String,
    },

    /// A twoway-only operation was invoked on a oneway or datagram proxy.
    #[error("operation `{0}` can only be invoked with a twoway proxy")]
    TwowayOnly(String),

    /// The operation is not supported on a fixed proxy.
    #[error("operation not supported on a fixed proxy")]
    FixedProxy,

    /// The communicator has been destroyed.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    /// The object adapter has been deactivated.
    #[error("object adapter `{0}` deactivated")]
    ObjectAdapterDeactivated(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for IceError {
    fn from(err: io::Error) -> Self {
        IceError::Io(Arc::new(err))
    }
}

impl IceError {
    /// Returns true for the request-failed family: the server received the
    /// request but could not find its target.
    pub fn is_request_failed(&self) -> bool {
        matches!(
            self,
            IceError::ObjectNotExist { .. }
                | IceError::FacetNotExist { .. }
                | IceError::OperationNotExist { .. }
        )
    }

    /// Returns true for errors that originate from a reply sent by the peer.
    pub fn is_remote(&self) -> bool {
        self.is_request_failed()
            || matches!(
                self,
                IceError::UserException { .. }
                    | IceError::UnknownUserException(_)
                    | IceError::UnknownLocalException(_)
                    | IceError::UnknownException(_)
            )
    }

    /// Returns true for transport-level failures of a connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            IceError::ConnectionRefused(_)
                | IceError::ConnectFailed(_)
                | IceError::ConnectionLost(_)
                | IceError::ConnectTimeout
                | IceError::ConnectionTimeout
                | IceError::CloseConnection
                | IceError::CloseTimeout
                | IceError::Io(_)
        )
    }

    /// Returns true for errors that indicate a malformed stream.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            IceError::Protocol(_)
                | IceError::BadMagic(_)
                | IceError::UnsupportedProtocol { .. }
                | IceError::UnsupportedEncoding { .. }
                | IceError::MemoryLimit(_)
                | IceError::FeatureNotSupported(_)
        )
    }

    /// Returns true for marshaling failures.
    pub fn is_marshal_error(&self) -> bool {
        matches!(self, IceError::Marshal(_) | IceError::MemoryLimit(_))
    }

    /// Creates a marshal error from a displayable reason.
    pub fn marshal(reason: impl Into<String>) -> Self {
        IceError::Marshal(reason.into())
    }
}

/// A specialized `Result` type for ice operations.
pub type Result<T> = std::result::Result<T, IceError>;
