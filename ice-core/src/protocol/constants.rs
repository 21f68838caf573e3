//! Protocol constants for the ice wire protocol.

use crate::error::{IceError, Result};

/// Magic bytes that start every message: `I c e P`.
pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 14;

/// Offset of the message type byte within the header.
pub const MESSAGE_TYPE_OFFSET: usize = 8;

/// Offset of the compression status byte within the header.
pub const COMPRESSION_OFFSET: usize = 9;

/// Offset of the total message size field within the header.
pub const MESSAGE_SIZE_OFFSET: usize = 10;

/// Size of the request id that follows the header of requests and replies.
pub const REQUEST_ID_SIZE: usize = 4;

/// Size of the batch request count that follows a batch request header.
pub const BATCH_COUNT_SIZE: usize = 4;

/// Size of an encapsulation header (4-byte size + 2-byte encoding).
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

/// Request id used for oneway and datagram requests.
pub const ONEWAY_REQUEST_ID: i32 = 0;

/// Default upper bound for an incoming message (1 MiB).
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// The message was not compressed.
pub const COMPRESSION_NOT_COMPRESSED: u8 = 0;

/// The message was not compressed, but the sender can decompress replies.
pub const COMPRESSION_SUPPORTED: u8 = 1;

/// The message body is compressed.
pub const COMPRESSION_COMPRESSED: u8 = 2;

/// The kinds of protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A single request.
    Request = 0,
    /// A batch of oneway or datagram requests.
    BatchRequest = 1,
    /// A reply to a twoway request.
    Reply = 2,
    /// Connection validation, also used as heartbeat.
    ValidateConnection = 3,
    /// Graceful connection closure.
    CloseConnection = 4,
}

impl MessageType {
    /// Returns the lowercase name used in protocol tracing.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::BatchRequest => "batch request",
            MessageType::Reply => "reply",
            MessageType::ValidateConnection => "validate connection",
            MessageType::CloseConnection => "close connection",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = IceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::BatchRequest),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(IceError::Protocol(format!("unknown message type {other}"))),
        }
    }
}

/// Status byte carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The operation completed and the reply carries its results.
    Ok = 0,
    /// The operation raised a user exception.
    UserException = 1,
    /// The target object does not exist.
    ObjectNotExist = 2,
    /// The target facet does not exist.
    FacetNotExist = 3,
    /// The target operation does not exist.
    OperationNotExist = 4,
    /// The dispatch failed with a local error.
    UnknownLocalException = 5,
    /// The dispatch raised an undeclared user exception.
    UnknownUserException = 6,
    /// The dispatch failed for another reason.
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = IceError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            other => {
                return Err(IceError::Protocol(format!("unknown reply status {other}")))
            }
        })
    }
}

/// Operation mode announced in each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    /// May modify state; not safe to resend once sent.
    #[default]
    Normal = 0,
    /// Does not modify state.
    Nonmutating = 1,
    /// Can be resent without changing the outcome.
    Idempotent = 2,
}

impl TryFrom<u8> for OperationMode {
    type Error = IceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(IceError::Marshal(format!("invalid operation mode {other}"))),
        }
    }
}
