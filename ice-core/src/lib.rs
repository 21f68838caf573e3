//! Core types and wire protocol for the ice RPC runtime.
//!
//! This crate has no networking of its own. It provides the message
//! framing, the marshaling streams, identities and the error taxonomy
//! shared by the runtime crate.

#![warn(missing_docs)]

use std::collections::BTreeMap;

pub mod buffer;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod stream;

pub use buffer::Buffer;
pub use error::{IceError, Result};
pub use identity::Identity;
pub use protocol::{EncodingVersion, Message, MessageCodec, MessageHeader, MessageType, ProtocolVersion};
pub use stream::{InputStream, Marshal, OutputStream, Unmarshal};

/// Request context: string key/value pairs sent with each request.
pub type Context = BTreeMap<String, String>;
