//! The ice wire protocol.
//!
//! Every message starts with a fixed 14-byte header (see [`MessageHeader`]).
//! Bodies are marshaled with the streams in [`crate::stream`].

mod codec;
pub mod constants;
mod header;
pub mod version;

pub use codec::MessageCodec;
pub use constants::*;
pub use header::{Message, MessageHeader};
pub use version::{
    check_supported_encoding, check_supported_protocol, get_compatible_encoding,
    get_compatible_protocol, EncodingVersion, ProtocolVersion, CURRENT_ENCODING,
    CURRENT_PROTOCOL, CURRENT_PROTOCOL_ENCODING, ENCODING_1_0, ENCODING_1_1, PROTOCOL_1_0,
};
