//! Message header and whole-message types.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;
use super::version::{
    check_supported_encoding, check_supported_protocol, EncodingVersion, ProtocolVersion,
    CURRENT_PROTOCOL, CURRENT_PROTOCOL_ENCODING,
};
use crate::error::{IceError, Result};

/// The fixed 14-byte header that starts every message.
///
/// Layout:
/// - 4-byte magic
/// - protocol major/minor
/// - encoding major/minor
/// - message type
/// - compression status
/// - 4-byte little-endian total message size (header included)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol version of the message.
    pub protocol: ProtocolVersion,
    /// Encoding version of the message framing.
    pub encoding: EncodingVersion,
    /// Kind of message.
    pub message_type: MessageType,
    /// Compression status byte.
    pub compression: u8,
    /// Total message size, including the header.
    pub size: i32,
}

impl MessageHeader {
    /// Creates a header for the current protocol with the given type and size.
    pub fn new(message_type: MessageType, size: i32) -> Self {
        Self {
            protocol: CURRENT_PROTOCOL,
            encoding: CURRENT_PROTOCOL_ENCODING,
            message_type,
            compression: COMPRESSION_NOT_COMPRESSED,
            size,
        }
    }

    /// Returns the body size announced by this header.
    pub fn body_size(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// Writes this header to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&MAGIC);
        dst.put_u8(self.protocol.major);
        dst.put_u8(self.protocol.minor);
        dst.put_u8(self.encoding.major);
        dst.put_u8(self.encoding.minor);
        dst.put_u8(self.message_type as u8);
        dst.put_u8(self.compression);
        dst.put_i32_le(self.size);
    }

    /// Returns the header as a fixed-size array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.write_to(&mut buf);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parses and validates a header from the start of `src`.
    ///
    /// Fails if fewer than [`HEADER_SIZE`] bytes are available, the magic is
    /// wrong, the protocol or encoding is unsupported, the message type is
    /// unknown or the size is smaller than a header.
    pub fn read_from(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(IceError::Protocol(format!(
                "truncated message header: {} bytes",
                src.len()
            )));
        }

        let magic = [src[0], src[1], src[2], src[3]];
        if magic != MAGIC {
            return Err(IceError::BadMagic(magic));
        }

        let protocol = ProtocolVersion::new(src[4], src[5]);
        check_supported_protocol(protocol)?;

        let encoding = EncodingVersion::new(src[6], src[7]);
        check_supported_encoding(encoding)?;

        let message_type = MessageType::try_from(src[MESSAGE_TYPE_OFFSET])?;
        let compression = src[COMPRESSION_OFFSET];
        if compression > COMPRESSION_COMPRESSED {
            return Err(IceError::Protocol(format!(
                "invalid compression status {compression}"
            )));
        }

        let size = i32::from_le_bytes([
            src[MESSAGE_SIZE_OFFSET],
            src[MESSAGE_SIZE_OFFSET + 1],
            src[MESSAGE_SIZE_OFFSET + 2],
            src[MESSAGE_SIZE_OFFSET + 3],
        ]);
        if size < HEADER_SIZE as i32 {
            return Err(IceError::Protocol(format!("illegal message size {size}")));
        }

        Ok(Self {
            protocol,
            encoding,
            message_type,
            compression,
            size,
        })
    }
}

/// A complete protocol message: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The parsed header.
    pub header: MessageHeader,
    /// The bytes following the header.
    pub body: Bytes,
}

impl Message {
    /// Creates a message, fixing up the header size from the body length.
    pub fn new(message_type: MessageType, body: Bytes) -> Self {
        let size = (HEADER_SIZE + body.len()) as i32;
        Self {
            header: MessageHeader::new(message_type, size),
            body,
        }
    }

    /// Creates a header-only message of the given type.
    pub fn header_only(message_type: MessageType) -> Self {
        Self::new(message_type, Bytes::new())
    }

    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Returns the total size on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Writes the message to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let mut header = self.header;
        header.size = self.wire_size() as i32;
        dst.reserve(self.wire_size());
        header.write_to(dst);
        dst.put_slice(&self.body);
    }

    /// Returns the serialized message.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Parses one complete message from `src`.
    ///
    /// The slice must contain exactly the announced number of bytes.
    pub fn parse(src: Bytes) -> Result<Self> {
        let header = MessageHeader::read_from(&src)?;
        if header.size as usize != src.len() {
            return Err(IceError::Protocol(format!(
                "message size mismatch: header says {}, received {}",
                header.size,
                src.len()
            )));
        }
        Ok(Self {
            header,
            body: src.slice(HEADER_SIZE..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version::{ENCODING_1_1, PROTOCOL_1_0};

    fn all_headers() -> Vec<MessageHeader> {
        let types = [
            MessageType::Request,
            MessageType::BatchRequest,
            MessageType::Reply,
            MessageType::ValidateConnection,
            MessageType::CloseConnection,
        ];
        let mut out = Vec::new();
        for t in types {
            for size in [HEADER_SIZE as i32, 18, 4096, i32::MAX] {
                for compression in [0u8, 1, 2] {
                    out.push(MessageHeader {
                        protocol: PROTOCOL_1_0,
                        encoding: CURRENT_PROTOCOL_ENCODING,
                        message_type: t,
                        compression,
                        size,
                    });
                }
            }
        }
        out
    }

    #[test]
    fn test_parse_write_roundtrip() {
        for header in all_headers() {
            let bytes = header.to_bytes();
            assert_eq!(MessageHeader::read_from(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = MessageHeader::new(MessageType::ValidateConnection, 14).to_bytes();
        assert_eq!(
            bytes,
            [0x49, 0x63, 0x65, 0x50, 1, 0, 1, 0, 3, 0, 14, 0, 0, 0]
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = MessageHeader::new(MessageType::Reply, 20).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            MessageHeader::read_from(&bytes),
            Err(IceError::BadMagic(_))
        ));
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let mut bytes = MessageHeader::new(MessageType::Reply, 20).to_bytes();
        bytes[4] = 2;
        assert!(matches!(
            MessageHeader::read_from(&bytes),
            Err(IceError::UnsupportedProtocol { .. })
        ));
    }

    #[test]
    fn test_encoding_1_1_header_accepted() {
        let mut header = MessageHeader::new(MessageType::Request, 30);
        header.encoding = ENCODING_1_1;
        let parsed = MessageHeader::read_from(&header.to_bytes()).unwrap();
        assert_eq!(parsed.encoding, ENCODING_1_1);
    }

    #[test]
    fn test_small_size_rejected() {
        let bytes = MessageHeader::new(MessageType::Reply, 13).to_bytes();
        assert!(matches!(
            MessageHeader::read_from(&bytes),
            Err(IceError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(MessageHeader::read_from(&MAGIC).is_err());
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(MessageType::Reply, Bytes::from_static(&[1, 0, 0, 0, 0]));
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let parsed = Message::parse(bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_message_size_mismatch() {
        let msg = Message::new(MessageType::Reply, Bytes::from_static(&[1, 2, 3]));
        let bytes = msg.to_bytes();
        assert!(Message::parse(bytes.slice(..bytes.len() - 1)).is_err());
    }
}
