//! Codec implementation for framing ice protocol messages.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::header::{Message, MessageHeader};
use crate::error::{IceError, Result};

/// Codec for encoding and decoding whole protocol messages.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. Decoding validates the header before waiting for
/// the body, so a bad magic or an oversized message fails as soon as the
/// first 14 bytes arrive.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
    pending: Option<MessageHeader>,
}

impl MessageCodec {
    /// Creates a codec accepting messages up to [`DEFAULT_MESSAGE_SIZE_MAX`].
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MESSAGE_SIZE_MAX)
    }

    /// Creates a codec with a custom size limit. Zero disables the limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            pending: None,
        }
    }

    /// Returns the configured size limit.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn check_header(&self, header: &MessageHeader) -> Result<()> {
        if header.compression == COMPRESSION_COMPRESSED {
            return Err(IceError::FeatureNotSupported("compression".to_string()));
        }
        if self.max_size > 0 && header.size as usize > self.max_size {
            return Err(IceError::MemoryLimit(format!(
                "message of {} bytes exceeds the maximum of {} bytes",
                header.size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = IceError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = IceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = MessageHeader::read_from(&src[..HEADER_SIZE])?;
                self.check_header(&header)?;
                self.pending = Some(header);
                header
            }
        };

        let total = header.size as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.pending = None;
        let mut frame = src.split_to(total);
        let body = frame.split_off(HEADER_SIZE).freeze();
        Ok(Some(Message { header, body }))
    }
}
