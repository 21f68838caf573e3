//! Output stream for marshaling values in the ice encoding.

use bytes::Bytes;

use super::Marshal;
use crate::buffer::Buffer;
use crate::protocol::{
    EncodingVersion, MessageHeader, MessageType, CURRENT_ENCODING, ENCAPSULATION_HEADER_SIZE,
    HEADER_SIZE, MESSAGE_SIZE_OFFSET,
};
use crate::Context;

/// A buffer-based marshaling stream.
///
/// All multi-byte numbers are written in little-endian order. Sizes use the
/// compact encoding: one byte below 255, otherwise 255 followed by an `i32`.
#[derive(Debug, Clone)]
pub struct OutputStream {
    buf: Buffer,
    encoding: EncodingVersion,
    encaps: Vec<(usize, EncodingVersion)>,
}

impl OutputStream {
    /// Creates an empty stream using the current encoding.
    pub fn new() -> Self {
        Self::with_encoding(CURRENT_ENCODING)
    }

    /// Creates an empty stream using the given encoding.
    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        Self {
            buf: Buffer::new(),
            encoding,
            encaps: Vec::new(),
        }
    }

    /// Creates a stream that starts with a message header of the given type.
    ///
    /// The header's size field is patched by [`finish_message`](Self::finish_message).
    pub fn new_message(message_type: MessageType) -> Self {
        let mut os = Self::new();
        let mut header = bytes::BytesMut::with_capacity(HEADER_SIZE);
        MessageHeader::new(message_type, 0).write_to(&mut header);
        os.buf.put_slice(&header);
        os
    }

    /// Returns the encoding currently in effect.
    ///
    /// Inside an encapsulation this is the encapsulation's encoding.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.last().map(|(_, e)| *e).unwrap_or(self.encoding)
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Marshals any value implementing [`Marshal`].
    pub fn write<T: Marshal + ?Sized>(&mut self, v: &T) {
        v.marshal(self);
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a boolean as one byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Writes a 16-bit integer.
    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Writes a 32-bit integer.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Writes a 64-bit integer.
    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Writes a 32-bit float.
    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Writes a 64-bit float.
    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Writes a size in the compact size encoding.
    pub fn write_size(&mut self, v: usize) {
        if v < 255 {
            self.buf.put_u8(v as u8);
        } else {
            self.buf.put_u8(255);
            self.write_i32(v as i32);
        }
    }

    /// Writes a size-prefixed UTF-8 string.
    pub fn write_string(&mut self, v: &str) {
        self.write_size(v.len());
        self.buf.put_slice(v.as_bytes());
    }

    /// Writes a sequence of strings.
    pub fn write_string_seq<S: AsRef<str>>(&mut self, v: &[S]) {
        self.write_size(v.len());
        for s in v {
            self.write_string(s.as_ref());
        }
    }

    /// Writes a request context dictionary.
    pub fn write_context(&mut self, ctx: &Context) {
        self.write_size(ctx.len());
        for (k, v) in ctx {
            self.write_string(k);
            self.write_string(v);
        }
    }

    /// Writes a size-prefixed byte sequence.
    pub fn write_byte_seq(&mut self, v: &[u8]) {
        self.write_size(v.len());
        self.buf.put_slice(v);
    }

    /// Writes raw bytes without any prefix.
    pub fn write_blob(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Opens an encapsulation using the given encoding.
    ///
    /// Every call must be matched by [`end_encapsulation`](Self::end_encapsulation).
    pub fn start_encapsulation(&mut self, encoding: EncodingVersion) {
        let start = self.buf.len();
        self.write_i32(0);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.encaps.push((start, encoding));
    }

    /// Closes the innermost encapsulation, patching its size field.
    pub fn end_encapsulation(&mut self) {
        if let Some((start, _)) = self.encaps.pop() {
            let size = (self.buf.len() - start) as i32;
            self.buf.overwrite(start, &size.to_le_bytes());
        }
    }

    /// Writes an encapsulation with no content.
    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.write_i32(ENCAPSULATION_HEADER_SIZE as i32);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
    }

    /// Writes an encapsulation whose content is already marshaled.
    pub fn write_encapsulation(&mut self, encoding: EncodingVersion, body: &[u8]) {
        self.write_i32((ENCAPSULATION_HEADER_SIZE + body.len()) as i32);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.buf.put_slice(body);
    }

    /// Overwrites a previously written `i32` at `pos`.
    pub fn rewrite_i32(&mut self, pos: usize, v: i32) {
        self.buf.overwrite(pos, &v.to_le_bytes());
    }

    /// Shortens the stream to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Patches the header size field and returns the message bytes.
    pub fn finish_message(mut self) -> Bytes {
        let size = self.buf.len() as i32;
        self.buf.overwrite(MESSAGE_SIZE_OFFSET, &size.to_le_bytes());
        self.buf.freeze()
    }

    /// Consumes the stream and returns its bytes.
    pub fn finished(self) -> Bytes {
        self.buf.freeze()
    }

    /// Consumes the stream and returns the underlying buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buf
    }

    /// Exchanges buffers with `other`.
    pub fn swap(&mut self, other: &mut OutputStream) {
        std::mem::swap(self, other);
    }

    /// Empties the stream, keeping its allocation per the buffer's reset policy.
    pub fn reset(&mut self) {
        self.buf.reset();
        self.encaps.clear();
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Buffer> for OutputStream {
    fn from(buf: Buffer) -> Self {
        Self {
            buf,
            encoding: CURRENT_ENCODING,
            encaps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ENCODING_1_0, ENCODING_1_1};

    #[test]
    fn test_little_endian_integers() {
        let mut os = OutputStream::new();
        os.write_i32(1);
        os.write_i16(-2);
        assert_eq!(os.as_bytes(), &[1, 0, 0, 0, 0xfe, 0xff]);
    }

    #[test]
    fn test_small_size_is_one_byte() {
        let mut os = OutputStream::new();
        os.write_size(254);
        assert_eq!(os.as_bytes(), &[254]);
    }

    #[test]
    fn test_large_size_uses_marker() {
        let mut os = OutputStream::new();
        os.write_size(255);
        assert_eq!(os.as_bytes(), &[255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_string_is_size_prefixed() {
        let mut os = OutputStream::new();
        os.write_string("abc");
        assert_eq!(os.as_bytes(), &[3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encapsulation_size_includes_header() {
        let mut os = OutputStream::new();
        os.start_encapsulation(ENCODING_1_1);
        os.write_i32(7);
        os.end_encapsulation();
        assert_eq!(os.as_bytes(), &[10, 0, 0, 0, 1, 1, 7, 0, 0, 0]);
    }

    #[test]
    fn test_nested_encapsulation_encoding() {
        let mut os = OutputStream::new();
        os.start_encapsulation(ENCODING_1_0);
        assert_eq!(os.encoding(), ENCODING_1_0);
        os.end_encapsulation();
        assert_eq!(os.encoding(), CURRENT_ENCODING);
    }

    #[test]
    fn test_empty_encapsulation() {
        let mut os = OutputStream::new();
        os.write_empty_encapsulation(ENCODING_1_1);
        assert_eq!(os.as_bytes(), &[6, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_finish_message_patches_size() {
        let mut os = OutputStream::new_message(MessageType::Reply);
        os.write_i32(5);
        let bytes = os.finish_message();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let header = MessageHeader::read_from(&bytes).unwrap();
        assert_eq!(header.size as usize, HEADER_SIZE + 4);
        assert_eq!(header.message_type, MessageType::Reply);
    }

    #[test]
    fn test_context_is_sorted() {
        let mut ctx = Context::new();
        ctx.insert("b".into(), "2".into());
        ctx.insert("a".into(), "1".into());
        let mut os = OutputStream::new();
        os.write_context(&ctx);
        assert_eq!(os.as_bytes(), &[2, 1, b'a', 1, b'1', 1, b'b', 1, b'2']);
    }
}
