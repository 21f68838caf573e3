//! Input stream for unmarshaling values in the ice encoding.

use bytes::Bytes;

use super::Unmarshal;
use crate::error::{IceError, Result};
use crate::protocol::{
    check_supported_encoding, EncodingVersion, CURRENT_ENCODING, ENCAPSULATION_HEADER_SIZE,
};
use crate::Context;

#[derive(Debug, Clone, Copy)]
struct Encaps {
    end: usize,
    encoding: EncodingVersion,
}

/// A cursor over received bytes.
///
/// Every read checks the remaining length first and fails with a marshal
/// error instead of panicking on truncated input.
#[derive(Debug, Clone)]
pub struct InputStream {
    data: Bytes,
    pos: usize,
    encoding: EncodingVersion,
    encaps: Vec<Encaps>,
}

impl InputStream {
    /// Creates a stream over `data` using the current encoding.
    pub fn new(data: Bytes) -> Self {
        Self::with_encoding(data, CURRENT_ENCODING)
    }

    /// Creates a stream over `data` using the given encoding.
    pub fn with_encoding(data: Bytes, encoding: EncodingVersion) -> Self {
        Self {
            data,
            pos: 0,
            encoding,
            encaps: Vec::new(),
        }
    }

    /// Returns the encoding currently in effect.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.last().map(|e| e.encoding).unwrap_or(self.encoding)
    }

    /// Returns the read position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the read position.
    pub fn set_pos(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(IceError::marshal(format!(
                "position {pos} is past the end of a {}-byte buffer",
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Returns the number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true when every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the whole underlying buffer.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    fn ensure_remaining(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            Err(IceError::marshal(format!(
                "unmarshal out of bounds: need {} bytes, have {}",
                n,
                self.remaining()
            )))
        } else {
            Ok(())
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure_remaining(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Unmarshals any value implementing [`Unmarshal`].
    pub fn read<T: Unmarshal>(&mut self) -> Result<T> {
        T::unmarshal(self)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads a boolean byte.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a 16-bit integer.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    /// Reads a 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    /// Reads a 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    /// Reads a 32-bit float.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    /// Reads a 64-bit float.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    /// Reads a size in the compact size encoding.
    pub fn read_size(&mut self) -> Result<usize> {
        let b = self.read_u8()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_i32()?;
        if v < 0 {
            return Err(IceError::marshal(format!("negative size {v}")));
        }
        Ok(v as usize)
    }

    /// Reads a sequence size and checks that the remaining bytes could hold
    /// that many elements of at least `min_elem_size` bytes each.
    pub fn read_seq_size(&mut self, min_elem_size: usize) -> Result<usize> {
        let n = self.read_size()?;
        if n.saturating_mul(min_elem_size) > self.remaining() {
            return Err(IceError::marshal(format!(
                "sequence of {n} elements exceeds the remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(n)
    }

    /// Reads `n` raw bytes without copying.
    pub fn read_blob(&mut self, n: usize) -> Result<Bytes> {
        self.ensure_remaining(n)?;
        let out = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// Reads a size-prefixed byte sequence.
    pub fn read_byte_seq(&mut self) -> Result<Bytes> {
        let n = self.read_size()?;
        self.read_blob(n)
    }

    /// Reads a size-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let n = self.read_size()?;
        let raw = self.read_blob(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| IceError::marshal(format!("invalid UTF-8 string: {e}")))
    }

    /// Reads a sequence of strings.
    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let n = self.read_seq_size(1)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    /// Reads a request context dictionary.
    pub fn read_context(&mut self) -> Result<Context> {
        let n = self.read_seq_size(2)?;
        let mut ctx = Context::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            ctx.insert(k, v);
        }
        Ok(ctx)
    }

    fn read_encaps_header(&mut self) -> Result<(usize, EncodingVersion)> {
        let start = self.pos;
        let size = self.read_i32()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(IceError::marshal(format!(
                "illegal encapsulation size {size}"
            )));
        }
        let size = size as usize;
        if size - 4 > self.remaining() {
            return Err(IceError::marshal(format!(
                "encapsulation of {size} bytes exceeds the remaining {} bytes",
                self.remaining() + 4
            )));
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        Ok((start + size, EncodingVersion::new(major, minor)))
    }

    /// Opens an encapsulation and returns its encoding.
    ///
    /// Fails if the encoding is not supported locally.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let (end, encoding) = self.read_encaps_header()?;
        check_supported_encoding(encoding)?;
        self.encaps.push(Encaps { end, encoding });
        Ok(encoding)
    }

    /// Closes the innermost encapsulation.
    ///
    /// The encapsulation must have been read completely. A single trailing
    /// byte is tolerated and skipped.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let encaps = self
            .encaps
            .pop()
            .ok_or_else(|| IceError::marshal("no open encapsulation"))?;
        if self.pos != encaps.end {
            if self.pos + 1 != encaps.end {
                return Err(IceError::marshal(format!(
                    "encapsulation not fully read: {} bytes left",
                    encaps.end.saturating_sub(self.pos)
                )));
            }
            self.pos += 1;
        }
        Ok(())
    }

    /// Skips an encapsulation of any version and returns its encoding.
    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion> {
        let (end, encoding) = self.read_encaps_header()?;
        self.pos = end;
        Ok(encoding)
    }

    /// Skips an encapsulation that must carry no payload.
    pub fn skip_empty_encapsulation(&mut self) -> Result<EncodingVersion> {
        let (end, encoding) = self.read_encaps_header()?;
        check_supported_encoding(encoding)?;
        if end != self.pos {
            // 1.0 encapsulations may carry a trailing optional marker.
            self.pos = end;
        }
        Ok(encoding)
    }

    /// Reads a whole encapsulation without interpreting it.
    ///
    /// Returns the encoding and the payload following the 6-byte header.
    pub fn read_encapsulation(&mut self) -> Result<(EncodingVersion, Bytes)> {
        let (end, encoding) = self.read_encaps_header()?;
        let body = self.data.slice(self.pos..end);
        self.pos = end;
        Ok((encoding, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ENCODING_1_0, ENCODING_1_1};
    use crate::stream::OutputStream;

    fn input(os: OutputStream) -> InputStream {
        InputStream::new(os.finished())
    }

    #[test]
    fn test_read_primitives() {
        let mut os = OutputStream::new();
        os.write_u8(7);
        os.write_bool(true);
        os.write_i16(-3);
        os.write_i32(123_456);
        os.write_i64(-9);
        os.write_f64(1.5);
        let mut is = input(os);
        assert_eq!(is.read_u8().unwrap(), 7);
        assert!(is.read_bool().unwrap());
        assert_eq!(is.read_i16().unwrap(), -3);
        assert_eq!(is.read_i32().unwrap(), 123_456);
        assert_eq!(is.read_i64().unwrap(), -9);
        assert_eq!(is.read_f64().unwrap(), 1.5);
        assert!(is.is_empty());
    }

    #[test]
    fn test_truncated_read_is_marshal_error() {
        let mut is = InputStream::new(Bytes::from_static(&[1, 2]));
        let err = is.read_i32().unwrap_err();
        assert!(err.is_marshal_error());
        assert_eq!(is.pos(), 0);
    }

    #[test]
    fn test_large_size() {
        let mut os = OutputStream::new();
        os.write_size(70_000);
        let mut is = input(os);
        assert_eq!(is.read_size().unwrap(), 70_000);
    }

    #[test]
    fn test_negative_size_rejected() {
        let mut is = InputStream::new(Bytes::from_static(&[255, 0xff, 0xff, 0xff, 0xff]));
        assert!(is.read_size().is_err());
    }

    #[test]
    fn test_string_sequence_size_checked() {
        let mut is = InputStream::new(Bytes::from_static(&[200, 1, b'a']));
        assert!(is.read_string_seq().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut is = InputStream::new(Bytes::from_static(&[2, 0xc3, 0x28]));
        assert!(is.read_string().is_err());
    }

    #[test]
    fn test_encapsulation_roundtrip() {
        let mut os = OutputStream::new();
        os.start_encapsulation(ENCODING_1_1);
        os.write_string("payload");
        os.end_encapsulation();
        os.write_u8(9);

        let mut is = input(os);
        assert_eq!(is.start_encapsulation().unwrap(), ENCODING_1_1);
        assert_eq!(is.encoding(), ENCODING_1_1);
        assert_eq!(is.read_string().unwrap(), "payload");
        is.end_encapsulation().unwrap();
        assert_eq!(is.read_u8().unwrap(), 9);
    }

    #[test]
    fn test_unread_encapsulation_content_is_error() {
        let mut os = OutputStream::new();
        os.start_encapsulation(ENCODING_1_1);
        os.write_i32(1);
        os.end_encapsulation();
        let mut is = input(os);
        is.start_encapsulation().unwrap();
        assert!(is.end_encapsulation().is_err());
    }

    #[test]
    fn test_skip_unknown_encoding() {
        let mut os = OutputStream::new();
        os.write_encapsulation(EncodingVersion::new(9, 9), &[1, 2, 3]);
        os.write_u8(42);
        let mut is = input(os);
        assert_eq!(is.skip_encapsulation().unwrap(), EncodingVersion::new(9, 9));
        assert_eq!(is.read_u8().unwrap(), 42);
    }

    #[test]
    fn test_start_unknown_encoding_fails() {
        let mut os = OutputStream::new();
        os.write_encapsulation(EncodingVersion::new(2, 0), &[]);
        let mut is = input(os);
        assert!(matches!(
            is.start_encapsulation(),
            Err(IceError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn test_encapsulation_size_bounds() {
        let mut is = InputStream::new(Bytes::from_static(&[100, 0, 0, 0, 1, 1]));
        assert!(is.read_encapsulation().is_err());

        let mut is = InputStream::new(Bytes::from_static(&[2, 0, 0, 0, 1, 1]));
        assert!(is.read_encapsulation().is_err());
    }

    #[test]
    fn test_read_encapsulation_returns_payload() {
        let mut os = OutputStream::new();
        os.write_encapsulation(ENCODING_1_0, &[5, 6]);
        let mut is = input(os);
        let (encoding, body) = is.read_encapsulation().unwrap();
        assert_eq!(encoding, ENCODING_1_0);
        assert_eq!(&body[..], &[5, 6]);
    }

    #[test]
    fn test_context_roundtrip() {
        let mut ctx = Context::new();
        ctx.insert("k".into(), "v".into());
        let mut os = OutputStream::new();
        os.write_context(&ctx);
        let mut is = input(os);
        assert_eq!(is.read_context().unwrap(), ctx);
    }
}
