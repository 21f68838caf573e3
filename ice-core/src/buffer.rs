//! Growable byte buffer used by the marshaling streams.
//!
//! The buffer tracks its logical size separately from the allocated capacity.
//! Growth is geometric with a small floor; [`Buffer::reset`] gives memory back
//! when a buffer that used to hold large messages keeps holding small ones.

use bytes::{BufMut, Bytes, BytesMut};

/// Smallest capacity allocated once the buffer grows.
const MIN_CAPACITY: usize = 240;

/// Number of consecutive under-used resets before the buffer shrinks.
const SHRINK_AFTER_RESETS: u32 = 2;

/// A growable byte buffer with capacity/size separation.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: BytesMut,
    shrink_counter: u32,
}

impl Buffer {
    /// Creates an empty buffer without allocating.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            shrink_counter: 0,
        }
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            shrink_counter: 0,
        }
    }

    /// Returns the number of bytes stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the allocated capacity.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Ensures there is room for `additional` more bytes.
    ///
    /// When the buffer must grow, it grows to at least twice its current
    /// capacity and never below [`MIN_CAPACITY`].
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        let capacity = self.data.capacity();
        if needed > capacity {
            let target = needed.max(capacity * 2).max(MIN_CAPACITY);
            self.data.reserve(target - self.data.len());
        }
    }

    /// Sets the logical size, zero-filling when growing.
    pub fn resize(&mut self, len: usize) {
        if len > self.data.len() {
            self.reserve(len - self.data.len());
        }
        self.data.resize(len, 0);
    }

    /// Empties the buffer.
    ///
    /// If the last few uses occupied less than half of the capacity, the
    /// allocation is shrunk to the size that was last used.
    pub fn reset(&mut self) {
        let len = self.data.len();
        if len > 0 && len * 2 < self.data.capacity() {
            self.shrink_counter += 1;
            if self.shrink_counter > SHRINK_AFTER_RESETS {
                self.data = BytesMut::with_capacity(len);
                self.shrink_counter = 0;
                return;
            }
        } else {
            self.shrink_counter = 0;
        }
        self.data.clear();
    }

    /// Appends a slice.
    pub fn put_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.data.put_slice(src);
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.reserve(1);
        self.data.put_u8(v);
    }

    /// Overwrites bytes starting at `pos`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside of the current size.
    pub fn overwrite(&mut self, pos: usize, src: &[u8]) {
        self.data[pos..pos + src.len()].copy_from_slice(src);
    }

    /// Shortens the buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Returns the stored bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Removes and returns the bytes from `at` to the end.
    pub fn split_off(&mut self, at: usize) -> BytesMut {
        self.data.split_off(at)
    }

    /// Exchanges contents with another buffer.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    /// Consumes the buffer and returns its bytes.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Returns a copy of the stored bytes, leaving the buffer untouched.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl From<BytesMut> for Buffer {
    fn from(data: BytesMut) -> Self {
        Self {
            data,
            shrink_counter: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = Buffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_growth_respects_minimum() {
        let mut buf = Buffer::new();
        buf.put_u8(1);
        assert!(buf.capacity() >= MIN_CAPACITY);
    }

    #[test]
    fn test_growth_is_geometric() {
        let mut buf = Buffer::with_capacity(MIN_CAPACITY);
        let before = buf.capacity();
        buf.resize(before);
        buf.put_u8(0);
        assert!(buf.capacity() >= before * 2);
    }

    #[test]
    fn test_resize_zero_fills() {
        let mut buf = Buffer::new();
        buf.put_slice(&[9, 9]);
        buf.resize(4);
        assert_eq!(buf.as_slice(), &[9, 9, 0, 0]);
        buf.resize(1);
        assert_eq!(buf.as_slice(), &[9]);
    }

    #[test]
    fn test_reset_shrinks_after_repeated_small_use() {
        let mut buf = Buffer::new();
        buf.resize(10_000);
        let large = buf.capacity();
        buf.reset();

        for _ in 0..SHRINK_AFTER_RESETS {
            buf.resize(100);
            buf.reset();
            assert_eq!(buf.capacity(), large);
        }
        buf.resize(100);
        buf.reset();
        assert!(buf.capacity() < large);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset_keeps_capacity_when_well_used() {
        let mut buf = Buffer::new();
        buf.resize(1000);
        let cap = buf.capacity();
        for _ in 0..5 {
            buf.reset();
            buf.resize(cap);
        }
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_overwrite() {
        let mut buf = Buffer::new();
        buf.put_slice(&[0, 0, 0, 0, 5]);
        buf.overwrite(0, &7i32.to_le_bytes());
        assert_eq!(buf.as_slice(), &[7, 0, 0, 0, 5]);
    }

    #[test]
    fn test_swap() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        a.put_slice(b"abc");
        a.swap(&mut b);
        assert!(a.is_empty());
        assert_eq!(b.as_slice(), b"abc");
    }
}
