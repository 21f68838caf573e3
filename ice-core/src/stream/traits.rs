//! Marshaling traits and implementations for primitive types.

use super::{InputStream, OutputStream};
use crate::error::Result;

/// Trait for types that can be written to an [`OutputStream`].
pub trait Marshal {
    /// Writes this value to the stream.
    fn marshal(&self, os: &mut OutputStream);
}

/// Trait for types that can be read from an [`InputStream`].
pub trait Unmarshal: Sized {
    /// Reads a value from the stream.
    fn unmarshal(is: &mut InputStream) -> Result<Self>;
}

macro_rules! primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Marshal for $ty {
            fn marshal(&self, os: &mut OutputStream) {
                os.$write(*self);
            }
        }

        impl Unmarshal for $ty {
            fn unmarshal(is: &mut InputStream) -> Result<Self> {
                is.$read()
            }
        }
    };
}

primitive!(u8, write_u8, read_u8);
primitive!(bool, write_bool, read_bool);
primitive!(i16, write_i16, read_i16);
primitive!(i32, write_i32, read_i32);
primitive!(i64, write_i64, read_i64);
primitive!(f32, write_f32, read_f32);
primitive!(f64, write_f64, read_f64);

impl Marshal for str {
    fn marshal(&self, os: &mut OutputStream) {
        os.write_string(self);
    }
}

impl Marshal for String {
    fn marshal(&self, os: &mut OutputStream) {
        os.write_string(self);
    }
}

impl Unmarshal for String {
    fn unmarshal(is: &mut InputStream) -> Result<Self> {
        is.read_string()
    }
}

impl<T: Marshal> Marshal for [T] {
    fn marshal(&self, os: &mut OutputStream) {
        os.write_size(self.len());
        for item in self {
            item.marshal(os);
        }
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, os: &mut OutputStream) {
        self.as_slice().marshal(os);
    }
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(is: &mut InputStream) -> Result<Self> {
        let n = is.read_seq_size(1)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(T::unmarshal(is)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_roundtrip() {
        let values = vec![1i32, -2, 3];
        let mut os = OutputStream::new();
        os.write(&values);
        let mut is = InputStream::new(os.finished());
        assert_eq!(is.read::<Vec<i32>>().unwrap(), values);
    }

    #[test]
    fn test_str_and_string_encode_identically() {
        let mut a = OutputStream::new();
        a.write("x");
        let mut b = OutputStream::new();
        b.write(&"x".to_string());
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
