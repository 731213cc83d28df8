//! Bounded reader over one field's bytes.

use crate::error::{Error, Result};

/// Reader confined to the declared length of a single field.
///
/// Handlers can never read past the field boundary; whatever they leave
/// unread is skipped by the caller, which always advances by the declared
/// length.
#[derive(Debug, Clone)]
pub struct FieldCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

macro_rules! cursor_read {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(arr))
        }
    };
}

impl<'a> FieldCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Declared length of the field.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the field boundary.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Decode(format!(
                "field truncated: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    cursor_read!(read_i16, i16);
    cursor_read!(read_i32, i32);
    cursor_read!(read_i64, i64);
    cursor_read!(read_u32, u32);
    cursor_read!(read_f32, f32);
    cursor_read!(read_f64, f64);

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Consume everything up to the field boundary.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Split off the next `n` bytes as a nested field, advancing past them
    /// regardless of how much of the nested field is later read.
    pub fn sub_field(&mut self, n: usize) -> Result<FieldCursor<'a>> {
        self.take(n).map(FieldCursor::new)
    }
}
